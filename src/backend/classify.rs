use std::sync::OnceLock;

use regex::Regex;

use crate::process::TIMEOUT_EXIT_CODE;
use crate::types::{ExitClass, RetryCause};

/// Exit code agent CLIs use for any runtime failure.
pub const GENERIC_ERROR_EXIT_CODE: i32 = 1;

static RATE_LIMIT_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
static NETWORK_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn rate_limit_patterns() -> &'static [Regex] {
    RATE_LIMIT_PATTERNS.get_or_init(|| {
        compile(&[
            // Word boundary keeps ids such as "ses_429f..." from matching
            r"\b429\b",
            r"(?i)rate[_\-\s]?limit(ed|ing)?",
            r"(?i)too\s+many\s+requests",
            r"(?i)quota\s*(exceeded|limit)",
            r"(?i)usage\s+limit",
            r"(?i)\boverloaded\b",
        ])
    })
}

fn network_patterns() -> &'static [Regex] {
    NETWORK_PATTERNS.get_or_init(|| {
        compile(&[
            r"(?i)connection\s+refused",
            r"(?i)connection\s+reset",
            r"(?i)\btimed?\s*out\b",
            r"(?i)could\s+not\s+resolve\s+host",
            r"(?i)getaddrinfo",
            r"(?i)name\s+resolution",
            r"(?i)temporary\s+failure\s+in\s+name",
            r"ECONNRESET",
            r"ECONNREFUSED",
            r"ETIMEDOUT",
            r"ENOTFOUND",
        ])
    })
}

pub fn looks_rate_limited(stderr: &str) -> bool {
    rate_limit_patterns().iter().any(|re| re.is_match(stderr))
}

pub fn looks_like_network_failure(stderr: &str) -> bool {
    network_patterns().iter().any(|re| re.is_match(stderr))
}

/// Decide whether a non-zero exit is worth retrying.
///
/// 124 is always a timeout. Exit 1 is retryable only when stderr names a
/// rate limit or a transient network failure. Anything else is fatal.
pub fn classify_exit(code: i32, stderr: &str) -> ExitClass {
    match code {
        TIMEOUT_EXIT_CODE => ExitClass::Retryable(RetryCause::Timeout),
        GENERIC_ERROR_EXIT_CODE if looks_rate_limited(stderr) => {
            ExitClass::Retryable(RetryCause::RateLimited)
        }
        GENERIC_ERROR_EXIT_CODE if looks_like_network_failure(stderr) => {
            ExitClass::Retryable(RetryCause::TransientNetwork)
        }
        _ => ExitClass::Fatal,
    }
}

/// Last non-empty stderr line, used as the failure reason in resume metadata.
pub fn failure_reason(code: i32, stderr: &str) -> String {
    let last = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no stderr output");
    let mut reason = format!("exit code {}: {}", code, last);
    if reason.len() > 500 {
        let mut cut = 500;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    reason
}
