use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use super::{stream, verify_binary, Backend, InvocationRequest, SessionPlan};
use crate::error::OrchError;
use crate::process::{run_supervised, CapturePaths, Invocation, InvocationOutcome, InvokeControls};
use crate::{log_debug, log_warn};

/// Claude Code CLI in non-interactive `-p` mode with stream-json output.
pub struct ClaudeBackend {
    binary: String,
    model: Option<String>,
}

impl ClaudeBackend {
    pub fn new(binary: String, model: Option<String>) -> Self {
        Self { binary, model }
    }

    fn credentials_hint(&self) -> Option<String> {
        if std::env::var_os("ANTHROPIC_API_KEY").is_some() {
            return None;
        }
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        if home.join(".claude").exists() {
            None
        } else {
            Some(format!(
                "no ANTHROPIC_API_KEY and no {} directory; `claude` may need to log in",
                home.join(".claude").display()
            ))
        }
    }
}

impl Backend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    fn init(&self) -> Result<(), OrchError> {
        let version = verify_binary("Claude CLI", &self.binary)?;
        log_debug!("[backend:claude] {}", version);
        if let Some(hint) = self.credentials_hint() {
            log_warn!("[backend:claude] {}", hint);
        }
        Ok(())
    }

    fn build_invocation(&self, request: &InvocationRequest) -> Invocation {
        let mut args = vec![
            "-p".to_string(),
            request.user_prompt.clone(),
            "--append-system-prompt".to_string(),
            request.system_prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            request.max_turns.to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        match &request.session {
            SessionPlan::Fresh => {}
            SessionPlan::CreateNamed(id) => {
                args.push("--session-id".to_string());
                args.push(id.clone());
            }
            SessionPlan::Resume(id) => {
                args.push("--resume".to_string());
                args.push(id.clone());
            }
            SessionPlan::ResumeLatest => args.push("--continue".to_string()),
        }

        args.push("--dangerously-skip-permissions".to_string());

        Invocation {
            program: self.binary.clone(),
            args,
            cwd: request.workspace.clone(),
            env: Vec::new(),
        }
    }

    fn invoke(
        &self,
        invocation: &Invocation,
        capture: &CapturePaths,
        controls: InvokeControls,
    ) -> impl Future<Output = Result<InvocationOutcome, OrchError>> + Send {
        run_supervised(invocation, capture, controls)
    }

    fn extract_session_id(&self, stdout: &str) -> String {
        stream::find_session_id(stdout, &["session_id"])
    }

    fn supports_sessions(&self) -> bool {
        true
    }

    fn supports_named_session_creation(&self) -> bool {
        true
    }

    fn wait_for_rate_limit_window(&self, cooldown: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(cooldown)
    }
}
