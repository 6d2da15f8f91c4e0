pub mod claude;
pub mod classify;
pub mod codex;
pub mod stream;

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::WiggumConfig;
use crate::error::OrchError;
use crate::process::{CapturePaths, Invocation, InvocationOutcome, InvokeControls, TIMEOUT_EXIT_CODE};
use crate::types::ExitClass;

pub use claude::ClaudeBackend;
pub use codex::CodexBackend;

/// How an invocation relates to earlier conversations with the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionPlan {
    /// New conversation, id chosen by the agent.
    Fresh,
    /// New conversation under an id we picked, so a retry can resume it.
    CreateNamed(String),
    Resume(String),
    /// Resume whatever conversation the agent ran last in this workspace.
    ResumeLatest,
}

impl SessionPlan {
    pub fn is_resume(&self) -> bool {
        matches!(self, SessionPlan::Resume(_) | SessionPlan::ResumeLatest)
    }

    /// Session id known before the agent runs.
    pub fn known_session_id(&self) -> Option<&str> {
        match self {
            SessionPlan::CreateNamed(id) | SessionPlan::Resume(id) => Some(id),
            SessionPlan::Fresh | SessionPlan::ResumeLatest => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationRequest {
    pub workspace: PathBuf,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_turns: u32,
    pub session: SessionPlan,
}

/// Usage signal from the agent vendor. CLIs that expose none report `Unknown`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitStatus {
    Unknown,
    Available,
    Limited { until: Option<DateTime<Utc>> },
}

/// One coding-agent CLI the orchestrator can drive.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Verify the CLI is installed and runnable. Failure halts the run.
    fn init(&self) -> Result<(), OrchError>;

    fn build_invocation(&self, request: &InvocationRequest) -> Invocation;

    fn invoke(
        &self,
        invocation: &Invocation,
        capture: &CapturePaths,
        controls: InvokeControls,
    ) -> impl Future<Output = Result<InvocationOutcome, OrchError>> + Send;

    fn classify_exit_code(&self, code: i32, stderr: &str) -> ExitClass {
        classify::classify_exit(code, stderr)
    }

    fn extract_text(&self, stdout: &str) -> String {
        stream::extract_final_text(stdout)
    }

    fn extract_session_id(&self, stdout: &str) -> String;

    fn supports_sessions(&self) -> bool;

    fn supports_named_session_creation(&self) -> bool;

    fn rate_limit_status(&self) -> RateLimitStatus {
        RateLimitStatus::Unknown
    }

    fn wait_for_rate_limit_window(&self, cooldown: Duration) -> impl Future<Output = ()> + Send;
}

/// Concatenation used by CLIs with a single prompt channel.
pub fn combine_prompts(system_prompt: &str, user_prompt: &str) -> String {
    if system_prompt.trim().is_empty() {
        user_prompt.to_string()
    } else {
        format!("{}\n\n---\n\n{}", system_prompt.trim_end(), user_prompt)
    }
}

/// Run `<binary> --version` to prove the CLI is on PATH.
pub(crate) fn verify_binary(display_name: &str, binary: &str) -> Result<String, OrchError> {
    let output = std::process::Command::new(binary)
        .arg("--version")
        .output()
        .map_err(|e| {
            OrchError::BackendUnavailable(format!("{} ({}) not found: {}", display_name, binary, e))
        })?;

    if !output.status.success() {
        return Err(OrchError::BackendUnavailable(format!(
            "{} found but `{} --version` failed",
            display_name, binary
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// The backends selectable from configuration.
pub enum AnyBackend {
    Claude(ClaudeBackend),
    Codex(CodexBackend),
}

impl AnyBackend {
    pub fn from_config(config: &WiggumConfig) -> Result<Self, OrchError> {
        let binary = config.backend_binary();
        let model = config.backend_model();
        match config.backend.name.as_str() {
            "claude" => Ok(AnyBackend::Claude(ClaudeBackend::new(binary, model))),
            "codex" => Ok(AnyBackend::Codex(CodexBackend::new(binary, model))),
            other => Err(OrchError::Config(format!("Unknown backend '{}'", other))),
        }
    }
}

impl Backend for AnyBackend {
    fn name(&self) -> &str {
        match self {
            AnyBackend::Claude(b) => b.name(),
            AnyBackend::Codex(b) => b.name(),
        }
    }

    fn init(&self) -> Result<(), OrchError> {
        match self {
            AnyBackend::Claude(b) => b.init(),
            AnyBackend::Codex(b) => b.init(),
        }
    }

    fn build_invocation(&self, request: &InvocationRequest) -> Invocation {
        match self {
            AnyBackend::Claude(b) => b.build_invocation(request),
            AnyBackend::Codex(b) => b.build_invocation(request),
        }
    }

    fn invoke(
        &self,
        invocation: &Invocation,
        capture: &CapturePaths,
        controls: InvokeControls,
    ) -> impl Future<Output = Result<InvocationOutcome, OrchError>> + Send {
        crate::process::run_supervised(invocation, capture, controls)
    }

    fn extract_session_id(&self, stdout: &str) -> String {
        match self {
            AnyBackend::Claude(b) => b.extract_session_id(stdout),
            AnyBackend::Codex(b) => b.extract_session_id(stdout),
        }
    }

    fn supports_sessions(&self) -> bool {
        match self {
            AnyBackend::Claude(b) => b.supports_sessions(),
            AnyBackend::Codex(b) => b.supports_sessions(),
        }
    }

    fn supports_named_session_creation(&self) -> bool {
        match self {
            AnyBackend::Claude(b) => b.supports_named_session_creation(),
            AnyBackend::Codex(b) => b.supports_named_session_creation(),
        }
    }

    fn wait_for_rate_limit_window(&self, cooldown: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(cooldown)
    }
}

// --- Mock ---

/// One scripted agent attempt for `MockBackend`.
#[derive(Clone, Debug, PartialEq)]
pub struct MockStep {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Simulated run time. Longer than the invocation timeout reports exit 124.
    pub delay: Duration,
    /// Files `(relative path, contents)` written into the workspace when the
    /// step runs to completion.
    pub writes: Vec<(String, String)>,
    /// Only serve invocations whose arguments contain this text.
    pub only_for: Option<String>,
}

impl MockStep {
    pub fn success(text: &str) -> Self {
        Self::success_with_session(text, "")
    }

    pub fn success_with_session(text: &str, session_id: &str) -> Self {
        let result = serde_json::json!({
            "type": "result",
            "result": text,
            "session_id": session_id,
        });
        Self {
            exit_code: 0,
            stdout: format!("{}\n", result),
            stderr: String::new(),
            delay: Duration::ZERO,
            writes: Vec::new(),
            only_for: None,
        }
    }

    pub fn exit(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            delay: Duration::ZERO,
            writes: Vec::new(),
            only_for: None,
        }
    }

    pub fn hang(delay: Duration) -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            delay,
            writes: Vec::new(),
            only_for: None,
        }
    }

    pub fn writing(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }

    pub fn only_for(mut self, needle: &str) -> Self {
        self.only_for = Some(needle.to_string());
        self
    }

    fn serves(&self, invocation: &Invocation) -> bool {
        self.only_for
            .as_deref()
            .map_or(true, |needle| invocation.args.iter().any(|a| a.contains(needle)))
    }
}

/// Scripted backend for lifecycle and scheduler tests.
///
/// Each `invoke` consumes the next step, writing its output to the capture
/// files. Every built request is recorded for inspection.
pub struct MockBackend {
    steps: Mutex<VecDeque<MockStep>>,
    requests: Mutex<Vec<InvocationRequest>>,
    rate_limit_waits: Mutex<Vec<Duration>>,
    sessions: bool,
    named_sessions: bool,
    available: bool,
    rate_limit: RateLimitStatus,
}

impl MockBackend {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            rate_limit_waits: Mutex::new(Vec::new()),
            sessions: true,
            named_sessions: true,
            available: true,
            rate_limit: RateLimitStatus::Unknown,
        }
    }

    pub fn with_sessions(mut self, sessions: bool, named: bool) -> Self {
        self.sessions = sessions;
        self.named_sessions = named;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_rate_limit(mut self, status: RateLimitStatus) -> Self {
        self.rate_limit = status;
        self
    }

    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn rate_limit_waits(&self) -> Vec<Duration> {
        self.rate_limit_waits
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// First scripted step that serves this invocation.
    fn next_step(&self, invocation: &Invocation) -> MockStep {
        self.steps
            .lock()
            .ok()
            .and_then(|mut steps| {
                let idx = steps.iter().position(|s| s.serves(invocation))?;
                steps.remove(idx)
            })
            .unwrap_or_else(|| MockStep::exit(2, "MockBackend: no more scripted steps"))
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn init(&self) -> Result<(), OrchError> {
        if self.available {
            Ok(())
        } else {
            Err(OrchError::BackendUnavailable("mock backend disabled".to_string()))
        }
    }

    fn build_invocation(&self, request: &InvocationRequest) -> Invocation {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let session = match &request.session {
            SessionPlan::Fresh => "fresh".to_string(),
            SessionPlan::CreateNamed(id) => format!("create:{}", id),
            SessionPlan::Resume(id) => format!("resume:{}", id),
            SessionPlan::ResumeLatest => "resume:last".to_string(),
        };
        Invocation {
            program: "mock-agent".to_string(),
            args: vec![session, request.user_prompt.clone()],
            cwd: request.workspace.clone(),
            env: Vec::new(),
        }
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        capture: &CapturePaths,
        controls: InvokeControls,
    ) -> Result<InvocationOutcome, OrchError> {
        if !self.available {
            return Err(OrchError::BackendUnavailable("mock backend disabled".to_string()));
        }
        let step = self.next_step(invocation);
        let started = std::time::Instant::now();

        for path in [&capture.stdout, &capture.stderr] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OrchError::Spawn(e.to_string()))?;
            }
        }
        tokio::fs::write(&capture.stdout, &step.stdout)
            .await
            .map_err(|e| OrchError::Spawn(e.to_string()))?;
        tokio::fs::write(&capture.stderr, &step.stderr)
            .await
            .map_err(|e| OrchError::Spawn(e.to_string()))?;

        if let Some(tx) = controls.on_spawn {
            let _ = tx.send(std::process::id());
        }

        let (exit_code, timed_out, cancelled) = tokio::select! {
            _ = tokio::time::sleep(step.delay) => (step.exit_code, false, false),
            _ = tokio::time::sleep(controls.timeout) => (TIMEOUT_EXIT_CODE, true, false),
            _ = controls.cancel.cancelled() => (143, false, true),
        };

        if !timed_out && !cancelled {
            for (relative, contents) in &step.writes {
                let path = invocation.cwd.join(relative);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| OrchError::Spawn(e.to_string()))?;
                }
                tokio::fs::write(&path, contents)
                    .await
                    .map_err(|e| OrchError::Spawn(e.to_string()))?;
            }
        }

        Ok(InvocationOutcome {
            exit_code,
            elapsed: started.elapsed(),
            stdout_path: capture.stdout.clone(),
            stderr_path: capture.stderr.clone(),
            pid: None,
            timed_out,
            cancelled,
        })
    }

    fn extract_session_id(&self, stdout: &str) -> String {
        stream::find_session_id(stdout, &["session_id", "thread_id"])
    }

    fn supports_sessions(&self) -> bool {
        self.sessions
    }

    fn supports_named_session_creation(&self) -> bool {
        self.named_sessions
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limit.clone()
    }

    fn wait_for_rate_limit_window(&self, cooldown: Duration) -> impl Future<Output = ()> + Send {
        if let Ok(mut waits) = self.rate_limit_waits.lock() {
            waits.push(cooldown);
        }
        std::future::ready(())
    }
}
