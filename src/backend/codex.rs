use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use super::{combine_prompts, stream, verify_binary, Backend, InvocationRequest, SessionPlan};
use crate::error::OrchError;
use crate::process::{run_supervised, CapturePaths, Invocation, InvocationOutcome, InvokeControls};
use crate::{log_debug, log_warn};

/// OpenAI Codex CLI driven through `codex exec --json`.
///
/// Codex has a single prompt channel and assigns its own thread ids, so the
/// system prompt is prepended to the user prompt and sessions can only be
/// resumed by a discovered id or `--last`.
pub struct CodexBackend {
    binary: String,
    model: Option<String>,
}

impl CodexBackend {
    pub fn new(binary: String, model: Option<String>) -> Self {
        Self { binary, model }
    }

    fn credentials_hint(&self) -> Option<String> {
        if std::env::var_os("OPENAI_API_KEY").is_some() {
            return None;
        }
        let auth = std::env::var_os("HOME")
            .map(PathBuf::from)?
            .join(".codex")
            .join("auth.json");
        if auth.exists() {
            None
        } else {
            Some(format!(
                "no OPENAI_API_KEY and no {}; `codex login` may be required",
                auth.display()
            ))
        }
    }
}

impl Backend for CodexBackend {
    fn name(&self) -> &str {
        "codex"
    }

    fn init(&self) -> Result<(), OrchError> {
        let version = verify_binary("Codex CLI", &self.binary)?;
        log_debug!("[backend:codex] {}", version);
        if let Some(hint) = self.credentials_hint() {
            log_warn!("[backend:codex] {}", hint);
        }
        Ok(())
    }

    fn build_invocation(&self, request: &InvocationRequest) -> Invocation {
        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--full-auto".to_string(),
            "--cd".to_string(),
            request.workspace.display().to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        match &request.session {
            // Codex cannot create a conversation under a caller-chosen id.
            SessionPlan::Fresh | SessionPlan::CreateNamed(_) => {}
            SessionPlan::Resume(id) => {
                args.push("resume".to_string());
                args.push(id.clone());
            }
            SessionPlan::ResumeLatest => {
                args.push("resume".to_string());
                args.push("--last".to_string());
            }
        }

        args.push(combine_prompts(&request.system_prompt, &request.user_prompt));

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
        stream::find_session_id(stdout, &["thread_id", "session_id"])
    }

    fn supports_sessions(&self) -> bool {
        true
    }

    fn supports_named_session_creation(&self) -> bool {
        false
    }

    fn wait_for_rate_limit_window(&self, cooldown: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(cooldown)
    }
}
