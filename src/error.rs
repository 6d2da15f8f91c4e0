use std::time::Duration;

/// Orchestrator error taxonomy.
///
/// Categories:
/// - Halting: `BackendUnavailable`, `StatePersistenceFailure` stop the run loop
/// - Retryable: timeouts, rate limits and transient network failures of an agent
/// - Task-fatal: `FatalAgentError` marks the task failed, the run continues
/// - Control flow: `Conflict` requeues a task and is never surfaced to the operator
#[derive(Debug, thiserror::Error)]
pub enum OrchError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Agent invocation timed out after {0:?}")]
    InvocationTimeout(Duration),

    #[error("Agent rate limited: {0}")]
    RateLimited(String),

    #[error("Transient network error: {0}")]
    TransientNetworkError(String),

    #[error("Agent failed (exit code {exit_code}): {reason}")]
    FatalAgentError { exit_code: i32, reason: String },

    #[error("Footprint '{pattern}' conflicts with claim held by {worker_id}")]
    Conflict { pattern: String, worker_id: String },

    #[error("Task {0} already has an active worker")]
    TaskBusy(String),

    #[error("State persistence failure: {0}")]
    StatePersistenceFailure(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Kanban error: {0}")]
    Kanban(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl OrchError {
    /// Returns true if the failure is transient and the task should be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchError::InvocationTimeout(_)
                | OrchError::RateLimited(_)
                | OrchError::TransientNetworkError(_)
        )
    }

    /// Returns true if the orchestration loop must stop instead of continuing
    /// on possibly-stale state.
    pub fn halts_orchestration(&self) -> bool {
        matches!(
            self,
            OrchError::BackendUnavailable(_) | OrchError::StatePersistenceFailure(_)
        )
    }
}

/// Bridge for the `Result<T, String>` handlers in `main` and the git helpers.
impl From<OrchError> for String {
    fn from(err: OrchError) -> String {
        err.to_string()
    }
}
