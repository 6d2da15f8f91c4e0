use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::backend::classify::failure_reason;
use crate::backend::{Backend, InvocationRequest, SessionPlan};
use crate::config::WiggumConfig;
use crate::coordinator::{CoordinatorHandle, DispatchTicket};
use crate::error::OrchError;
use crate::process::{read_capture, CapturePaths, InvokeControls};
use crate::prompt::{self, PromptParams};
use crate::types::{ExitClass, RetryCause, WorkerOutcome};
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{log_debug, log_info, log_warn};

/// The error a failed attempt maps to, for reporting.
fn attempt_error(class: ExitClass, exit_code: i32, reason: &str, timeout: Duration) -> OrchError {
    match class {
        ExitClass::Retryable(RetryCause::Timeout) => OrchError::InvocationTimeout(timeout),
        ExitClass::Retryable(RetryCause::RateLimited) => OrchError::RateLimited(reason.to_string()),
        ExitClass::Retryable(RetryCause::TransientNetwork) => {
            OrchError::TransientNetworkError(reason.to_string())
        }
        ExitClass::Fatal => OrchError::FatalAgentError {
            exit_code,
            reason: reason.to_string(),
        },
    }
}

/// Pick the session handling for an attempt.
///
/// First attempts open a named session when the backend can, so a later
/// retry can resume it by id. Retries resume the stored session, or the
/// backend's most recent one when no id was ever learned.
pub fn plan_session(
    is_retry: bool,
    stored_session: Option<&str>,
    supports_sessions: bool,
    supports_named_creation: bool,
) -> SessionPlan {
    if !supports_sessions {
        return SessionPlan::Fresh;
    }
    if !is_retry {
        return if supports_named_creation {
            SessionPlan::CreateNamed(uuid::Uuid::new_v4().to_string())
        } else {
            SessionPlan::Fresh
        };
    }
    match stored_session.filter(|s| !s.is_empty()) {
        Some(id) => SessionPlan::Resume(id.to_string()),
        None => SessionPlan::ResumeLatest,
    }
}

/// Runs single worker attempts end to end against one backend.
pub struct WorkerManager<B: Backend> {
    backend: Arc<B>,
    workspaces: WorkspaceManager,
    project_root: PathBuf,
    runtime_dir: PathBuf,
    limit: usize,
    timeout: Duration,
    max_turns: u32,
    rate_limit_cooldown: Duration,
}

impl<B: Backend + 'static> WorkerManager<B> {
    pub fn new(backend: Arc<B>, config: &WiggumConfig, project_root: &Path) -> Self {
        Self {
            backend,
            workspaces: WorkspaceManager::new(
                project_root.to_path_buf(),
                config.worktree_dir(project_root),
                config.project.trunk.clone(),
            ),
            project_root: project_root.to_path_buf(),
            runtime_dir: config.runtime_dir(project_root),
            limit: config.workers.limit as usize,
            timeout: config.invocation_timeout(),
            max_turns: config.workers.max_turns,
            rate_limit_cooldown: config.rate_limit_cooldown(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn has_capacity(&self, active: usize) -> bool {
        active < self.limit
    }

    /// Run one attempt of a dispatched worker and report how it ended.
    ///
    /// Agent failures come back as outcomes. `Err` is reserved for
    /// conditions that must stop the whole run.
    pub async fn run_attempt(
        &self,
        ticket: DispatchTicket,
        coordinator: CoordinatorHandle,
        cancel: CancellationToken,
    ) -> Result<WorkerOutcome, OrchError> {
        let worker_id = ticket.worker.worker_id.clone();
        let task_id = ticket.task.id.clone();

        // 1. Workspace
        let workspace = match self.acquire_workspace(&worker_id).await {
            Ok(ws) => ws,
            Err(e) => {
                return Ok(WorkerOutcome::Fatal {
                    reason: e.to_string(),
                    session_id: ticket.worker.session_id.clone(),
                })
            }
        };

        // 2. Session
        let is_retry = ticket.worker.iteration > 1 || ticket.resume.attempts > 0;
        let stored = ticket
            .worker
            .session_id
            .as_deref()
            .or(ticket.resume.session_id.as_deref());
        let session = plan_session(
            is_retry,
            stored,
            self.backend.supports_sessions(),
            self.backend.supports_named_session_creation(),
        );
        if let SessionPlan::CreateNamed(id) = &session {
            coordinator.record_session(&worker_id, id).await?;
        }
        log_info!(
            "[{}][{}] Starting attempt {} on {} ({})",
            task_id,
            worker_id,
            ticket.worker.iteration,
            self.backend.name(),
            if session.is_resume() { "resuming session" } else { "new session" }
        );
        log_debug!("[{}][{}] Session plan {:?}", task_id, worker_id, session);

        // 3. Prompts and invocation
        let plan_text = prompt::load_plan(&self.project_root, &ticket.task);
        let params = PromptParams {
            task: &ticket.task,
            worker_id: &worker_id,
            branch: &workspace.branch,
            trunk: self.workspaces.trunk(),
            plan_text: plan_text.as_deref(),
            resume: is_retry.then_some(&ticket.resume),
        };
        let request = InvocationRequest {
            workspace: workspace.path.clone(),
            system_prompt: prompt::build_system_prompt(&params),
            user_prompt: prompt::build_user_prompt(&params),
            max_turns: self.max_turns,
            session: session.clone(),
        };
        let invocation = self.backend.build_invocation(&request);
        let capture = CapturePaths::for_attempt(&self.runtime_dir, &worker_id, ticket.worker.iteration);

        // 4. Invoke, reporting the PID as soon as the child is up
        let (pid_tx, pid_rx) = oneshot::channel::<u32>();
        let pid_coordinator = coordinator.clone();
        let pid_worker = worker_id.clone();
        let pid_forwarder = tokio::spawn(async move {
            if let Ok(pid) = pid_rx.await {
                if let Err(e) = pid_coordinator.mark_running(&pid_worker, pid).await {
                    log_warn!("[{}] Failed to record pid {}: {}", pid_worker, pid, e);
                }
            }
        });

        let controls =
            InvokeControls::new(self.timeout, cancel.clone()).with_spawn_notifier(pid_tx);
        let invoked = self.backend.invoke(&invocation, &capture, controls).await;
        let _ = pid_forwarder.await;

        let outcome = match invoked {
            Ok(outcome) => outcome,
            Err(e @ OrchError::BackendUnavailable(_)) => return Err(e),
            Err(e) => {
                return Ok(WorkerOutcome::Fatal {
                    reason: e.to_string(),
                    session_id: session.known_session_id().map(str::to_string),
                })
            }
        };

        let stdout = read_capture(&outcome.stdout_path).await;
        let learned = self.backend.extract_session_id(&stdout);
        let session_id = if learned.is_empty() {
            session.known_session_id().map(str::to_string)
        } else {
            Some(learned)
        };

        // 5. Classify
        if outcome.cancelled {
            log_info!("[{}][{}] Cancelled", task_id, worker_id);
            return Ok(WorkerOutcome::Cancelled { session_id });
        }

        if outcome.exit_code == 0 {
            let text = self.backend.extract_text(&stdout);
            if !text.is_empty() {
                log_debug!("[{}][{}] Final message: {}", task_id, worker_id, text.trim());
            }
            let mergeable = self.finalize_workspace(&workspace, &task_id).await;
            log_info!(
                "[{}][{}] Succeeded in {}s{}",
                task_id,
                worker_id,
                outcome.elapsed.as_secs(),
                if mergeable { "" } else { " (no changes)" }
            );
            return Ok(WorkerOutcome::Succeeded {
                text,
                session_id,
                mergeable,
                elapsed: outcome.elapsed,
            });
        }

        let stderr = read_capture(&outcome.stderr_path).await;
        let reason = if outcome.timed_out {
            format!("timed out after {}s", self.timeout.as_secs())
        } else {
            failure_reason(outcome.exit_code, &stderr)
        };

        let class = self.backend.classify_exit_code(outcome.exit_code, &stderr);
        let error = attempt_error(class, outcome.exit_code, &reason, self.timeout);
        match class {
            ExitClass::Retryable(cause) => {
                log_warn!("[{}][{}] Retryable failure: {}", task_id, worker_id, error);
                if cause == RetryCause::RateLimited {
                    log_info!(
                        "[{}][{}] Rate limited, cooling down {}s",
                        task_id,
                        worker_id,
                        self.rate_limit_cooldown.as_secs()
                    );
                    tokio::select! {
                        _ = self.backend.wait_for_rate_limit_window(self.rate_limit_cooldown) => {}
                        _ = cancel.cancelled() => {
                            return Ok(WorkerOutcome::Cancelled { session_id });
                        }
                    }
                }
                Ok(WorkerOutcome::Retryable {
                    cause,
                    reason,
                    session_id,
                })
            }
            ExitClass::Fatal => {
                log_warn!("[{}][{}] {}", task_id, worker_id, error);
                Ok(WorkerOutcome::Fatal { reason, session_id })
            }
        }
    }

    async fn acquire_workspace(&self, worker_id: &str) -> Result<Workspace, OrchError> {
        let workspaces = self.workspaces.clone();
        let worker_id = worker_id.to_string();
        tokio::task::spawn_blocking(move || workspaces.acquire(&worker_id))
            .await
            .map_err(|e| OrchError::Workspace(format!("workspace task panicked: {}", e)))?
    }

    /// Commit leftovers and report whether the branch has anything to merge.
    async fn finalize_workspace(&self, workspace: &Workspace, task_id: &str) -> bool {
        let workspaces = self.workspaces.clone();
        let workspace = workspace.clone();
        let message = format!("[{}] Agent changes", task_id);
        let result =
            tokio::task::spawn_blocking(move || workspaces.finalize(&workspace, &message)).await;
        match result {
            Ok(Ok(mergeable)) => mergeable,
            Ok(Err(e)) => {
                log_warn!("[{}] Could not inspect worktree: {}", task_id, e);
                false
            }
            Err(e) => {
                log_debug!("[{}] finalize task panicked: {}", task_id, e);
                false
            }
        }
    }
}
