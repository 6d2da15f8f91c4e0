use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::config::RetryConfig;
use crate::conflict::ConflictRegistry;
use crate::error::OrchError;
use crate::kanban::{self, KanbanFile};
use crate::merge::MergeCandidate;
use crate::state::{OrchestratorState, StateStore};
use crate::types::{
    ClaimRef, DispatchOrder, ResumeMeta, Task, TaskStatus, WorkerOutcome, WorkerRecord,
    WorkerStatus,
};
use crate::workspace::branch_for;
use crate::{log_debug, log_error, log_info, log_warn};

// --- Snapshot ---

/// Read-only copy of everything the scheduler ranks against.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub tick: u64,
    pub tasks: Vec<Task>,
    pub resume: BTreeMap<String, ResumeMeta>,
    pub registry: ConflictRegistry,
    pub workers: Vec<WorkerRecord>,
    pub first_seen: BTreeMap<String, DateTime<Utc>>,
}

impl Snapshot {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn resume_for(&self, task_id: &str) -> ResumeMeta {
        self.resume.get(task_id).cloned().unwrap_or_default()
    }

    /// When a task should be considered created: its kanban stamp, else the
    /// first time the orchestrator saw it.
    pub fn created_at(&self, task: &Task) -> Option<DateTime<Utc>> {
        task.created.or_else(|| self.first_seen.get(&task.id).copied())
    }

    pub fn has_active_worker(&self, task_id: &str) -> bool {
        self.workers
            .iter()
            .any(|w| w.task_id == task_id && w.status.is_active())
    }

    /// Worker parked in `awaiting_retry` for a task, reused by its next attempt.
    pub fn retry_worker(&self, task_id: &str) -> Option<&WorkerRecord> {
        self.workers
            .iter()
            .find(|w| w.task_id == task_id && w.status == WorkerStatus::AwaitingRetry)
    }
}

/// What a worker needs to start once the coordinator accepted a dispatch.
#[derive(Clone, Debug)]
pub struct DispatchTicket {
    pub worker: WorkerRecord,
    pub task: Task,
    pub resume: ResumeMeta,
}

/// Side effects of applying a worker outcome that the caller acts on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutcomeEffect {
    pub task_status: TaskStatus,
    /// Queued tasks whose blocking claims went away.
    pub freed: Vec<String>,
    pub merge: Option<MergeCandidate>,
}

// --- Command enum ---

pub enum CoordinatorCommand {
    GetSnapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    BeginPass {
        reply: oneshot::Sender<Result<u64, OrchError>>,
    },
    Dispatch {
        order: DispatchOrder,
        reply: oneshot::Sender<Result<DispatchTicket, OrchError>>,
    },
    Defer {
        task_id: String,
        footprint: Vec<String>,
        blocking: ClaimRef,
        reply: oneshot::Sender<Result<(), OrchError>>,
    },
    MarkRunning {
        worker_id: String,
        pid: u32,
        reply: oneshot::Sender<Result<(), OrchError>>,
    },
    RecordSession {
        worker_id: String,
        session_id: String,
        reply: oneshot::Sender<Result<(), OrchError>>,
    },
    ApplyOutcome {
        worker_id: String,
        outcome: WorkerOutcome,
        reply: oneshot::Sender<Result<OutcomeEffect, OrchError>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), OrchError>>,
    },
}

// --- CoordinatorHandle ---

#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    async fn send_command<T>(
        &self,
        command: CoordinatorCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, OrchError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| OrchError::Shutdown)?;
        rx.await.map_err(|_| OrchError::Shutdown)
    }

    pub async fn get_snapshot(&self) -> Result<Snapshot, OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::GetSnapshot { reply }, rx)
            .await
    }

    /// Advance the pass counter. Returns the new tick.
    pub async fn begin_pass(&self) -> Result<u64, OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::BeginPass { reply }, rx)
            .await?
    }

    pub async fn dispatch(&self, order: DispatchOrder) -> Result<DispatchTicket, OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::Dispatch { order, reply }, rx)
            .await?
    }

    pub async fn defer(
        &self,
        task_id: &str,
        footprint: Vec<String>,
        blocking: ClaimRef,
    ) -> Result<(), OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::Defer {
                task_id: task_id.to_string(),
                footprint,
                blocking,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn mark_running(&self, worker_id: &str, pid: u32) -> Result<(), OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::MarkRunning {
                worker_id: worker_id.to_string(),
                pid,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn record_session(&self, worker_id: &str, session_id: &str) -> Result<(), OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::RecordSession {
                worker_id: worker_id.to_string(),
                session_id: session_id.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn apply_outcome(
        &self,
        worker_id: &str,
        outcome: WorkerOutcome,
    ) -> Result<OutcomeEffect, OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::ApplyOutcome {
                worker_id: worker_id.to_string(),
                outcome,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn flush(&self) -> Result<(), OrchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::Flush { reply }, rx)
            .await?
    }
}

// --- Pure helpers ---

const MAX_STORED_OUTPUT_CHARS: usize = 4000;

fn tail_chars(text: &str, max: usize) -> String {
    let skip = text.chars().count().saturating_sub(max);
    text.chars().skip(skip).collect()
}

/// Register a dispatch: claim the footprint, create or revive the worker
/// record and move the task to `in_progress`.
///
/// A footprint conflict leaves state untouched apart from queueing the task.
pub fn apply_dispatch(
    state: &mut OrchestratorState,
    kanban: &mut KanbanFile,
    order: &DispatchOrder,
    backend: &str,
    worktree_dir: &std::path::Path,
    now: DateTime<Utc>,
) -> Result<DispatchTicket, OrchError> {
    let task = kanban
        .find(&order.task_id)
        .cloned()
        .ok_or_else(|| OrchError::Kanban(format!("Task {} not found in kanban", order.task_id)))?;

    if state.has_active_worker(&task.id) {
        return Err(OrchError::TaskBusy(task.id.clone()));
    }

    let retry_worker_id = state
        .workers
        .iter()
        .find(|w| w.task_id == task.id && w.status == WorkerStatus::AwaitingRetry)
        .map(|w| w.worker_id.clone());
    let worker_id = retry_worker_id
        .clone()
        .unwrap_or_else(|| order.worker_id.clone());

    if let Err(err) = state
        .registry
        .claim(&task.footprint, &worker_id, &task.id, now)
    {
        if let OrchError::Conflict {
            pattern,
            worker_id: holder,
        } = &err
        {
            let blocking = state
                .registry
                .claims()
                .iter()
                .find(|c| &c.worker_id == holder && &c.pattern == pattern)
                .map(|c| c.as_ref())
                .unwrap_or(ClaimRef {
                    worker_id: holder.clone(),
                    task_id: String::new(),
                    pattern: pattern.clone(),
                });
            state
                .registry
                .enqueue(&task.id, &task.footprint, blocking, now);
        }
        return Err(err);
    }
    state.registry.dequeue(&task.id);

    let worker = match retry_worker_id {
        Some(id) => {
            let record = state
                .worker_mut(&id)
                .ok_or_else(|| OrchError::Workspace(format!("Worker {} vanished", id)))?;
            record.iteration += 1;
            record.status = WorkerStatus::Spawned;
            record.pid = None;
            record.started_at = now;
            record.clone()
        }
        None => {
            let record = WorkerRecord {
                worker_id: worker_id.clone(),
                task_id: task.id.clone(),
                workspace: worktree_dir.join(&worker_id),
                backend: backend.to_string(),
                pid: None,
                started_at: now,
                session_id: None,
                iteration: 1,
                status: WorkerStatus::Spawned,
            };
            state.workers.push(record.clone());
            record
        }
    };

    kanban
        .set_status(&task.id, TaskStatus::InProgress)
        .map_err(OrchError::Kanban)?;
    let mut task = task;
    task.status = TaskStatus::InProgress;

    Ok(DispatchTicket {
        resume: state.resume_for(&task.id),
        worker,
        task,
    })
}

/// Apply a worker's terminal outcome to the task, its resume metadata, the
/// worker record and the claim registry.
pub fn apply_outcome(
    state: &mut OrchestratorState,
    kanban: &mut KanbanFile,
    worker_id: &str,
    outcome: &WorkerOutcome,
    retry: &RetryConfig,
    now: DateTime<Utc>,
) -> Result<OutcomeEffect, OrchError> {
    let worker = state
        .worker(worker_id)
        .cloned()
        .ok_or_else(|| OrchError::Workspace(format!("Unknown worker {}", worker_id)))?;
    let task_id = worker.task_id.clone();

    let session_id = outcome
        .session_id()
        .map(str::to_string)
        .or_else(|| worker.session_id.clone());

    let (task_status, worker_status) = {
        let resume = state.resume_mut(&task_id);
        if session_id.is_some() {
            resume.session_id = session_id.clone();
        }
        resume.workspace = Some(worker.workspace.clone());

        match outcome {
            WorkerOutcome::Succeeded { text, .. } => {
                resume.earliest_retry = None;
                let text = text.trim();
                resume.last_output =
                    (!text.is_empty()).then(|| tail_chars(text, MAX_STORED_OUTPUT_CHARS));
                (TaskStatus::Done, WorkerStatus::Succeeded)
            }
            WorkerOutcome::Retryable { cause, reason, .. } => {
                resume.attempts += 1;
                resume.last_failure = Some(format!("{}: {}", cause, reason));
                resume.last_failed_at = Some(now);
                let interval = chrono::Duration::from_std(std::time::Duration::from_secs(
                    retry.min_retry_interval_secs,
                ))
                .unwrap_or_else(|_| chrono::Duration::days(1));
                resume.earliest_retry = now.checked_add_signed(interval).or(Some(now));
                if resume.attempts >= retry.max_skip_retries {
                    (TaskStatus::Failed, WorkerStatus::Failed)
                } else {
                    (TaskStatus::Pending, WorkerStatus::AwaitingRetry)
                }
            }
            WorkerOutcome::Fatal { reason, .. } => {
                resume.last_failure = Some(reason.clone());
                resume.last_failed_at = Some(now);
                (TaskStatus::Failed, WorkerStatus::Failed)
            }
            WorkerOutcome::Cancelled { .. } => (TaskStatus::Pending, WorkerStatus::Abandoned),
        }
    };

    let duration = match outcome {
        WorkerOutcome::Succeeded { elapsed, .. } => Some(*elapsed),
        WorkerOutcome::Retryable { .. } | WorkerOutcome::Fatal { .. } => {
            Some((now - worker.started_at).to_std().unwrap_or_default())
        }
        WorkerOutcome::Cancelled { .. } => None,
    };
    if let Some(duration) = duration {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        state
            .metrics
            .entry(task_id.clone())
            .or_default()
            .record(ms, task_status == TaskStatus::Done);
    }

    if let Some(record) = state.worker_mut(worker_id) {
        record.status = worker_status;
        record.pid = None;
        if session_id.is_some() {
            record.session_id = session_id.clone();
        }
    }

    let freed = state.registry.release(worker_id);
    kanban
        .set_status(&task_id, task_status)
        .map_err(OrchError::Kanban)?;

    let merge = match outcome {
        WorkerOutcome::Succeeded {
            mergeable: true, ..
        } => Some(MergeCandidate {
            task_id: task_id.clone(),
            worker_id: worker_id.to_string(),
            branch: branch_for(worker_id),
            workspace: worker.workspace.clone(),
            footprint: kanban
                .find(&task_id)
                .map(|t| t.footprint.clone())
                .unwrap_or_default(),
            completed_at: now,
        }),
        _ => None,
    };

    Ok(OutcomeEffect {
        task_status,
        freed,
        merge,
    })
}

/// Operator reset of a `failed` or `blocked` task: back to `pending` with
/// its retry history cleared. Any parked worker is abandoned.
pub fn reset_task(
    state: &mut OrchestratorState,
    kanban: &mut KanbanFile,
    task_id: &str,
) -> Result<(), String> {
    let task = kanban
        .find_mut(task_id)
        .ok_or_else(|| format!("Task {} not found in kanban", task_id))?;

    match task.status {
        TaskStatus::Failed | TaskStatus::Blocked => {}
        other => {
            return Err(format!(
                "Task {} is {}; only failed or blocked tasks can be reset",
                task_id, other
            ))
        }
    }
    task.status = TaskStatus::Pending;

    state.resume.remove(task_id);
    state.registry.dequeue(task_id);
    let parked: Vec<String> = state
        .workers
        .iter()
        .filter(|w| w.task_id == task_id && !w.status.is_terminal())
        .map(|w| w.worker_id.clone())
        .collect();
    for worker_id in parked {
        if let Some(worker) = state.worker_mut(&worker_id) {
            worker.status = WorkerStatus::Abandoned;
        }
        state.registry.release(&worker_id);
    }
    Ok(())
}

// --- Coordinator actor ---

const CHANNEL_CAPACITY: usize = 32;

/// Static inputs of the coordinator actor.
pub struct CoordinatorConfig {
    pub kanban_path: PathBuf,
    pub worktree_dir: PathBuf,
    pub backend: String,
    pub retry: RetryConfig,
}

struct CoordinatorState {
    kanban: KanbanFile,
    state: OrchestratorState,
    store: StateStore,
    config: CoordinatorConfig,
    kanban_dirty: bool,
}

impl CoordinatorState {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            tick: self.state.tick,
            tasks: self.kanban.tasks.clone(),
            resume: self.state.resume.clone(),
            registry: self.state.registry.clone(),
            workers: self.state.workers.clone(),
            first_seen: self.state.first_seen.clone(),
        }
    }

    /// Persist the state document and, if a status changed, the kanban.
    ///
    /// The state is staged first and only renamed into place once the kanban
    /// write succeeded, so a failed kanban write leaves both files as they were.
    fn flush(&mut self) -> Result<(), OrchError> {
        let staged = self.store.stage(&mut self.state)?;
        if self.kanban_dirty {
            kanban::save(&self.config.kanban_path, &self.kanban).map_err(OrchError::Kanban)?;
            self.kanban_dirty = false;
        }
        staged.commit()
    }
}

/// Apply and persist a dispatch as one unit. If either file cannot be
/// written the in-memory state is restored and the failure halts the run.
fn handle_dispatch(
    state: &mut CoordinatorState,
    order: &DispatchOrder,
) -> Result<DispatchTicket, OrchError> {
    let before = (state.state.clone(), state.kanban.clone());
    let result = apply_dispatch(
        &mut state.state,
        &mut state.kanban,
        order,
        &state.config.backend,
        &state.config.worktree_dir,
        Utc::now(),
    );
    let persisted = match &result {
        Ok(_) => {
            state.kanban_dirty = true;
            state.flush()
        }
        // The task was queued behind the conflicting claim.
        Err(OrchError::Conflict { .. }) => state.flush(),
        Err(_) => Ok(()),
    };

    if let Err(e) = persisted {
        let (saved_state, saved_kanban) = before;
        state.state = saved_state;
        state.kanban = saved_kanban;
        // The kanban on disk may hold the rolled-back status.
        state.kanban_dirty = true;
        log_error!("[state] Dispatch of {} rolled back: {}", order.task_id, e);
        return Err(match e {
            OrchError::Kanban(msg) => OrchError::StatePersistenceFailure(msg),
            other => other,
        });
    }
    result
}

fn handle_apply_outcome(
    state: &mut CoordinatorState,
    worker_id: &str,
    outcome: &WorkerOutcome,
) -> Result<OutcomeEffect, OrchError> {
    let effect = apply_outcome(
        &mut state.state,
        &mut state.kanban,
        worker_id,
        outcome,
        &state.config.retry,
        Utc::now(),
    )?;
    state.kanban_dirty = true;
    state.flush()?;
    Ok(effect)
}

fn handle_worker_update<F>(
    state: &mut CoordinatorState,
    worker_id: &str,
    update: F,
) -> Result<(), OrchError>
where
    F: FnOnce(&mut WorkerRecord),
{
    let worker = state
        .state
        .worker_mut(worker_id)
        .ok_or_else(|| OrchError::Workspace(format!("Unknown worker {}", worker_id)))?;
    update(worker);
    state.flush()
}

async fn run_coordinator(
    mut rx: mpsc::Receiver<CoordinatorCommand>,
    kanban: KanbanFile,
    orchestrator_state: OrchestratorState,
    store: StateStore,
    config: CoordinatorConfig,
) {
    let mut state = CoordinatorState {
        kanban,
        state: orchestrator_state,
        store,
        config,
        kanban_dirty: false,
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            CoordinatorCommand::GetSnapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
            CoordinatorCommand::BeginPass { reply } => {
                state.state.tick += 1;
                let tick = state.state.tick;
                let added = state.state.note_tasks(&state.kanban.tasks, Utc::now());
                if added > 0 {
                    log_debug!("[state] {} new task(s) in backlog", added);
                }
                let _ = reply.send(state.flush().map(|_| tick));
            }
            CoordinatorCommand::Dispatch { order, reply } => {
                let result = handle_dispatch(&mut state, &order);
                if let Ok(ticket) = &result {
                    log_info!(
                        "[{}][{}] Dispatched (iteration {})",
                        ticket.task.id,
                        ticket.worker.worker_id,
                        ticket.worker.iteration
                    );
                }
                let _ = reply.send(result);
            }
            CoordinatorCommand::Defer {
                task_id,
                footprint,
                blocking,
                reply,
            } => {
                log_debug!(
                    "[conflict] {} queued behind {} ({})",
                    task_id,
                    blocking.worker_id,
                    blocking.pattern
                );
                state
                    .state
                    .registry
                    .enqueue(&task_id, &footprint, blocking, Utc::now());
                let _ = reply.send(state.flush());
            }
            CoordinatorCommand::MarkRunning {
                worker_id,
                pid,
                reply,
            } => {
                let result = handle_worker_update(&mut state, &worker_id, |w| {
                    if w.status == WorkerStatus::Spawned {
                        w.status = WorkerStatus::Running;
                    }
                    w.pid = Some(pid);
                });
                let _ = reply.send(result);
            }
            CoordinatorCommand::RecordSession {
                worker_id,
                session_id,
                reply,
            } => {
                let task_id = state.state.worker(&worker_id).map(|w| w.task_id.clone());
                if let Some(task_id) = task_id {
                    state.state.resume_mut(&task_id).session_id = Some(session_id.clone());
                }
                let result = handle_worker_update(&mut state, &worker_id, |w| {
                    w.session_id = Some(session_id);
                });
                let _ = reply.send(result);
            }
            CoordinatorCommand::ApplyOutcome {
                worker_id,
                outcome,
                reply,
            } => {
                let result = handle_apply_outcome(&mut state, &worker_id, &outcome);
                if let Err(e) = &result {
                    log_error!("[{}] Failed to apply {}: {}", worker_id, outcome.label(), e);
                }
                let _ = reply.send(result);
            }
            CoordinatorCommand::Flush { reply } => {
                let _ = reply.send(state.flush());
            }
        }
    }

    // All handles dropped: persist whatever is in memory one last time.
    if let Err(e) = state.flush() {
        log_warn!("[state] Final flush failed: {}", e);
    }
}

pub fn spawn_coordinator(
    kanban: KanbanFile,
    state: OrchestratorState,
    store: StateStore,
    config: CoordinatorConfig,
) -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let task_handle = tokio::spawn(run_coordinator(rx, kanban, state, store, config));

    (CoordinatorHandle { sender: tx }, task_handle)
}
