use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, RateLimitStatus};
use crate::config::{ScoringConfig, WiggumConfig};
use crate::conflict::footprints_intersect;
use crate::coordinator::{CoordinatorHandle, Snapshot};
use crate::error::OrchError;
use crate::lifecycle::WorkerManager;
use crate::merge::{merge_all, MergeCandidate, Merger};
use crate::process::is_shutdown_requested;
use crate::types::{
    compare_task_ids, worker_id_for, ClaimRef, DispatchOrder, Task, TaskStatus, WorkerOutcome,
};
use crate::{log_debug, log_info, log_warn};

/// Upper bound on a single idle sleep, so shutdown and new kanban state are noticed.
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(30);

// --- Public types ---

/// Result of a scheduler run, returned to the caller for summary display.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub dispatched: u32,
    pub tasks_completed: Vec<String>,
    pub tasks_failed: Vec<String>,
    pub retries_scheduled: u32,
    pub tasks_merged: Vec<String>,
    pub merges_skipped: Vec<(String, String)>,
    pub halt_reason: HaltReason,
}

#[derive(Debug, Default, PartialEq)]
pub enum HaltReason {
    /// Nothing left that could ever become eligible.
    #[default]
    Idle,
    CapReached,
    ShutdownRequested,
}

pub struct RunParams {
    /// Maximum number of dispatches for this run. `None` is unbounded.
    pub cap: Option<u32>,
    pub root: PathBuf,
}

/// A task held back this pass, with the claim it waits on.
#[derive(Clone, Debug, PartialEq)]
pub struct Deferral {
    pub task_id: String,
    pub footprint: Vec<String>,
    pub blocking: ClaimRef,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectionPlan {
    pub dispatch: Vec<DispatchOrder>,
    pub deferred: Vec<Deferral>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Eligibility {
    Eligible,
    /// Would be eligible but an active claim overlaps its footprint.
    ClaimBlocked(ClaimRef),
    Ineligible,
}

// --- Eligibility and scoring: pure functions ---

fn dependencies_done(task: &Task, snapshot: &Snapshot) -> bool {
    task.dependencies.iter().all(|dep| {
        snapshot
            .task(dep)
            .is_some_and(|t| t.status == TaskStatus::Done)
    })
}

pub fn eligibility(task: &Task, snapshot: &Snapshot, now: DateTime<Utc>) -> Eligibility {
    let status_ok = matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked);
    if !status_ok
        || !dependencies_done(task, snapshot)
        || snapshot.has_active_worker(&task.id)
        || snapshot.resume_for(&task.id).in_cooldown(now)
    {
        return Eligibility::Ineligible;
    }
    match snapshot.registry.find_conflict(&task.footprint) {
        Some(blocking) => Eligibility::ClaimBlocked(blocking),
        None => Eligibility::Eligible,
    }
}

/// Tasks that could be dispatched right now, in kanban order.
pub fn eligible_tasks<'a>(snapshot: &'a Snapshot, now: DateTime<Utc>) -> Vec<&'a Task> {
    snapshot
        .tasks
        .iter()
        .filter(|t| eligibility(t, snapshot, now) == Eligibility::Eligible)
        .collect()
}

/// Dispatch score. Higher runs first.
pub fn score_task(
    task: &Task,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
    weights: &ScoringConfig,
) -> f64 {
    let mut score = task.priority as f64;

    if let Some(created) = snapshot.created_at(task) {
        let age_secs = (now - created).num_seconds().max(0) as f64;
        score += age_secs * weights.aging_factor;
    }

    if let Some(parent) = &task.parent {
        let sibling_running = snapshot.tasks.iter().any(|t| {
            t.id != task.id
                && t.parent.as_ref() == Some(parent)
                && t.status == TaskStatus::InProgress
        });
        if sibling_running {
            score -= weights.sibling_wip_penalty;
        }
    }

    if task.plan.as_deref().is_some_and(|p| !p.trim().is_empty()) {
        score += weights.plan_bonus;
    }

    let satisfied = task
        .dependencies
        .iter()
        .filter(|dep| {
            snapshot
                .task(dep)
                .is_some_and(|t| t.status == TaskStatus::Done)
        })
        .count();
    score += weights.dependency_bonus * satisfied as f64;

    let attempts = snapshot.resume_for(&task.id).attempts;
    if attempts == 1 {
        score += weights.resume_initial_bonus;
    }
    score -= weights.resume_fail_penalty * attempts as f64;

    score
}

/// Choose what to dispatch this pass.
///
/// Pure: no I/O. Eligible tasks are ranked by score (ties by natural task id
/// order) and taken while capacity lasts. A task overlapping one already
/// picked this pass, or an active claim, is deferred instead.
pub fn select_tasks(
    snapshot: &Snapshot,
    capacity: usize,
    now: DateTime<Utc>,
    weights: &ScoringConfig,
) -> SelectionPlan {
    let mut plan = SelectionPlan::default();
    let mut ranked: Vec<(&Task, f64)> = Vec::new();

    for task in &snapshot.tasks {
        match eligibility(task, snapshot, now) {
            Eligibility::Eligible => ranked.push((task, score_task(task, snapshot, now, weights))),
            Eligibility::ClaimBlocked(blocking) => plan.deferred.push(Deferral {
                task_id: task.id.clone(),
                footprint: task.footprint.clone(),
                blocking,
            }),
            Eligibility::Ineligible => {}
        }
    }

    ranked.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| compare_task_ids(&a.id, &b.id))
    });

    for (task, score) in ranked {
        if plan.dispatch.len() >= capacity {
            break;
        }

        let overlap = plan.dispatch.iter().find_map(|picked| {
            footprints_intersect(&task.footprint, &picked.footprint).map(|(_, theirs)| ClaimRef {
                worker_id: picked.worker_id.clone(),
                task_id: picked.task_id.clone(),
                pattern: theirs.to_string(),
            })
        });
        if let Some(blocking) = overlap {
            plan.deferred.push(Deferral {
                task_id: task.id.clone(),
                footprint: task.footprint.clone(),
                blocking,
            });
            continue;
        }

        let worker_id = snapshot
            .retry_worker(&task.id)
            .map(|w| w.worker_id.clone())
            .unwrap_or_else(|| worker_id_for(&task.id, now));
        plan.dispatch.push(DispatchOrder {
            task_id: task.id.clone(),
            worker_id,
            footprint: task.footprint.clone(),
            score,
        });
    }

    plan
}

/// How long until a task parked in cooldown becomes eligible, if any is.
pub fn next_cooldown_expiry(snapshot: &Snapshot, now: DateTime<Utc>) -> Option<Duration> {
    snapshot
        .tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
        .filter_map(|t| snapshot.resume.get(&t.id)?.earliest_retry)
        .filter(|at| *at > now)
        .min()
        .and_then(|at| (at - now).to_std().ok())
}

// --- Run loop ---

/// `(worker_id, task_id, result)` of one finished attempt.
type WorkerResult = (String, String, Result<WorkerOutcome, OrchError>);

struct SchedulerState {
    summary: RunSummary,
    cap: Option<u32>,
    pending_merges: Vec<MergeCandidate>,
}

impl SchedulerState {
    fn is_cap_reached(&self) -> bool {
        self.cap.is_some_and(|cap| self.summary.dispatched >= cap)
    }

    fn remaining_cap(&self) -> usize {
        match self.cap {
            Some(cap) => cap.saturating_sub(self.summary.dispatched) as usize,
            None => usize::MAX,
        }
    }
}

pub async fn run_scheduler<B: Backend + 'static>(
    coordinator: CoordinatorHandle,
    manager: Arc<WorkerManager<B>>,
    merger: Option<Arc<dyn Merger + Send + Sync>>,
    config: WiggumConfig,
    params: RunParams,
    cancel: CancellationToken,
) -> Result<RunSummary, OrchError> {
    let mut state = SchedulerState {
        summary: RunSummary::default(),
        cap: params.cap,
        pending_merges: Vec::new(),
    };
    let mut join_set: JoinSet<WorkerResult> = JoinSet::new();
    // Workers outlive the run token by the shutdown grace period.
    let worker_cancel = CancellationToken::new();

    log_info!(
        "[sched] Started (workers={}, backend={}, root={})",
        manager.limit(),
        manager.backend().name(),
        params.root.display()
    );

    loop {
        if cancel.is_cancelled() || is_shutdown_requested() {
            log_info!("[sched] Shutdown requested; no further dispatch");
            shutdown_workers(
                &mut join_set,
                &coordinator,
                &worker_cancel,
                config.shutdown_grace(),
                &mut state,
            )
            .await?;
            coordinator.flush().await?;
            return Ok(finish(state, HaltReason::ShutdownRequested));
        }

        // Finished branches land on trunk before the next dispatch.
        if !state.pending_merges.is_empty() {
            run_merges(&merger, &mut state).await;
        }

        let tick = coordinator.begin_pass().await?;
        let snapshot = coordinator.get_snapshot().await?;
        let now = Utc::now();

        let rate_limit = manager.backend().rate_limit_status();
        let limited = matches!(rate_limit, RateLimitStatus::Limited { .. });

        let capacity = if limited || !manager.has_capacity(join_set.len()) {
            0
        } else {
            (manager.limit() - join_set.len()).min(state.remaining_cap())
        };

        let plan = select_tasks(&snapshot, capacity, now, &config.scoring);
        log_debug!(
            "[sched] Pass {}: {} running, capacity {}, {} selected, {} deferred",
            tick,
            join_set.len(),
            capacity,
            plan.dispatch.len(),
            plan.deferred.len()
        );

        for deferral in plan.deferred {
            coordinator
                .defer(&deferral.task_id, deferral.footprint, deferral.blocking)
                .await?;
        }

        for order in plan.dispatch {
            match coordinator.dispatch(order.clone()).await {
                Ok(ticket) => {
                    state.summary.dispatched += 1;
                    log_info!(
                        "[sched] {} -> {} (score {:.2})",
                        order.task_id,
                        ticket.worker.worker_id,
                        order.score
                    );
                    let worker_id = ticket.worker.worker_id.clone();
                    let task_id = ticket.task.id.clone();
                    let manager = Arc::clone(&manager);
                    let coord = coordinator.clone();
                    let token = worker_cancel.clone();
                    join_set.spawn(async move {
                        let result = manager.run_attempt(ticket, coord, token).await;
                        (worker_id, task_id, result)
                    });
                }
                Err(e @ (OrchError::Conflict { .. } | OrchError::TaskBusy(_))) => {
                    log_debug!("[sched] {} not dispatched: {}", order.task_id, e);
                }
                Err(e) if e.halts_orchestration() => {
                    abort_run(&mut join_set, &coordinator, &worker_cancel, &mut state).await;
                    return Err(e);
                }
                Err(e) => {
                    log_warn!("[sched] Dispatch of {} failed: {}", order.task_id, e);
                }
            }
        }

        if join_set.is_empty() {
            if state.is_cap_reached() {
                log_info!("[sched] Dispatch cap reached");
                coordinator.flush().await?;
                return Ok(finish(state, HaltReason::CapReached));
            }

            let wait = if limited {
                match rate_limit {
                    RateLimitStatus::Limited { until: Some(until) } => {
                        (until - now).to_std().unwrap_or(Duration::from_secs(1))
                    }
                    _ => MAX_IDLE_SLEEP,
                }
            } else {
                // Dispatch failed without a claim conflict, or a cooldown is pending.
                match next_cooldown_expiry(&snapshot, now) {
                    Some(wait) => wait,
                    None if capacity > 0 && eligible_tasks(&snapshot, now).is_empty() => {
                        log_info!("[sched] Nothing left to dispatch; all tasks done, failed or waiting on unmet dependencies");
                        coordinator.flush().await?;
                        return Ok(finish(state, HaltReason::Idle));
                    }
                    None => Duration::from_secs(1),
                }
            };

            let wait = wait.min(MAX_IDLE_SLEEP);
            log_debug!("[sched] Idle for {}s", wait.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {}
            }
            continue;
        }

        tokio::select! {
            Some(joined) = join_set.join_next() => {
                match joined {
                    Ok((worker_id, task_id, result)) => {
                        if let Err(e) = handle_worker_result(&worker_id, &task_id, result, &coordinator, &mut state).await {
                            abort_run(&mut join_set, &coordinator, &worker_cancel, &mut state).await;
                            return Err(e);
                        }
                    }
                    Err(e) => log_warn!("[sched] Worker task failed to join: {}", e),
                }
            }
            _ = cancel.cancelled() => {}
        }
    }
}

/// Apply a finished worker's outcome. Returns `Err` only for halting errors.
async fn handle_worker_result(
    worker_id: &str,
    task_id: &str,
    result: Result<WorkerOutcome, OrchError>,
    coordinator: &CoordinatorHandle,
    state: &mut SchedulerState,
) -> Result<(), OrchError> {
    let (outcome, halt) = match result {
        Ok(outcome) => (outcome, None),
        Err(e) => (WorkerOutcome::Cancelled { session_id: None }, Some(e)),
    };

    let effect = coordinator.apply_outcome(worker_id, outcome.clone()).await?;
    match &outcome {
        WorkerOutcome::Succeeded { .. } => {
            state.summary.tasks_completed.push(task_id.to_string());
            if let Some(candidate) = effect.merge {
                state.pending_merges.push(candidate);
            }
        }
        WorkerOutcome::Retryable { .. } if effect.task_status == TaskStatus::Failed => {
            log_warn!("[{}] Retries exhausted; marked failed", task_id);
            state.summary.tasks_failed.push(task_id.to_string());
        }
        WorkerOutcome::Retryable { .. } => state.summary.retries_scheduled += 1,
        WorkerOutcome::Fatal { .. } => state.summary.tasks_failed.push(task_id.to_string()),
        WorkerOutcome::Cancelled { .. } => {}
    }
    if !effect.freed.is_empty() {
        log_debug!("[conflict] Released by {}: {:?}", worker_id, effect.freed);
    }

    match halt {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_merges(merger: &Option<Arc<dyn Merger + Send + Sync>>, state: &mut SchedulerState) {
    let candidates = std::mem::take(&mut state.pending_merges);
    let Some(merger) = merger.clone() else {
        return;
    };
    log_info!("[merge] Integrating {} branch(es)", candidates.len());
    match tokio::task::spawn_blocking(move || merge_all(candidates, merger.as_ref())).await {
        Ok(report) => {
            state.summary.tasks_merged.extend(report.merged);
            state.summary.merges_skipped.extend(report.skipped);
        }
        Err(e) => log_warn!("[merge] Merge task failed: {}", e),
    }
}

/// Let in-flight workers finish within the grace period, then cancel the
/// rest and record their outcomes.
async fn shutdown_workers(
    join_set: &mut JoinSet<WorkerResult>,
    coordinator: &CoordinatorHandle,
    worker_cancel: &CancellationToken,
    grace: Duration,
    state: &mut SchedulerState,
) -> Result<(), OrchError> {
    if join_set.is_empty() {
        return Ok(());
    }
    log_info!(
        "[sched] Waiting up to {}s for {} worker(s)",
        grace.as_secs(),
        join_set.len()
    );

    let deadline = tokio::time::Instant::now() + grace;
    let mut first_error = None;
    loop {
        let joined = tokio::select! {
            joined = join_set.join_next() => joined,
            _ = tokio::time::sleep_until(deadline), if !worker_cancel.is_cancelled() => {
                log_warn!("[sched] Grace period over; cancelling {} worker(s)", join_set.len());
                worker_cancel.cancel();
                continue;
            }
        };
        let Some(joined) = joined else {
            break;
        };
        match joined {
            Ok((worker_id, task_id, result)) => {
                if let Err(e) = handle_worker_result(&worker_id, &task_id, result, coordinator, state).await {
                    first_error.get_or_insert(e);
                }
            }
            Err(e) => log_warn!("[sched] Worker task failed to join: {}", e),
        }
    }

    match first_error {
        Some(e) if e.halts_orchestration() => Err(e),
        _ => Ok(()),
    }
}

/// Cancel every worker immediately after a halting error.
async fn abort_run(
    join_set: &mut JoinSet<WorkerResult>,
    coordinator: &CoordinatorHandle,
    worker_cancel: &CancellationToken,
    state: &mut SchedulerState,
) {
    worker_cancel.cancel();
    if let Err(e) = shutdown_workers(join_set, coordinator, worker_cancel, Duration::ZERO, state).await {
        log_warn!("[sched] Error while stopping workers: {}", e);
    }
}

fn finish(mut state: SchedulerState, halt_reason: HaltReason) -> RunSummary {
    state.summary.tasks_completed.sort_by(|a, b| compare_task_ids(a, b));
    state.summary.tasks_completed.dedup();
    state.summary.tasks_failed.sort_by(|a, b| compare_task_ids(a, b));
    state.summary.tasks_failed.dedup();
    state.summary.halt_reason = halt_reason;
    state.summary
}
