mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{default_config, fixed_now, make_kanban, make_pending, make_task, setup_test_repo};
use wiggum::backend::{MockBackend, MockStep, RateLimitStatus};
use wiggum::config::{ScoringConfig, WiggumConfig};
use wiggum::conflict::ConflictRegistry;
use wiggum::coordinator::{spawn_coordinator, CoordinatorConfig, Snapshot};
use wiggum::error::OrchError;
use wiggum::kanban;
use wiggum::lifecycle::WorkerManager;
use wiggum::merge::{GitMerger, MergeCandidate, Merger};
use wiggum::scheduler::{
    eligible_tasks, next_cooldown_expiry, run_scheduler, score_task, select_tasks, HaltReason,
    RunParams, RunSummary,
};
use wiggum::state::{OrchestratorState, StateStore};
use wiggum::types::{ResumeMeta, Task, TaskStatus, WorkerRecord, WorkerStatus};
use wiggum::workspace::WorkspaceManager;

fn snapshot(tasks: Vec<Task>) -> Snapshot {
    Snapshot {
        tasks,
        ..Default::default()
    }
}

fn ids(tasks: &[&Task]) -> Vec<String> {
    tasks.iter().map(|t| t.id.clone()).collect()
}

fn worker(id: &str, task: &str, status: WorkerStatus) -> WorkerRecord {
    WorkerRecord {
        worker_id: id.to_string(),
        task_id: task.to_string(),
        workspace: PathBuf::from(format!("/wt/{}", id)),
        backend: "mock".to_string(),
        pid: None,
        started_at: fixed_now(),
        session_id: None,
        iteration: 1,
        status,
    }
}

fn no_weights() -> ScoringConfig {
    ScoringConfig {
        aging_factor: 0.0,
        sibling_wip_penalty: 0.0,
        plan_bonus: 0.0,
        dependency_bonus: 0.0,
        resume_initial_bonus: 0.0,
        resume_fail_penalty: 0.0,
    }
}

// --- Eligibility ---

#[test]
fn eligibility_requires_done_dependencies() {
    let mut t2 = make_pending("T-2", 0, &[]);
    t2.dependencies = vec!["T-1".to_string()];
    let mut t3 = make_pending("T-3", 0, &[]);
    t3.dependencies = vec!["T-404".to_string()];
    let mut t4 = make_pending("T-4", 0, &[]);
    t4.dependencies = vec!["T-5".to_string()];

    let snap = snapshot(vec![
        make_task("T-1", TaskStatus::InProgress),
        t2,
        t3,
        t4,
        make_task("T-5", TaskStatus::Done),
    ]);

    assert_eq!(ids(&eligible_tasks(&snap, fixed_now())), vec!["T-4"]);
}

#[test]
fn eligibility_statuses() {
    let mut blocked_ready = make_task("T-3", TaskStatus::Blocked);
    blocked_ready.dependencies = vec!["T-9".to_string()];
    let mut blocked_waiting = make_task("T-4", TaskStatus::Blocked);
    blocked_waiting.dependencies = vec!["T-1".to_string()];

    let snap = snapshot(vec![
        make_task("T-1", TaskStatus::Pending),
        make_task("T-2", TaskStatus::Failed),
        blocked_ready,
        blocked_waiting,
        make_task("T-5", TaskStatus::InProgress),
        make_task("T-9", TaskStatus::Done),
    ]);

    assert_eq!(ids(&eligible_tasks(&snap, fixed_now())), vec!["T-1", "T-3"]);
}

#[test]
fn cooldown_and_active_worker_exclude_task() {
    let mut snap = snapshot(vec![
        make_pending("T-1", 0, &[]),
        make_pending("T-2", 0, &[]),
        make_pending("T-3", 0, &[]),
    ]);
    snap.resume.insert(
        "T-1".to_string(),
        ResumeMeta {
            attempts: 1,
            earliest_retry: Some(fixed_now() + chrono::Duration::seconds(30)),
            ..Default::default()
        },
    );
    snap.workers.push(worker("w2", "T-2", WorkerStatus::Running));

    assert_eq!(ids(&eligible_tasks(&snap, fixed_now())), vec!["T-3"]);
    assert_eq!(
        next_cooldown_expiry(&snap, fixed_now()),
        Some(Duration::from_secs(30))
    );

    let later = fixed_now() + chrono::Duration::seconds(31);
    assert_eq!(ids(&eligible_tasks(&snap, later)), vec!["T-1", "T-3"]);
    assert_eq!(next_cooldown_expiry(&snap, later), None);
}

// --- Scoring ---

#[test]
fn score_combines_all_terms() {
    let now = fixed_now();
    let mut task = make_pending("T-2", 10, &[]);
    task.created = Some(now - chrono::Duration::seconds(100));
    task.plan = Some("plans/T-2.md".to_string());
    task.dependencies = vec!["T-1".to_string(), "T-9".to_string()];
    task.parent = Some("E-1".to_string());

    let mut snap = snapshot(vec![make_task("T-1", TaskStatus::Done), task.clone()]);
    snap.resume.insert(
        "T-2".to_string(),
        ResumeMeta {
            attempts: 1,
            ..Default::default()
        },
    );

    let weights = ScoringConfig::default();
    // 10 + 100 * 0.01 + 15 (plan) + 5 (one satisfied dep) + 25 (first retry) - 10 (one failure)
    let score = score_task(&task, &snap, now, &weights);
    assert!((score - 46.0).abs() < 1e-9, "score {}", score);

    let mut sibling = make_task("T-3", TaskStatus::InProgress);
    sibling.parent = Some("E-1".to_string());
    snap.tasks.push(sibling);
    let penalized = score_task(&task, &snap, now, &weights);
    assert!((penalized - 26.0).abs() < 1e-9, "score {}", penalized);
}

#[test]
fn repeated_failures_lose_the_initial_bonus() {
    let now = fixed_now();
    let task = make_pending("T-1", 0, &[]);
    let mut snap = snapshot(vec![task.clone()]);
    snap.resume.insert(
        "T-1".to_string(),
        ResumeMeta {
            attempts: 2,
            ..Default::default()
        },
    );
    let score = score_task(&task, &snap, now, &ScoringConfig::default());
    assert!((score + 20.0).abs() < 1e-9, "score {}", score);
}

// --- Selection ---

#[test]
fn selection_ranks_by_score_then_natural_id() {
    let snap = snapshot(vec![
        make_pending("T-10", 5, &[]),
        make_pending("T-2", 5, &[]),
        make_pending("T-3", 9, &[]),
        make_pending("T-1", 1, &[]),
    ]);

    let plan = select_tasks(&snap, 3, fixed_now(), &no_weights());
    let picked: Vec<&str> = plan.dispatch.iter().map(|o| o.task_id.as_str()).collect();
    assert_eq!(picked, vec!["T-3", "T-2", "T-10"]);
    assert!(plan.deferred.is_empty());
    assert_eq!(plan.dispatch[0].worker_id, format!("worker-T-3-{}", fixed_now().timestamp()));
}

#[test]
fn selection_defers_intra_pass_conflicts() {
    let snap = snapshot(vec![
        make_pending("T-1", 10, &["src"]),
        make_pending("T-2", 5, &["src/a.rs"]),
        make_pending("T-3", 1, &["docs"]),
    ]);

    let plan = select_tasks(&snap, 3, fixed_now(), &no_weights());
    let picked: Vec<&str> = plan.dispatch.iter().map(|o| o.task_id.as_str()).collect();
    assert_eq!(picked, vec!["T-1", "T-3"]);

    assert_eq!(plan.deferred.len(), 1);
    let deferred = &plan.deferred[0];
    assert_eq!(deferred.task_id, "T-2");
    assert_eq!(deferred.blocking.task_id, "T-1");
    assert_eq!(deferred.blocking.worker_id, plan.dispatch[0].worker_id);
    assert_eq!(deferred.blocking.pattern, "src");
}

#[test]
fn selection_defers_tasks_blocked_by_active_claims() {
    let mut registry = ConflictRegistry::new();
    registry
        .claim(&["src/api".to_string()], "w0", "T-0", fixed_now())
        .unwrap();
    let snap = Snapshot {
        tasks: vec![
            make_task("T-0", TaskStatus::InProgress),
            make_pending("T-1", 10, &["src/api/users.rs"]),
            make_pending("T-2", 1, &["src/db"]),
        ],
        registry,
        workers: vec![worker("w0", "T-0", WorkerStatus::Running)],
        ..Default::default()
    };

    let plan = select_tasks(&snap, 2, fixed_now(), &no_weights());
    let picked: Vec<&str> = plan.dispatch.iter().map(|o| o.task_id.as_str()).collect();
    assert_eq!(picked, vec!["T-2"]);
    assert_eq!(plan.deferred.len(), 1);
    assert_eq!(plan.deferred[0].task_id, "T-1");
    assert_eq!(plan.deferred[0].blocking.worker_id, "w0");
}

#[test]
fn selection_respects_capacity() {
    let snap = snapshot(vec![
        make_pending("T-1", 3, &[]),
        make_pending("T-2", 2, &[]),
        make_pending("T-3", 1, &[]),
    ]);
    assert_eq!(select_tasks(&snap, 0, fixed_now(), &no_weights()).dispatch.len(), 0);
    let plan = select_tasks(&snap, 2, fixed_now(), &no_weights());
    assert_eq!(plan.dispatch.len(), 2);
    // Over-capacity tasks are simply left for the next pass.
    assert!(plan.deferred.is_empty());
}

#[test]
fn selection_reuses_parked_worker_id() {
    let mut snap = snapshot(vec![make_pending("T-1", 0, &[])]);
    snap.workers
        .push(worker("worker-T-1-5", "T-1", WorkerStatus::AwaitingRetry));

    let plan = select_tasks(&snap, 1, fixed_now(), &no_weights());
    assert_eq!(plan.dispatch[0].worker_id, "worker-T-1-5");
}

#[test]
fn selection_never_picks_overlapping_footprints() {
    let snap = snapshot(vec![
        make_pending("T-1", 1, &["."]),
        make_pending("T-2", 9, &["src"]),
        make_pending("T-3", 5, &["README.md"]),
        make_pending("T-4", 0, &[]),
    ]);
    let plan = select_tasks(&snap, 4, fixed_now(), &no_weights());
    let picked: Vec<&str> = plan.dispatch.iter().map(|o| o.task_id.as_str()).collect();
    assert_eq!(picked, vec!["T-2", "T-3", "T-4"]);
    assert_eq!(plan.deferred[0].task_id, "T-1");
}

// --- Run loop ---

struct RunHarness {
    dir: TempDir,
    config: WiggumConfig,
    backend: Arc<MockBackend>,
    merger: Option<Arc<dyn Merger + Send + Sync>>,
}

impl RunHarness {
    fn new(backend: MockBackend, tasks: Vec<Task>, config: WiggumConfig) -> Self {
        let dir = setup_test_repo();
        let kanban_path = config.kanban_path(dir.path());
        std::fs::create_dir_all(kanban_path.parent().unwrap()).unwrap();
        kanban::save(&kanban_path, &make_kanban(tasks)).unwrap();
        Self {
            dir,
            config,
            backend: Arc::new(backend),
            merger: None,
        }
    }

    fn set_merger(&mut self, merger: Arc<dyn Merger + Send + Sync>) {
        self.merger = Some(merger);
    }

    async fn run(&self, cap: Option<u32>, cancel: CancellationToken) -> RunSummary {
        self.run_result(cap, cancel).await.unwrap()
    }

    async fn run_result(
        &self,
        cap: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, OrchError> {
        let root = self.dir.path();
        let kanban_file = kanban::load(&self.config.kanban_path(root)).unwrap();
        let store = StateStore::new(self.config.state_path(root));
        let state = store.load().unwrap();
        let (handle, task) = spawn_coordinator(
            kanban_file,
            state,
            store,
            CoordinatorConfig {
                kanban_path: self.config.kanban_path(root),
                worktree_dir: self.config.worktree_dir(root),
                backend: "mock".to_string(),
                retry: self.config.retry.clone(),
            },
        );
        let manager = Arc::new(WorkerManager::new(
            Arc::clone(&self.backend),
            &self.config,
            root,
        ));
        let params = RunParams {
            cap,
            root: root.to_path_buf(),
        };
        let result = run_scheduler(
            handle,
            manager,
            self.merger.clone(),
            self.config.clone(),
            params,
            cancel,
        )
        .await;
        task.await.unwrap();
        result
    }

    fn kanban_status(&self, task_id: &str) -> TaskStatus {
        kanban::load(&self.config.kanban_path(self.dir.path()))
            .unwrap()
            .find(task_id)
            .unwrap()
            .status
    }

    fn state(&self) -> OrchestratorState {
        StateStore::new(self.config.state_path(self.dir.path()))
            .load()
            .unwrap()
    }
}

/// Records each integration with the number of agent runs started by then.
struct RecordingMerger {
    backend: Arc<MockBackend>,
    fail: Vec<String>,
    merged: Mutex<Vec<(String, usize)>>,
    cleaned: Mutex<Vec<String>>,
}

impl RecordingMerger {
    fn new(backend: Arc<MockBackend>, fail: &[&str]) -> Self {
        Self {
            backend,
            fail: fail.iter().map(|s| s.to_string()).collect(),
            merged: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    fn merged(&self) -> Vec<(String, usize)> {
        self.merged.lock().unwrap().clone()
    }
}

impl Merger for RecordingMerger {
    fn integrate(&self, candidate: &MergeCandidate) -> Result<(), String> {
        if self.fail.contains(&candidate.task_id) {
            return Err("conflict in README.md".to_string());
        }
        let started = self.backend.requests().len();
        self.merged
            .lock()
            .unwrap()
            .push((candidate.task_id.clone(), started));
        Ok(())
    }

    fn cleanup(&self, candidate: &MergeCandidate) -> Result<(), String> {
        self.cleaned.lock().unwrap().push(candidate.task_id.clone());
        Ok(())
    }
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

#[tokio::test]
async fn runs_independent_tasks_to_completion() {
    let backend = MockBackend::new(vec![
        MockStep::success("a"),
        MockStep::success("b"),
        MockStep::success("c"),
    ]);
    let h = RunHarness::new(
        backend,
        vec![
            make_pending("T-1", 1, &["src/a"]),
            make_pending("T-2", 2, &["src/b"]),
            make_pending("T-3", 3, &["src/c"]),
        ],
        default_config(),
    );

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.halt_reason, HaltReason::Idle);
    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.tasks_completed, vec!["T-1", "T-2", "T-3"]);
    for id in ["T-1", "T-2", "T-3"] {
        assert_eq!(h.kanban_status(id), TaskStatus::Done);
    }
    let state = h.state();
    assert!(state.registry.claims().is_empty());
    assert!(state.tick >= 1);
    assert_eq!(state.active_worker_count(), 0);
}

#[tokio::test]
async fn conflicting_tasks_run_one_after_another() {
    let backend = MockBackend::new(vec![
        MockStep {
            delay: Duration::from_millis(200),
            ..MockStep::success("first")
        },
        MockStep::success("second"),
    ]);
    let h = RunHarness::new(
        backend,
        vec![
            make_pending("T-1", 5, &["src"]),
            make_pending("T-2", 1, &["src/lib.rs"]),
        ],
        default_config(),
    );

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_completed, vec!["T-1", "T-2"]);
    let requests = h.backend.requests();
    assert!(requests[0].user_prompt.contains("T-1"));
    assert!(requests[1].user_prompt.contains("T-2"));
    assert!(h.state().registry.queue().is_empty());
}

#[tokio::test]
async fn dependencies_gate_dispatch() {
    let backend = MockBackend::new(vec![MockStep::success("one"), MockStep::success("two")]);
    let mut t2 = make_pending("T-2", 100, &[]);
    t2.dependencies = vec!["T-1".to_string()];
    let h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 0, &[]), t2],
        default_config(),
    );

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_completed, vec!["T-1", "T-2"]);
    let requests = h.backend.requests();
    assert!(requests[0].user_prompt.contains("**ID:** T-1"));
    assert!(requests[1].user_prompt.contains("**ID:** T-2"));
}

#[tokio::test]
async fn fatal_failure_strands_dependents_and_halts_idle() {
    let backend = MockBackend::new(vec![MockStep::exit(2, "boom")]);
    let mut t2 = make_pending("T-2", 0, &[]);
    t2.dependencies = vec!["T-1".to_string()];
    let h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 0, &[]), t2],
        default_config(),
    );

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.halt_reason, HaltReason::Idle);
    assert_eq!(summary.tasks_failed, vec!["T-1"]);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(h.kanban_status("T-1"), TaskStatus::Failed);
    assert_eq!(h.kanban_status("T-2"), TaskStatus::Pending);
}

#[tokio::test]
async fn retryable_failure_is_retried_after_cooldown() {
    let mut config = default_config();
    config.retry.min_retry_interval_secs = 1;
    let backend = MockBackend::new(vec![
        MockStep::exit(1, "HTTP 429 Too Many Requests"),
        MockStep::success("recovered"),
    ]);
    let h = RunHarness::new(backend, vec![make_pending("T-1", 0, &[])], config);

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.retries_scheduled, 1);
    assert_eq!(summary.tasks_completed, vec!["T-1"]);
    assert_eq!(summary.dispatched, 2);
    let state = h.state();
    assert_eq!(state.resume_for("T-1").attempts, 1);
    assert_eq!(state.workers.len(), 1);
    assert_eq!(state.workers[0].iteration, 2);
}

#[tokio::test]
async fn retries_exhaust_into_failure() {
    let mut config = default_config();
    config.retry.max_skip_retries = 2;
    let backend = MockBackend::new(vec![
        MockStep::exit(1, "rate limit"),
        MockStep::exit(1, "rate limit"),
    ]);
    let h = RunHarness::new(backend, vec![make_pending("T-1", 0, &[])], config);

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_failed, vec!["T-1"]);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(h.kanban_status("T-1"), TaskStatus::Failed);
    assert_eq!(h.backend.remaining_steps(), 0);
}

#[tokio::test]
async fn cap_limits_dispatches() {
    let backend = MockBackend::new(vec![MockStep::success("a"), MockStep::success("b")]);
    let h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 2, &[]), make_pending("T-2", 1, &[])],
        default_config(),
    );

    let summary = h.run(Some(1), CancellationToken::new()).await;

    assert_eq!(summary.halt_reason, HaltReason::CapReached);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(h.kanban_status("T-1"), TaskStatus::Done);
    assert_eq!(h.kanban_status("T-2"), TaskStatus::Pending);
}

#[tokio::test]
async fn worker_limit_bounds_concurrency() {
    let mut config = default_config();
    config.workers.limit = 1;
    let backend = MockBackend::new(vec![
        MockStep {
            delay: Duration::from_millis(100),
            ..MockStep::success("a")
        },
        MockStep::success("b"),
    ]);
    let h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 2, &["a"]), make_pending("T-2", 1, &["b"])],
        config,
    );

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_completed, vec!["T-1", "T-2"]);
    // With one slot, T-2 started only after T-1 finished.
    let state = h.state();
    let t1 = state.workers.iter().find(|w| w.task_id == "T-1").unwrap();
    let t2 = state.workers.iter().find(|w| w.task_id == "T-2").unwrap();
    assert!(t2.started_at >= t1.started_at);
}

#[tokio::test]
async fn cancelled_before_start_dispatches_nothing() {
    let backend = MockBackend::new(vec![MockStep::success("a")]);
    let h = RunHarness::new(backend, vec![make_pending("T-1", 0, &[])], default_config());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = h.run(None, cancel).await;

    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(h.kanban_status("T-1"), TaskStatus::Pending);
}

#[tokio::test]
async fn shutdown_cancels_workers_after_grace() {
    let backend = MockBackend::new(vec![MockStep::hang(Duration::from_secs(30))]);
    let h = RunHarness::new(backend, vec![make_pending("T-1", 0, &["src"])], default_config());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let summary = h.run(None, cancel).await;

    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert_eq!(summary.dispatched, 1);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.kanban_status("T-1"), TaskStatus::Pending);
    let state = h.state();
    assert_eq!(state.workers[0].status, WorkerStatus::Abandoned);
    assert_eq!(state.resume_for("T-1").attempts, 0);
    assert!(state.registry.claims().is_empty());
}

#[tokio::test]
async fn rate_limited_backend_holds_dispatch() {
    let backend = MockBackend::new(vec![MockStep::success("a")])
        .with_rate_limit(RateLimitStatus::Limited { until: None });
    let h = RunHarness::new(backend, vec![make_pending("T-1", 0, &[])], default_config());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let summary = h.run(None, cancel).await;
    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(h.backend.remaining_steps(), 1);
}

#[tokio::test]
async fn vanished_backend_halts_the_run() {
    let backend = MockBackend::new(vec![MockStep::success("a")]).unavailable();
    let h = RunHarness::new(backend, vec![make_pending("T-1", 0, &["src"])], default_config());

    let err = h.run_result(None, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, OrchError::BackendUnavailable(_)), "got {:?}", err);
    assert_eq!(h.kanban_status("T-1"), TaskStatus::Pending);
    let state = h.state();
    assert_eq!(state.resume_for("T-1").attempts, 0);
    assert!(state.registry.claims().is_empty());
}

#[tokio::test]
async fn resumes_from_persisted_state() {
    let backend = MockBackend::new(vec![MockStep::success("a"), MockStep::success("b")]);
    let h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 1, &[]), make_pending("T-2", 0, &[])],
        default_config(),
    );

    let first = h.run(Some(1), CancellationToken::new()).await;
    assert_eq!(first.tasks_completed, vec!["T-1"]);
    let tick_after_first = h.state().tick;

    let second = h.run(None, CancellationToken::new()).await;
    assert_eq!(second.tasks_completed, vec!["T-2"]);
    assert!(h.state().tick > tick_after_first);
    assert_eq!(h.kanban_status("T-1"), TaskStatus::Done);
    assert_eq!(h.kanban_status("T-2"), TaskStatus::Done);
}

#[tokio::test]
async fn finished_dependency_merges_before_dependent_starts() {
    let mut config = default_config();
    config.workers.limit = 2;
    let backend = MockBackend::new(vec![
        MockStep::success("one")
            .writing("a/one.txt", "1\n")
            .only_for("**ID:** T-1"),
        MockStep {
            delay: Duration::from_millis(800),
            ..MockStep::success("three")
        }
        .writing("c/three.txt", "3\n")
        .only_for("**ID:** T-3"),
        MockStep::success("two")
            .writing("b/two.txt", "2\n")
            .only_for("**ID:** T-2"),
    ]);
    let mut t2 = make_pending("T-2", 0, &["b"]);
    t2.dependencies = vec!["T-1".to_string()];
    let mut h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 0, &["a"]), t2, make_pending("T-3", 0, &["c"])],
        config,
    );
    let merger = Arc::new(RecordingMerger::new(Arc::clone(&h.backend), &[]));
    h.set_merger(merger.clone());

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_completed, vec!["T-1", "T-2", "T-3"]);
    // T-1 landed while T-3 was still running and before T-2 started.
    let merged = merger.merged();
    let (_, started) = merged.iter().find(|(id, _)| id == "T-1").unwrap();
    assert!(*started <= 2, "{} agent runs had started", started);
    let (_, started) = merged.iter().find(|(id, _)| id == "T-2").unwrap();
    assert_eq!(*started, 3);
    assert_eq!(sorted(summary.tasks_merged), vec!["T-1", "T-2", "T-3"]);
}

#[tokio::test]
async fn completed_branches_are_merged_and_cleaned_up() {
    let backend = MockBackend::new(vec![
        MockStep::success("a").writing("a/x.txt", "x\n"),
        MockStep::success("b").writing("b/y.txt", "y\n"),
    ]);
    let mut h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 2, &["a"]), make_pending("T-2", 1, &["b"])],
        default_config(),
    );
    let merger = Arc::new(RecordingMerger::new(Arc::clone(&h.backend), &[]));
    h.set_merger(merger.clone());

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(sorted(summary.tasks_merged), vec!["T-1", "T-2"]);
    assert!(summary.merges_skipped.is_empty());
    assert_eq!(sorted(merger.cleaned.lock().unwrap().clone()), vec!["T-1", "T-2"]);
}

#[tokio::test]
async fn failed_integration_is_skipped_and_reported() {
    let backend = MockBackend::new(vec![
        MockStep::success("a").writing("a/x.txt", "x\n"),
        MockStep::success("b").writing("b/y.txt", "y\n"),
    ]);
    let mut h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 2, &["a"]), make_pending("T-2", 1, &["b"])],
        default_config(),
    );
    let merger = Arc::new(RecordingMerger::new(Arc::clone(&h.backend), &["T-2"]));
    h.set_merger(merger.clone());

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_merged, vec!["T-1"]);
    assert_eq!(
        summary.merges_skipped,
        vec![("T-2".to_string(), "conflict in README.md".to_string())]
    );
    assert_eq!(*merger.cleaned.lock().unwrap(), vec!["T-1".to_string()]);
    // The task itself stays done; only its integration is outstanding.
    assert_eq!(h.kanban_status("T-2"), TaskStatus::Done);
}

#[tokio::test]
async fn success_without_changes_is_not_merged() {
    let backend = MockBackend::new(vec![MockStep::success("nothing to do")]);
    let mut h = RunHarness::new(backend, vec![make_pending("T-1", 0, &[])], default_config());
    let merger = Arc::new(RecordingMerger::new(Arc::clone(&h.backend), &[]));
    h.set_merger(merger.clone());

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_completed, vec!["T-1"]);
    assert!(summary.tasks_merged.is_empty());
    assert!(merger.merged().is_empty());
}

#[tokio::test]
async fn git_merger_lands_branches_on_trunk() {
    let mut config = default_config();
    config.workers.limit = 1;
    let backend = MockBackend::new(vec![
        MockStep::success("a").writing("a/x.txt", "x\n"),
        MockStep::success("b").writing("b/y.txt", "y\n"),
    ]);
    let mut h = RunHarness::new(
        backend,
        vec![make_pending("T-1", 2, &["a"]), make_pending("T-2", 1, &["b"])],
        config.clone(),
    );
    let root = h.dir.path().to_path_buf();
    let workspaces = WorkspaceManager::new(root.clone(), config.worktree_dir(&root), "main".to_string());
    h.set_merger(Arc::new(GitMerger::new(workspaces, "")));

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.tasks_merged, vec!["T-1", "T-2"]);
    assert!(root.join("a/x.txt").exists());
    assert!(root.join("b/y.txt").exists());
    let state = h.state();
    for worker in &state.workers {
        assert!(!worker.workspace.exists(), "{} still has a worktree", worker.worker_id);
    }
}

#[tokio::test]
async fn overlapping_tasks_queue_then_run_after_release() {
    let mut config = default_config();
    config.workers.limit = 2;
    let tasks = vec![make_pending("T-1", 0, &["a/"]), make_pending("T-2", 0, &["a/"])];

    // One slot is taken, the other task waits on the first one's claim.
    let plan = select_tasks(&snapshot(tasks.clone()), 2, fixed_now(), &no_weights());
    assert_eq!(plan.dispatch.len(), 1);
    assert_eq!(plan.dispatch[0].task_id, "T-1");
    assert_eq!(plan.deferred.len(), 1);
    assert_eq!(plan.deferred[0].task_id, "T-2");

    let backend = MockBackend::new(vec![
        MockStep {
            delay: Duration::from_millis(300),
            ..MockStep::success("first")
        },
        MockStep::success("second"),
    ]);
    let h = RunHarness::new(backend, tasks, config);

    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.tasks_completed, vec!["T-1", "T-2"]);
    let state = h.state();
    let t1 = state.workers.iter().find(|w| w.task_id == "T-1").unwrap();
    let t2 = state.workers.iter().find(|w| w.task_id == "T-2").unwrap();
    assert!(t2.started_at >= t1.started_at + chrono::Duration::milliseconds(300));
    assert!(state.registry.queue().is_empty());
    assert!(state.registry.claims().is_empty());
}

#[tokio::test]
async fn failed_task_waits_out_retry_interval() {
    let mut config = default_config();
    config.retry.min_retry_interval_secs = 2;
    let backend = MockBackend::new(vec![
        MockStep::exit(1, "connection reset by peer"),
        MockStep::success("recovered"),
    ]);
    let h = RunHarness::new(backend, vec![make_pending("T-1", 0, &[])], config);

    let started = std::time::Instant::now();
    let summary = h.run(None, CancellationToken::new()).await;

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.tasks_completed, vec!["T-1"]);
    assert!(started.elapsed() >= Duration::from_secs(2));
    let state = h.state();
    let failed_at = state.resume_for("T-1").last_failed_at.unwrap();
    let retried_at = state.workers[0].started_at;
    assert!(
        retried_at >= failed_at + chrono::Duration::seconds(2),
        "retried at {} after failing at {}",
        retried_at,
        failed_at
    );
}

#[test]
fn releasing_claims_never_shrinks_eligible_set() {
    let pool = ["src", "src/api", "src/api/users.rs", "docs", "docs/*.md", "web/app.ts", "."];
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..200 {
        let mut registry = ConflictRegistry::new();
        let mut tasks = Vec::new();
        let mut workers = Vec::new();

        for n in 0..3 {
            let task_id = format!("T-{}", n);
            let worker_id = format!("w{}", n);
            let pattern = pool[rng.gen_range(0..pool.len())].to_string();
            if registry
                .claim(&[pattern], &worker_id, &task_id, fixed_now())
                .is_ok()
            {
                tasks.push(make_task(&task_id, TaskStatus::InProgress));
                workers.push(worker(&worker_id, &task_id, WorkerStatus::Running));
            }
        }
        for n in 10..16 {
            let size = rng.gen_range(0..3);
            let footprint: Vec<&str> = (0..size).map(|_| pool[rng.gen_range(0..pool.len())]).collect();
            tasks.push(make_pending(&format!("T-{}", n), 0, &footprint));
        }

        let mut snap = Snapshot {
            tasks,
            registry,
            workers,
            ..Default::default()
        };
        let before = ids(&eligible_tasks(&snap, fixed_now()));

        let holders: Vec<String> = snap.workers.iter().map(|w| w.worker_id.clone()).collect();
        let released = &holders[rng.gen_range(0..holders.len())];
        snap.registry.release(released);
        let after = ids(&eligible_tasks(&snap, fixed_now()));

        for id in &before {
            assert!(after.contains(id), "{} lost eligibility after releasing {}", id, released);
        }
    }
}

#[test]
fn first_sighting_ages_tasks_without_created_stamp() {
    let now = fixed_now();
    let task = make_pending("T-1", 0, &[]);
    let mut snap = snapshot(vec![task.clone()]);
    let weights = ScoringConfig {
        aging_factor: 0.5,
        ..no_weights()
    };
    assert_eq!(score_task(&task, &snap, now, &weights), 0.0);

    snap.first_seen
        .insert("T-1".to_string(), now - chrono::Duration::seconds(100));
    let aged = score_task(&task, &snap, now, &weights);
    assert!((aged - 50.0).abs() < 1e-9, "score {}", aged);

    // An explicit created stamp wins.
    let mut stamped = task.clone();
    stamped.created = Some(now - chrono::Duration::seconds(10));
    let score = score_task(&stamped, &snap, now, &weights);
    assert!((score - 5.0).abs() < 1e-9, "score {}", score);
}

#[test]
fn empty_resume_map_is_default() {
    let snap = Snapshot {
        resume: BTreeMap::new(),
        ..Default::default()
    };
    assert_eq!(snap.resume_for("anything"), ResumeMeta::default());
}
