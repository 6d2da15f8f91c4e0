use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Done,
    Failed,
}

impl TaskStatus {
    /// Done and Failed are retained for audit and never leave their state
    /// without an explicit operator reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

pub fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    match s.to_lowercase().replace('-', "_").as_str() {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "blocked" => Ok(TaskStatus::Blocked),
        "done" => Ok(TaskStatus::Done),
        "failed" => Ok(TaskStatus::Failed),
        _ => Err(format!(
            "Invalid status '{}': expected pending, in_progress, blocked, done, or failed",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Spawned,
    Running,
    AwaitingRetry,
    Succeeded,
    Failed,
    Abandoned,
}

impl WorkerStatus {
    /// Spawned and Running workers hold a process slot and count against the
    /// worker limit.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerStatus::Spawned | WorkerStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Succeeded | WorkerStatus::Failed | WorkerStatus::Abandoned
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Spawned => write!(f, "spawned"),
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::AwaitingRetry => write!(f, "awaiting_retry"),
            WorkerStatus::Succeeded => write!(f, "succeeded"),
            WorkerStatus::Failed => write!(f, "failed"),
            WorkerStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Why a failed invocation is worth retrying.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryCause {
    Timeout,
    RateLimited,
    TransientNetwork,
}

impl std::fmt::Display for RetryCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryCause::Timeout => write!(f, "timeout"),
            RetryCause::RateLimited => write!(f, "rate limited"),
            RetryCause::TransientNetwork => write!(f, "transient network error"),
        }
    }
}

/// Classification of a non-zero agent exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitClass {
    Retryable(RetryCause),
    Fatal,
}

impl ExitClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExitClass::Retryable(_))
    }
}

// --- Priority ---

/// Numeric value of the named priority levels accepted in the kanban.
pub fn priority_level_value(name: &str) -> Option<i64> {
    match name.trim().to_lowercase().as_str() {
        "critical" => Some(40),
        "high" => Some(30),
        "medium" => Some(20),
        "low" => Some(10),
        _ => None,
    }
}

/// Accepts both an integer and a level name (`critical`, `high`, `medium`, `low`).
fn deserialize_priority<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PriorityRaw {
        Number(i64),
        Name(String),
    }

    match PriorityRaw::deserialize(deserializer)? {
        PriorityRaw::Number(n) => Ok(n),
        PriorityRaw::Name(name) => priority_level_value(&name).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid priority '{}': expected a number or critical, high, medium, low",
                name
            ))
        }),
    }
}

// --- Structs ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, deserialize_with = "deserialize_priority")]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Path patterns the task is expected to touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub footprint: Vec<String>,
    /// Pre-authored plan document, relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// Parent epic, used for the sibling work-in-progress penalty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Per-task retry bookkeeping, persisted in the state document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ResumeMeta {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_retry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    /// Final agent message of the last successful attempt, tail-truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
}

impl ResumeMeta {
    /// A task inside its retry cooldown is not dispatchable regardless of score.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.earliest_retry.is_some_and(|at| now < at)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub task_id: String,
    pub workspace: PathBuf,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub iteration: u32,
    pub status: WorkerStatus,
}

/// Reference to the claim that keeps a queued task from dispatching.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClaimRef {
    pub worker_id: String,
    pub task_id: String,
    pub pattern: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConflictClaim {
    pub pattern: String,
    pub worker_id: String,
    pub task_id: String,
    pub claimed_at: DateTime<Utc>,
}

impl ConflictClaim {
    pub fn as_ref(&self) -> ClaimRef {
        ClaimRef {
            worker_id: self.worker_id.clone(),
            task_id: self.task_id.clone(),
            pattern: self.pattern.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueEntry {
    pub task_id: String,
    #[serde(default)]
    pub footprint: Vec<String>,
    pub blocking: ClaimRef,
    pub enqueued_at: DateTime<Utc>,
}

/// A task chosen by a scheduling pass, with the worker id it will run under.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOrder {
    pub task_id: String,
    pub worker_id: String,
    pub footprint: Vec<String>,
    pub score: f64,
}

/// Terminal result of one worker attempt, produced by the lifecycle manager
/// and applied to shared state by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerOutcome {
    Succeeded {
        text: String,
        session_id: Option<String>,
        mergeable: bool,
        elapsed: Duration,
    },
    Retryable {
        cause: RetryCause,
        reason: String,
        session_id: Option<String>,
    },
    Fatal {
        reason: String,
        session_id: Option<String>,
    },
    Cancelled {
        session_id: Option<String>,
    },
}

impl WorkerOutcome {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            WorkerOutcome::Succeeded { session_id, .. }
            | WorkerOutcome::Retryable { session_id, .. }
            | WorkerOutcome::Fatal { session_id, .. }
            | WorkerOutcome::Cancelled { session_id } => session_id.as_deref(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Succeeded { .. } => "SUCCEEDED",
            WorkerOutcome::Retryable { .. } => "RETRYABLE",
            WorkerOutcome::Fatal { .. } => "FATAL",
            WorkerOutcome::Cancelled { .. } => "CANCELLED",
        }
    }
}

// --- Id helpers ---

/// Build a worker id in the `worker-<TASK-ID>-<unix-seconds>` form.
pub fn worker_id_for(task_id: &str, now: DateTime<Utc>) -> String {
    format!("worker-{}-{}", task_id, now.timestamp())
}

/// Parse the numeric suffix from a task ID (e.g., "TASK-042" -> 42).
fn numeric_suffix(id: &str) -> Option<(&str, u64)> {
    let (prefix, suffix) = id.rsplit_once('-')?;
    suffix.parse().ok().map(|n| (prefix, n))
}

/// Order task ids naturally: same prefix compares by numeric suffix, so
/// `TASK-2` sorts before `TASK-10`.
pub fn compare_task_ids(a: &str, b: &str) -> Ordering {
    match (numeric_suffix(a), numeric_suffix(b)) {
        (Some((pa, na)), Some((pb, nb))) => pa.cmp(pb).then(na.cmp(&nb)).then(a.cmp(b)),
        _ => a.cmp(b),
    }
}
