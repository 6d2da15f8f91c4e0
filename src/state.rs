use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::conflict::ConflictRegistry;
use crate::error::OrchError;
use crate::types::{ResumeMeta, Task, TaskStatus, WorkerRecord, WorkerStatus};
use crate::{log_info, log_warn};

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Everything the orchestrator must remember across restarts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrchestratorState {
    pub schema_version: u32,
    #[serde(default)]
    pub tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resume: BTreeMap<String, ResumeMeta>,
    #[serde(default)]
    pub registry: ConflictRegistry,
    #[serde(default)]
    pub workers: Vec<WorkerRecord>,
    #[serde(default)]
    pub metrics: BTreeMap<String, TaskMetrics>,
    /// When each task first showed up in the backlog. Ages tasks whose
    /// kanban entry carries no `created` stamp.
    #[serde(default)]
    pub first_seen: BTreeMap<String, DateTime<Utc>>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            tick: 0,
            saved_at: None,
            resume: BTreeMap::new(),
            registry: ConflictRegistry::new(),
            workers: Vec::new(),
            metrics: BTreeMap::new(),
            first_seen: BTreeMap::new(),
        }
    }
}

/// Attempt counts and wall-clock timings for one task, across runs.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskMetrics {
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub last_duration_ms: u64,
    #[serde(default)]
    pub min_duration_ms: u64,
    #[serde(default)]
    pub max_duration_ms: u64,
}

impl TaskMetrics {
    pub fn record(&mut self, duration_ms: u64, succeeded: bool) {
        if self.attempt_count == 0 || duration_ms < self.min_duration_ms {
            self.min_duration_ms = duration_ms;
        }
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.last_duration_ms = duration_ms;
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
        self.attempt_count += 1;
        if succeeded {
            self.success_count += 1;
        }
    }

    pub fn average_duration_ms(&self) -> u64 {
        self.total_duration_ms / u64::from(self.attempt_count.max(1))
    }
}

impl OrchestratorState {
    pub fn resume_for(&self, task_id: &str) -> ResumeMeta {
        self.resume.get(task_id).cloned().unwrap_or_default()
    }

    pub fn resume_mut(&mut self, task_id: &str) -> &mut ResumeMeta {
        self.resume.entry(task_id.to_string()).or_default()
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }

    pub fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|w| w.worker_id == worker_id)
    }

    pub fn active_worker_count(&self) -> usize {
        self.workers.iter().filter(|w| w.status.is_active()).count()
    }

    pub fn has_active_worker(&self, task_id: &str) -> bool {
        self.workers
            .iter()
            .any(|w| w.task_id == task_id && w.status.is_active())
    }

    /// Stamp tasks not seen before with `now`. Returns how many were new.
    pub fn note_tasks(&mut self, tasks: &[Task], now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for task in tasks {
            if !self.first_seen.contains_key(&task.id) {
                self.first_seen.insert(task.id.clone(), now);
                added += 1;
            }
        }
        added
    }
}

/// File-backed store for the state document.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

/// A fully written and synced copy of the state, not yet visible at the
/// canonical path. Dropping it discards the write.
pub struct StagedState {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedState {
    pub fn commit(self) -> Result<(), OrchError> {
        self.temp.persist(&self.target).map_err(|e| {
            OrchError::StatePersistenceFailure(format!(
                "Failed to rename temp file to {}: {}",
                self.target.display(),
                e
            ))
        })?;
        Ok(())
    }
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state document. A missing or blank file is a fresh start.
    pub fn load(&self) -> Result<OrchestratorState, OrchError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OrchestratorState::default());
            }
            Err(e) => {
                return Err(OrchError::StatePersistenceFailure(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        if contents.trim().is_empty() {
            return Ok(OrchestratorState::default());
        }

        let state: OrchestratorState = serde_json::from_str(&contents).map_err(|e| {
            OrchError::StatePersistenceFailure(format!(
                "Corrupt state document {}: {}",
                self.path.display(),
                e
            ))
        })?;

        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(OrchError::StatePersistenceFailure(format!(
                "Unsupported schema_version {} in {} (expected {})",
                state.schema_version,
                self.path.display(),
                STATE_SCHEMA_VERSION
            )));
        }

        Ok(state)
    }

    /// Stamp `saved_at`, write the document to a synced temp file beside the
    /// canonical path and hand it back uncommitted.
    pub fn stage(&self, state: &mut OrchestratorState) -> Result<StagedState, OrchError> {
        let persist_err = |msg: String| OrchError::StatePersistenceFailure(msg);

        let parent = self.path.parent().ok_or_else(|| {
            persist_err(format!(
                "Cannot determine parent directory of {}",
                self.path.display()
            ))
        })?;
        fs::create_dir_all(parent).map_err(|e| {
            persist_err(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;

        state.schema_version = STATE_SCHEMA_VERSION;
        state.saved_at = Some(Utc::now());

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| persist_err(format!("Failed to serialize state: {}", e)))?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| {
            persist_err(format!(
                "Failed to create temp file in {}: {}",
                parent.display(),
                e
            ))
        })?;
        temp.write_all(json.as_bytes())
            .map_err(|e| persist_err(format!("Failed to write temp file: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| persist_err(format!("Failed to sync temp file: {}", e)))?;

        Ok(StagedState {
            temp,
            target: self.path.clone(),
        })
    }

    pub fn save(&self, state: &mut OrchestratorState) -> Result<(), OrchError> {
        self.stage(state)?.commit()
    }
}

/// Signal 0 checks a PID without touching it. EPERM still means the process exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn restore_liveness(state: &mut OrchestratorState, tasks: &mut [Task]) -> Vec<String> {
    restore_liveness_with(state, tasks, pid_alive)
}

/// Reconcile a loaded state with the processes actually running.
///
/// Spawned/running workers whose PID is gone become abandoned, their claims
/// are released and their tasks go back to pending. Tasks left `in_progress`
/// with no open worker are returned to pending as well. Returns the ids of
/// the tasks that were reset.
pub fn restore_liveness_with<F>(
    state: &mut OrchestratorState,
    tasks: &mut [Task],
    is_alive: F,
) -> Vec<String>
where
    F: Fn(u32) -> bool,
{
    let mut reset = Vec::new();

    let dead: Vec<(String, String)> = state
        .workers
        .iter()
        .filter(|w| w.status.is_active())
        .filter(|w| !w.pid.is_some_and(&is_alive))
        .map(|w| (w.worker_id.clone(), w.task_id.clone()))
        .collect();

    for (worker_id, task_id) in dead {
        if let Some(worker) = state.worker_mut(&worker_id) {
            worker.status = WorkerStatus::Abandoned;
        }
        state.registry.release(&worker_id);
        log_warn!(
            "[state] {} for {} is no longer running; marked abandoned",
            worker_id,
            task_id
        );
        reset.push(task_id);
    }

    for task in tasks.iter_mut() {
        if task.status != TaskStatus::InProgress {
            continue;
        }
        if state.has_active_worker(&task.id) {
            continue;
        }
        task.status = TaskStatus::Pending;
        if !reset.contains(&task.id) {
            reset.push(task.id.clone());
        }
    }

    if !reset.is_empty() {
        log_info!("[state] Returned {} task(s) to pending: {:?}", reset.len(), reset);
    }
    reset
}
