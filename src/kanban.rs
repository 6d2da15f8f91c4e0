use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::log_warn;
use crate::types::{Task, TaskStatus};

pub const EXPECTED_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KanbanFile {
    pub schema_version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Default for KanbanFile {
    fn default() -> Self {
        Self {
            schema_version: EXPECTED_SCHEMA_VERSION,
            tasks: Vec::new(),
        }
    }
}

impl KanbanFile {
    pub fn find(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn find_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Update only the status of a task. Tasks are never removed from the backlog.
    pub fn set_status(&mut self, task_id: &str, status: TaskStatus) -> Result<(), String> {
        let task = self
            .find_mut(task_id)
            .ok_or_else(|| format!("Task {} not found in kanban", task_id))?;
        task.status = status;
        Ok(())
    }
}

/// Load the kanban backlog. The file must exist; the orchestrator never
/// invents a backlog on its own outside of `wiggum init`.
///
/// Unknown fields are ignored so the backlog can carry presentation data.
pub fn load(path: &Path) -> Result<KanbanFile, String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let kanban: KanbanFile = serde_yaml_ng::from_str(&contents)
        .map_err(|e| format!("Failed to parse YAML from {}: {}", path.display(), e))?;

    if kanban.schema_version != EXPECTED_SCHEMA_VERSION {
        return Err(format!(
            "Unsupported schema_version {} in {} (expected {})",
            kanban.schema_version,
            path.display(),
            EXPECTED_SCHEMA_VERSION
        ));
    }

    let mut seen = HashSet::new();
    for task in &kanban.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(format!(
                "Duplicate task id '{}' in {}",
                task.id,
                path.display()
            ));
        }
    }

    for task in &kanban.tasks {
        for dep in &task.dependencies {
            if kanban.find(dep).is_none() {
                log_warn!(
                    "[kanban] {} depends on unknown task {}; it stays ineligible",
                    task.id,
                    dep
                );
            }
        }
    }

    Ok(kanban)
}

/// Write the kanban back with a temp-file + rename so readers only ever see
/// the old or the new document.
pub fn save(path: &Path, kanban: &KanbanFile) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("Cannot determine parent directory of {}", path.display()))?;

    fs::create_dir_all(parent)
        .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;

    let yaml = serde_yaml_ng::to_string(kanban)
        .map_err(|e| format!("Failed to serialize kanban to YAML: {}", e))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|e| format!("Failed to create temp file in {}: {}", parent.display(), e))?;

    temp_file
        .write_all(yaml.as_bytes())
        .map_err(|e| format!("Failed to write temp file: {}", e))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| format!("Failed to sync temp file: {}", e))?;

    temp_file
        .persist(path)
        .map_err(|e| format!("Failed to rename temp file to {}: {}", path.display(), e))?;

    Ok(())
}
