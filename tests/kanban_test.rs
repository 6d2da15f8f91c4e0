mod common;

use std::cmp::Ordering;
use std::fs;

use tempfile::TempDir;

use common::{make_kanban, make_pending, make_task};
use wiggum::kanban::{self, KanbanFile};
use wiggum::types::{compare_task_ids, parse_task_status, TaskStatus, WorkerStatus};

fn write_kanban(dir: &TempDir, yaml: &str) -> std::path::PathBuf {
    let path = dir.path().join("kanban.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

// --- Loading ---

#[test]
fn loads_tasks_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_kanban(
        &dir,
        r#"
schema_version: 1
tasks:
  - id: T-1
    title: Add login endpoint
    status: in_progress
    priority: 7
    footprint: ["src/api/**"]
    created: 2026-02-01T09:30:00Z
  - id: T-2
    title: Write docs
    dependencies: [T-1]
    plan: plans/T-2.md
    parent: E-1
"#,
    );

    let kanban = kanban::load(&path).unwrap();
    assert_eq!(kanban.tasks.len(), 2);

    let t1 = kanban.find("T-1").unwrap();
    assert_eq!(t1.status, TaskStatus::InProgress);
    assert_eq!(t1.priority, 7);
    assert_eq!(t1.footprint, vec!["src/api/**"]);
    assert!(t1.created.is_some());

    let t2 = kanban.find("T-2").unwrap();
    assert_eq!(t2.status, TaskStatus::Pending);
    assert_eq!(t2.priority, 0);
    assert_eq!(t2.dependencies, vec!["T-1"]);
    assert_eq!(t2.plan.as_deref(), Some("plans/T-2.md"));
    assert_eq!(t2.parent.as_deref(), Some("E-1"));
}

#[test]
fn named_priorities_map_to_levels() {
    let dir = TempDir::new().unwrap();
    let path = write_kanban(
        &dir,
        r#"
schema_version: 1
tasks:
  - {id: T-1, priority: critical}
  - {id: T-2, priority: High}
  - {id: T-3, priority: medium}
  - {id: T-4, priority: low}
"#,
    );
    let kanban = kanban::load(&path).unwrap();
    let priorities: Vec<i64> = kanban.tasks.iter().map(|t| t.priority).collect();
    assert_eq!(priorities, vec![40, 30, 20, 10]);
}

#[test]
fn unknown_priority_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_kanban(
        &dir,
        "schema_version: 1\ntasks:\n  - {id: T-1, priority: urgent}\n",
    );
    let err = kanban::load(&path).unwrap_err();
    assert!(err.contains("Failed to parse YAML"), "{}", err);
}

#[test]
fn unknown_fields_are_ignored() {
    let dir = TempDir::new().unwrap();
    let path = write_kanban(
        &dir,
        r#"
schema_version: 1
board_color: teal
tasks:
  - id: T-1
    column: Doing
    assignee: someone
"#,
    );
    let kanban = kanban::load(&path).unwrap();
    assert_eq!(kanban.tasks[0].id, "T-1");
}

#[test]
fn missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = kanban::load(&dir.path().join("nope.yaml")).unwrap_err();
    assert!(err.contains("Failed to read"), "{}", err);
}

#[test]
fn duplicate_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_kanban(
        &dir,
        "schema_version: 1\ntasks:\n  - {id: T-1}\n  - {id: T-1}\n",
    );
    let err = kanban::load(&path).unwrap_err();
    assert!(err.contains("Duplicate task id 'T-1'"), "{}", err);
}

#[test]
fn unsupported_schema_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_kanban(&dir, "schema_version: 2\ntasks: []\n");
    let err = kanban::load(&path).unwrap_err();
    assert!(err.contains("Unsupported schema_version 2"), "{}", err);
}

#[test]
fn unknown_dependency_loads_with_warning() {
    let dir = TempDir::new().unwrap();
    let path = write_kanban(
        &dir,
        "schema_version: 1\ntasks:\n  - {id: T-1, dependencies: [T-404]}\n",
    );
    let kanban = kanban::load(&path).unwrap();
    assert_eq!(kanban.tasks[0].dependencies, vec!["T-404"]);
}

// --- Saving ---

#[test]
fn save_creates_parents_and_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".ralph/nested/kanban.yaml");
    let mut task = make_pending("T-1", 5, &["src"]);
    task.dependencies = vec!["T-0".to_string()];
    let original = make_kanban(vec![make_task("T-0", TaskStatus::Done), task]);

    kanban::save(&path, &original).unwrap();
    let loaded = kanban::load(&path).unwrap();
    assert_eq!(loaded, original);

    let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
    assert_eq!(leftovers.len(), 1);
}

#[test]
fn save_omits_empty_optional_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kanban.yaml");
    kanban::save(&path, &make_kanban(vec![make_task("T-1", TaskStatus::Pending)])).unwrap();

    let yaml = fs::read_to_string(&path).unwrap();
    assert!(yaml.contains("status: pending"), "{}", yaml);
    assert!(!yaml.contains("footprint"), "{}", yaml);
    assert!(!yaml.contains("plan"), "{}", yaml);
}

#[test]
fn set_status_updates_only_known_tasks() {
    let mut kanban = make_kanban(vec![make_task("T-1", TaskStatus::Pending)]);
    kanban.set_status("T-1", TaskStatus::Done).unwrap();
    assert_eq!(kanban.find("T-1").unwrap().status, TaskStatus::Done);

    let err = kanban.set_status("T-9", TaskStatus::Done).unwrap_err();
    assert!(err.contains("T-9"));
    assert_eq!(kanban.tasks.len(), 1);
}

#[test]
fn default_kanban_is_empty_current_version() {
    let kanban = KanbanFile::default();
    assert_eq!(kanban.schema_version, kanban::EXPECTED_SCHEMA_VERSION);
    assert!(kanban.tasks.is_empty());
}

// --- Task types ---

#[test]
fn natural_id_ordering() {
    assert_eq!(compare_task_ids("T-2", "T-10"), Ordering::Less);
    assert_eq!(compare_task_ids("T-10", "T-10"), Ordering::Equal);
    assert_eq!(compare_task_ids("A-9", "B-1"), Ordering::Less);
    assert_eq!(compare_task_ids("T-02", "T-2"), Ordering::Less);
    assert_eq!(compare_task_ids("alpha", "T-1"), Ordering::Greater);
}

#[test]
fn status_parsing_and_terminality() {
    assert_eq!(parse_task_status("in-progress").unwrap(), TaskStatus::InProgress);
    assert_eq!(parse_task_status("DONE").unwrap(), TaskStatus::Done);
    assert!(parse_task_status("archived").is_err());

    assert!(TaskStatus::Done.is_terminal());
    assert!(TaskStatus::Failed.is_terminal());
    assert!(!TaskStatus::Blocked.is_terminal());

    assert!(WorkerStatus::Running.is_active());
    assert!(!WorkerStatus::AwaitingRetry.is_active());
    assert!(!WorkerStatus::AwaitingRetry.is_terminal());
    assert!(WorkerStatus::Abandoned.is_terminal());
}
