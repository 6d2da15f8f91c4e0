#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use wiggum::config::WiggumConfig;
use wiggum::kanban::KanbanFile;
use wiggum::types::{Task, TaskStatus};

/// Fixed clock used by tests that need deterministic timestamps.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Creates a `Task` with minimal defaults.
///
/// The title is auto-generated as `"Test task {id}"`; everything else is
/// empty or default.
pub fn make_task(id: &str, status: TaskStatus) -> Task {
    Task {
        id: id.to_string(),
        title: format!("Test task {}", id),
        status,
        ..Default::default()
    }
}

/// A pending task with the given priority and footprint.
pub fn make_pending(id: &str, priority: i64, footprint: &[&str]) -> Task {
    let mut task = make_task(id, TaskStatus::Pending);
    task.priority = priority;
    task.footprint = footprint.iter().map(|s| s.to_string()).collect();
    task
}

pub fn make_kanban(tasks: Vec<Task>) -> KanbanFile {
    KanbanFile {
        schema_version: 1,
        tasks,
    }
}

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Config tuned for tests: short timeouts, no retry interval, no cooldown.
pub fn default_config() -> WiggumConfig {
    let mut config = WiggumConfig::default();
    config.workers.timeout_secs = 5;
    config.workers.shutdown_grace_secs = 1;
    config.retry.min_retry_interval_secs = 0;
    config.retry.rate_limit_cooldown_secs = 0;
    config.merge.enabled = false;
    config
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Creates a temporary git repository on branch `main` with one commit
/// containing `README.md`, and `.ralph/` ignored.
pub fn setup_test_repo() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let root = dir.path();

    git(root, &["init", "-q"]);
    git(root, &["checkout", "-q", "-b", "main"]);
    git(root, &["config", "user.email", "test@test.com"]);
    git(root, &["config", "user.name", "Test"]);
    git(root, &["config", "commit.gpgsign", "false"]);

    fs::write(root.join("README.md"), "# Test\n").expect("Failed to write README");
    fs::write(root.join(".gitignore"), ".ralph/\n").expect("Failed to write .gitignore");
    git(root, &["add", "README.md", ".gitignore"]);
    git(root, &["commit", "-q", "-m", "Initial commit"]);

    dir
}

/// Commit every change in `dir` with `message`.
pub fn commit_file(dir: &Path, rel: &str, contents: &str, message: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(&path, contents).expect("Failed to write file");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", message]);
}
