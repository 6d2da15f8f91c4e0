use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use wiggum::backend::{AnyBackend, Backend};
use wiggum::config::{self, WiggumConfig, CONFIG_FILE_NAME};
use wiggum::coordinator::{self, CoordinatorConfig};
use wiggum::kanban::{self, KanbanFile};
use wiggum::lifecycle::WorkerManager;
use wiggum::lock;
use wiggum::log::parse_log_level;
use wiggum::merge::{GitMerger, Merger};
use wiggum::process::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, registered_child_count,
};
use wiggum::scheduler::{self, RunParams};
use wiggum::state::{self, StateStore};
use wiggum::types::{compare_task_ids, parse_task_status, TaskStatus};
use wiggum::{log_debug, log_error, log_info, log_warn};

const GITIGNORE_ENTRY: &str = ".ralph/";

#[derive(Parser)]
#[command(name = "wiggum", about = "Run coding-agent workers in parallel against a kanban backlog")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/wiggum.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the runtime directories, a sample config and an empty kanban
    Init,
    /// Dispatch eligible tasks to workers until nothing is left to do
    Run {
        /// Maximum concurrent workers (overrides workers.limit)
        #[arg(long)]
        workers: Option<u32>,
        /// Agent backend to drive (claude, codex)
        #[arg(long)]
        backend: Option<String>,
        /// Maximum number of dispatches for this run
        #[arg(long)]
        cap: Option<u32>,
    },
    /// Show tasks, claims, queue and workers
    Status {
        /// Only list tasks with this status (pending, in_progress, blocked, done, failed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Return a failed or blocked task to pending
    ResetTask {
        /// Task ID to reset
        task_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => wiggum::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = &cli.root;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join(CONFIG_FILE_NAME));

    let result = match cli.command {
        Commands::Init => handle_init(root, &config_path),
        Commands::Run {
            workers,
            backend,
            cap,
        } => handle_run(root, &config_path, workers, backend, cap).await,
        Commands::Status { status } => handle_status(root, &config_path, status.as_deref()),
        Commands::ResetTask { task_id } => handle_reset_task(root, &config_path, &task_id),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_init(root: &Path, config_path: &Path) -> Result<(), String> {
    wiggum::git::is_git_repo(Some(root))
        .map_err(|_| "Not a git repository. Run `git init` first.".to_string())?;

    let config = config::load_config_from(config_path)?;

    for dir in [config.runtime_dir(root), config.worktree_dir(root)] {
        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
    }

    if config_path.exists() {
        log_info!("{} already exists, leaving it untouched", config_path.display());
    } else {
        fs::write(config_path, config::default_config_toml()?)
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
        log_info!("Created {}", config_path.display());
    }

    let kanban_path = config.kanban_path(root);
    if kanban_path.exists() {
        log_info!("{} already exists, leaving it untouched", kanban_path.display());
    } else {
        if let Some(parent) = kanban_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
        kanban::save(&kanban_path, &KanbanFile::default())?;
        log_info!("Created {}", kanban_path.display());
    }

    ensure_gitignored(root)?;
    log_info!("Initialized wiggum in {}", root.display());
    Ok(())
}

fn ensure_gitignored(root: &Path) -> Result<(), String> {
    let path = root.join(".gitignore");
    let existing = fs::read_to_string(&path).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == GITIGNORE_ENTRY) {
        return Ok(());
    }
    let mut contents = existing;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(GITIGNORE_ENTRY);
    contents.push('\n');
    fs::write(&path, contents).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}

fn load_with_overrides(
    config_path: &Path,
    workers: Option<u32>,
    backend: Option<String>,
) -> Result<WiggumConfig, String> {
    let mut config = config::load_config_from(config_path)?;
    if let Some(limit) = workers {
        config.workers.limit = limit;
    }
    if let Some(name) = backend {
        config.backend.name = name;
    }
    config::revalidate(&config)?;
    Ok(config)
}

async fn handle_run(
    root: &Path,
    config_path: &Path,
    workers: Option<u32>,
    backend: Option<String>,
    cap: Option<u32>,
) -> Result<(), String> {
    install_signal_handlers()?;

    log_info!("--- wiggum ---");

    let config = load_with_overrides(config_path, workers, backend)?;

    log_info!("[pre] Acquiring lock...");
    let _lock = lock::try_acquire(&config.runtime_dir(root))?;

    log_info!("[pre] Checking git preconditions...");
    wiggum::git::check_preconditions(Some(root))?;

    let backend = AnyBackend::from_config(&config)?;
    log_info!("[pre] Verifying {} CLI...", backend.name());
    backend.init()?;

    let kanban_path = config.kanban_path(root);
    let mut kanban = kanban::load(&kanban_path)?;

    let store = StateStore::new(config.state_path(root));
    let mut orchestrator_state = store.load()?;
    log_debug!("[state] Loaded {} (tick {})", store.path().display(), orchestrator_state.tick);
    let reset = state::restore_liveness(&mut orchestrator_state, &mut kanban.tasks);
    if !reset.is_empty() {
        kanban::save(&kanban_path, &kanban)?;
    }
    store.save(&mut orchestrator_state)?;

    log_info!(
        "[pre] {} task(s) loaded, {} worker(s), backend {}",
        kanban.tasks.len(),
        config.workers.limit,
        config.backend.name
    );

    let manager = Arc::new(WorkerManager::new(Arc::new(backend), &config, root));
    let merger: Option<Arc<dyn Merger + Send + Sync>> = if config.merge.enabled {
        Some(Arc::new(GitMerger::new(
            manager.workspaces().clone(),
            &config.merge.validate_command,
        )))
    } else {
        None
    };

    let (coord_handle, coord_task) = coordinator::spawn_coordinator(
        kanban,
        orchestrator_state,
        store,
        CoordinatorConfig {
            kanban_path,
            worktree_dir: config.worktree_dir(root),
            backend: config.backend.name.clone(),
            retry: config.retry.clone(),
        },
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                cancel_clone.cancel();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    let params = RunParams {
        cap,
        root: root.to_path_buf(),
    };
    let result =
        scheduler::run_scheduler(coord_handle, manager, merger, config, params, cancel).await;

    let stragglers = registered_child_count();
    if stragglers > 0 {
        log_warn!("{} agent process group(s) still running; terminating", stragglers);
        kill_all_children();
    }

    // Handles are gone once the scheduler returns; the actor flushes and exits.
    if let Err(err) = coord_task.await {
        log_warn!("Coordinator task panicked: {:?}", err);
    }

    let summary = result.map_err(|e| {
        log_error!("[sched] Halted: {}", e);
        e.to_string()
    })?;

    log_info!("\n--- Run Summary ---");
    log_info!("Dispatched: {}", summary.dispatched);
    if !summary.tasks_completed.is_empty() {
        log_info!("Completed: {}", summary.tasks_completed.join(", "));
    }
    if !summary.tasks_failed.is_empty() {
        log_info!("Failed: {}", summary.tasks_failed.join(", "));
    }
    if summary.retries_scheduled > 0 {
        log_info!("Retries scheduled: {}", summary.retries_scheduled);
    }
    if !summary.tasks_merged.is_empty() {
        log_info!("Merged: {}", summary.tasks_merged.join(", "));
    }
    for (task_id, reason) in &summary.merges_skipped {
        log_warn!("Merge skipped for {}: {}", task_id, reason);
    }
    log_info!("Halt reason: {:?}", summary.halt_reason);

    Ok(())
}

fn handle_status(root: &Path, config_path: &Path, filter: Option<&str>) -> Result<(), String> {
    let filter = filter.map(parse_task_status).transpose()?;
    let config = config::load_config_from(config_path)?;
    let kanban = kanban::load(&config.kanban_path(root))?;
    let state = StateStore::new(config.state_path(root)).load()?;

    let mut tasks: Vec<_> = kanban
        .tasks
        .iter()
        .filter(|t| filter.map_or(true, |status| t.status == status))
        .collect();
    if tasks.is_empty() {
        println!("No matching tasks in kanban.");
    } else {
        tasks.sort_by(|a, b| {
            status_sort_priority(a.status)
                .cmp(&status_sort_priority(b.status))
                .then_with(|| compare_task_ids(&a.id, &b.id))
        });

        println!(
            "{:<12} {:<12} {:<8} {:<8} {:<10} TITLE",
            "ID", "STATUS", "PRIO", "TRIES", "AVG"
        );
        println!("{}", "-".repeat(80));
        for task in &tasks {
            let attempts = state.resume.get(&task.id).map(|r| r.attempts).unwrap_or(0);
            let avg = state
                .metrics
                .get(&task.id)
                .filter(|m| m.attempt_count > 0)
                .map(|m| format!("{:.1}s", m.average_duration_ms() as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<12} {:<12} {:<8} {:<8} {:<10} {}",
                task.id,
                task.status.to_string(),
                task.priority,
                attempts,
                avg,
                truncate_title(&task.title, 40)
            );
        }
        println!("\n{} of {} task(s) shown", tasks.len(), kanban.tasks.len());
    }

    let open_workers: Vec<_> = state
        .workers
        .iter()
        .filter(|w| !w.status.is_terminal())
        .collect();
    if !open_workers.is_empty() {
        println!("\nWorkers ({} active):", state.active_worker_count());
        for worker in open_workers {
            println!(
                "  {} {} task={} iteration={} pid={}",
                worker.worker_id,
                worker.status,
                worker.task_id,
                worker.iteration,
                worker
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    if !state.registry.claims().is_empty() {
        println!("\nClaims:");
        for claim in state.registry.claims() {
            println!("  {} <- {} ({})", claim.pattern, claim.worker_id, claim.task_id);
        }
    }

    if !state.registry.queue().is_empty() {
        println!("\nQueue:");
        for entry in state.registry.queue() {
            println!(
                "  {} waiting on {} ({})",
                entry.task_id, entry.blocking.worker_id, entry.blocking.pattern
            );
        }
    }

    Ok(())
}

fn handle_reset_task(root: &Path, config_path: &Path, task_id: &str) -> Result<(), String> {
    let config = config::load_config_from(config_path)?;
    let _lock = lock::try_acquire(&config.runtime_dir(root))?;

    let kanban_path = config.kanban_path(root);
    let mut kanban = kanban::load(&kanban_path)?;
    let store = StateStore::new(config.state_path(root));
    let mut state = store.load()?;

    coordinator::reset_task(&mut state, &mut kanban, task_id)?;

    store.save(&mut state)?;
    kanban::save(&kanban_path, &kanban)?;
    log_info!("{} reset to pending", task_id);
    Ok(())
}

fn status_sort_priority(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::InProgress => 0,
        TaskStatus::Pending => 1,
        TaskStatus::Blocked => 2,
        TaskStatus::Failed => 3,
        TaskStatus::Done => 4,
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let truncated: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
