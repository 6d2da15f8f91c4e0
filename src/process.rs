use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::OrchError;
use crate::{log_debug, log_warn};

/// Exit code reported when the supervisor kills an invocation for running
/// past its deadline, following GNU `timeout`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install SIGTERM/SIGINT handlers that set the shutdown flag.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Process groups of every agent currently running, so a shutdown can reach
/// children the async side has lost track of.
fn process_registry() -> &'static std::sync::Mutex<HashSet<Pid>> {
    static REGISTRY: OnceLock<std::sync::Mutex<HashSet<Pid>>> = OnceLock::new();
    REGISTRY.get_or_init(|| std::sync::Mutex::new(HashSet::new()))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

pub fn registered_child_count() -> usize {
    process_registry().lock().map(|r| r.len()).unwrap_or(0)
}

/// SIGTERM every registered process group, wait out the grace period, then
/// SIGKILL survivors.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Invocation ---

/// A fully resolved command line for one agent attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Where an attempt's stdout and stderr are written. Kept after the run for audit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturePaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl CapturePaths {
    /// `<runtime_dir>/logs/<worker-id>/attempt-<n>.{stdout.jsonl,stderr.log}`
    pub fn for_attempt(runtime_dir: &Path, worker_id: &str, iteration: u32) -> Self {
        let dir = runtime_dir.join("logs").join(worker_id);
        Self {
            stdout: dir.join(format!("attempt-{}.stdout.jsonl", iteration)),
            stderr: dir.join(format!("attempt-{}.stderr.log", iteration)),
        }
    }
}

/// Deadline, cancellation and PID reporting for one supervised run.
pub struct InvokeControls {
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Receives the child PID once the process is up.
    pub on_spawn: Option<oneshot::Sender<u32>>,
}

impl InvokeControls {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            cancel,
            on_spawn: None,
        }
    }

    pub fn with_spawn_notifier(mut self, tx: oneshot::Sender<u32>) -> Self {
        self.on_spawn = Some(tx);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvocationOutcome {
    pub exit_code: i32,
    pub elapsed: Duration,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub pid: Option<u32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

enum WaitResult {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    }
}

async fn open_capture(path: &Path) -> Result<std::fs::File, OrchError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            OrchError::Spawn(format!(
                "Failed to create capture directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    let file = tokio::fs::File::create(path).await.map_err(|e| {
        OrchError::Spawn(format!(
            "Failed to create capture file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(file.into_std().await)
}

/// Run an invocation in its own process group with output redirected to the
/// capture files.
///
/// A deadline kills the group and reports exit code 124. Cancellation kills
/// the group and reports `cancelled`. A missing executable maps to
/// `BackendUnavailable`.
pub async fn run_supervised(
    invocation: &Invocation,
    capture: &CapturePaths,
    controls: InvokeControls,
) -> Result<InvocationOutcome, OrchError> {
    let stdout = open_capture(&capture.stdout).await?;
    let stderr = open_capture(&capture.stderr).await?;

    let mut cmd = tokio::process::Command::new(&invocation.program);
    cmd.args(&invocation.args);
    cmd.current_dir(&invocation.cwd);
    for (key, value) in &invocation.env {
        cmd.env(key, value);
    }

    // stdin MUST be null: with setpgid the child is in a background process
    // group and a terminal read would stop it with SIGTTIN.
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(stdout);
    cmd.stderr(stderr);
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
    // functions are permitted. setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            OrchError::BackendUnavailable(format!("{} not found: {}", invocation.program, e))
        } else {
            OrchError::Spawn(format!("{}: {}", invocation.program, e))
        }
    })?;

    let child_pid = child
        .id()
        .ok_or_else(|| OrchError::Spawn("Failed to get child PID".to_string()))?;
    let pgid = Pid::from_raw(child_pid as i32);
    register_child(pgid);
    log_debug!(
        "[process] Spawned {} (pid={}, timeout={}s)",
        invocation.program,
        child_pid,
        controls.timeout.as_secs()
    );

    if let Some(tx) = controls.on_spawn {
        let _ = tx.send(child_pid);
    }

    let wait = tokio::select! {
        status = child.wait() => WaitResult::Exited(status),
        _ = tokio::time::sleep(controls.timeout) => WaitResult::TimedOut,
        _ = controls.cancel.cancelled() => WaitResult::Cancelled,
    };

    let (exit_code, timed_out, cancelled) = match wait {
        WaitResult::Exited(status) => {
            let status = status.map_err(|e| {
                unregister_child(pgid);
                OrchError::Spawn(format!("Error waiting for subprocess: {}", e))
            })?;
            // Grandchildren may outlive the leader; the group goes with it.
            kill_process_group(child_pid as i32).await;
            (exit_code_of(status), false, false)
        }
        WaitResult::TimedOut => {
            log_warn!(
                "[process] pid {} exceeded {}s, killing process group",
                child_pid,
                controls.timeout.as_secs()
            );
            kill_process_group(child_pid as i32).await;
            let _ = child.wait().await;
            (TIMEOUT_EXIT_CODE, true, false)
        }
        WaitResult::Cancelled => {
            log_debug!("[process] pid {} cancelled, killing process group", child_pid);
            kill_process_group(child_pid as i32).await;
            let status = child.wait().await.ok();
            (status.map(exit_code_of).unwrap_or(-1), false, true)
        }
    };
    unregister_child(pgid);

    Ok(InvocationOutcome {
        exit_code,
        elapsed: started.elapsed(),
        stdout_path: capture.stdout.clone(),
        stderr_path: capture.stderr.clone(),
        pid: Some(child_pid),
        timed_out,
        cancelled,
    })
}

/// SIGTERM a process group, poll for exit, SIGKILL after the grace period.
///
/// Runs on the blocking pool so the sleep loop never stalls async workers.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline = Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Read a capture file, treating a missing file as empty output.
pub async fn read_capture(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            log_warn!("[process] Failed to read capture {}: {}", path.display(), e);
            String::new()
        }
    }
}
