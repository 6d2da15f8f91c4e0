use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;
use crate::state::pid_alive;

/// Holds the single-instance run lock. Released on drop.
#[must_use = "lock is released when RunLock is dropped"]
pub struct RunLock {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Warning: Failed to release run lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            log_warn!(
                "Warning: Failed to remove PID file {}: {}",
                self.pid_path.display(),
                e
            );
        }
    }
}

/// Take the run lock in the runtime directory so two orchestrators never
/// write the same state document.
///
/// The OS file lock provides exclusion; the PID file only feeds the error
/// message shown to the second instance.
pub fn try_acquire(runtime_dir: &Path) -> Result<RunLock, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let lock_path = runtime_dir.join("wiggum.lock");
    let pid_path = runtime_dir.join("wiggum.pid");

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire lock: {}", e))?;

    if !acquired {
        let holder = fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());

        return match holder {
            Some(pid) if pid_alive(pid) => Err(format!(
                "Another wiggum instance is running (PID {})",
                pid
            )),
            Some(pid) => Err(format!(
                "Lock file is held but recorded PID {} is not alive. \
                 Remove {} and {} to recover",
                pid,
                lock_path.display(),
                pid_path.display()
            )),
            None => Err(format!(
                "Another wiggum instance holds the lock. If this is stale, remove {}",
                lock_path.display()
            )),
        };
    }

    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| format!("Failed to write PID file: {}", e))?;

    Ok(RunLock { lock, pid_path })
}
