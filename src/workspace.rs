use std::path::{Path, PathBuf};

use crate::error::OrchError;
use crate::git;
use crate::log_debug;

/// Isolated git worktree a worker edits in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    /// True when an existing worktree from an earlier attempt was picked up.
    pub reused: bool,
}

/// Creates and removes per-worker worktrees under the configured directory.
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    worktree_dir: PathBuf,
    trunk: String,
}

pub fn branch_for(worker_id: &str) -> String {
    format!("wiggum/{}", worker_id)
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, worktree_dir: PathBuf, trunk: String) -> Self {
        Self {
            root,
            worktree_dir,
            trunk,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    pub fn path_for(&self, worker_id: &str) -> PathBuf {
        self.worktree_dir.join(worker_id)
    }

    /// Return the worker's worktree, creating it from trunk on first use.
    ///
    /// A retried worker keeps its worktree and branch so the resumed agent
    /// sees its own earlier edits.
    pub fn acquire(&self, worker_id: &str) -> Result<Workspace, OrchError> {
        let path = self.path_for(worker_id);
        let branch = branch_for(worker_id);

        if path.join(".git").exists() {
            log_debug!("[workspace] Reusing {}", path.display());
            return Ok(Workspace {
                path,
                branch,
                reused: true,
            });
        }

        std::fs::create_dir_all(&self.worktree_dir).map_err(|e| {
            OrchError::Workspace(format!(
                "Failed to create {}: {}",
                self.worktree_dir.display(),
                e
            ))
        })?;

        // A stale registration for a deleted directory blocks `worktree add`.
        let _ = git::worktree_prune(&self.root);

        let result = if git::branch_exists(&branch, &self.root) {
            git::worktree_attach(&path, &branch, &self.root)
        } else {
            git::worktree_add(&path, &branch, &self.trunk, &self.root)
        };
        result.map_err(OrchError::Workspace)?;

        log_debug!("[workspace] Created {} on {}", path.display(), branch);
        Ok(Workspace {
            path,
            branch,
            reused: false,
        })
    }

    /// Commit whatever the agent left uncommitted and report whether the
    /// branch carries changes trunk does not have.
    pub fn finalize(&self, workspace: &Workspace, message: &str) -> Result<bool, OrchError> {
        git::commit_all(message, &workspace.path).map_err(OrchError::Workspace)?;
        let ahead = git::commits_ahead(&self.trunk, &workspace.path).map_err(OrchError::Workspace)?;
        Ok(ahead > 0)
    }

    /// Remove the worktree. The branch is deleted too when `drop_branch` is set.
    pub fn release(&self, workspace: &Workspace, drop_branch: bool) -> Result<(), OrchError> {
        if workspace.path.exists() {
            git::worktree_remove(&workspace.path, &self.root).map_err(OrchError::Workspace)?;
        }
        let _ = git::worktree_prune(&self.root);
        if drop_branch && git::branch_exists(&workspace.branch, &self.root) {
            git::delete_branch(&workspace.branch, &self.root).map_err(OrchError::Workspace)?;
        }
        Ok(())
    }
}
