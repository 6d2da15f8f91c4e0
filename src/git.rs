use std::path::Path;
use std::process::Command;

/// A single entry from `git status --porcelain` output.
///
/// Porcelain v1 uses ASCII for the two-character status code and separator,
/// so slicing at 0..2 and 3.. is safe. Paths with special characters may be
/// quoted by git.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    /// Two-character status code (e.g., "M ", "??", "A ")
    pub status_code: String,
    pub path: String,
}

pub fn is_git_repo(repo_dir: Option<&Path>) -> Result<(), String> {
    run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;
    Ok(())
}

/// Verify the project root is fit for integrating worker branches.
///
/// Checks:
/// - Git repo exists
/// - Tracked files are clean (untracked files are tolerated)
/// - HEAD is on a branch and no rebase/merge is in progress
pub fn check_preconditions(repo_dir: Option<&Path>) -> Result<(), String> {
    let git_dir_output = run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;

    let dirty: Vec<StatusEntry> = get_status(repo_dir)?
        .into_iter()
        .filter(|e| e.status_code != "??")
        .collect();
    if !dirty.is_empty() {
        return Err(format!(
            "Working tree has uncommitted changes ({} file(s)). Commit or stash them before running the orchestrator.",
            dirty.len()
        ));
    }

    if run_git_command(&["symbolic-ref", "--quiet", "HEAD"], repo_dir).is_err() {
        return Err(
            "Detached HEAD state detected. Check out a branch before running the orchestrator."
                .to_string(),
        );
    }

    let git_dir_path = match repo_dir {
        Some(base) => base.join(git_dir_output.trim()),
        None => std::path::PathBuf::from(git_dir_output.trim()),
    };

    if git_dir_path.join("rebase-merge").exists() || git_dir_path.join("rebase-apply").exists() {
        return Err(
            "Rebase in progress. Complete or abort the rebase before running the orchestrator."
                .to_string(),
        );
    }

    if git_dir_path.join("MERGE_HEAD").exists() {
        return Err(
            "Merge in progress. Complete or abort the merge before running the orchestrator."
                .to_string(),
        );
    }

    Ok(())
}

pub fn get_status(repo_dir: Option<&Path>) -> Result<Vec<StatusEntry>, String> {
    let output = run_git_command(&["status", "--porcelain"], repo_dir)?;

    let entries = output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            if line.len() < 3 {
                None
            } else {
                Some(StatusEntry {
                    status_code: line[..2].to_string(),
                    path: line[3..].to_string(),
                })
            }
        })
        .collect();

    Ok(entries)
}

pub fn get_head_sha(repo_dir: &Path) -> Result<String, String> {
    let output = run_git_command(&["rev-parse", "HEAD"], Some(repo_dir))?;
    Ok(output.trim().to_string())
}

pub fn current_branch(repo_dir: &Path) -> Result<String, String> {
    let output = run_git_command(&["rev-parse", "--abbrev-ref", "HEAD"], Some(repo_dir))?;
    Ok(output.trim().to_string())
}

pub fn branch_exists(branch: &str, repo_dir: &Path) -> bool {
    let reference = format!("refs/heads/{}", branch);
    run_git_command(
        &["show-ref", "--verify", "--quiet", &reference],
        Some(repo_dir),
    )
    .is_ok()
}

/// Create a worktree at `path` on a new branch started from `base`.
pub fn worktree_add(path: &Path, branch: &str, base: &str, repo_dir: &Path) -> Result<(), String> {
    let path_str = path_arg(path)?;
    run_git_command(
        &["worktree", "add", "-b", branch, path_str, base],
        Some(repo_dir),
    )?;
    Ok(())
}

/// Attach a worktree at `path` to an existing branch.
pub fn worktree_attach(path: &Path, branch: &str, repo_dir: &Path) -> Result<(), String> {
    let path_str = path_arg(path)?;
    run_git_command(&["worktree", "add", path_str, branch], Some(repo_dir))?;
    Ok(())
}

pub fn worktree_remove(path: &Path, repo_dir: &Path) -> Result<(), String> {
    let path_str = path_arg(path)?;
    run_git_command(&["worktree", "remove", "--force", path_str], Some(repo_dir))?;
    Ok(())
}

pub fn worktree_prune(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["worktree", "prune"], Some(repo_dir))?;
    Ok(())
}

pub fn delete_branch(branch: &str, repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["branch", "-D", branch], Some(repo_dir))?;
    Ok(())
}

/// Stage everything in a worktree and commit it. Returns false when there
/// was nothing to commit.
pub fn commit_all(message: &str, repo_dir: &Path) -> Result<bool, String> {
    if get_status(Some(repo_dir))?.is_empty() {
        return Ok(false);
    }
    run_git_command(&["add", "-A"], Some(repo_dir))?;
    run_git_command(&["commit", "-m", message], Some(repo_dir))?;
    Ok(true)
}

/// Number of commits on HEAD that `base` does not have.
pub fn commits_ahead(base: &str, repo_dir: &Path) -> Result<u32, String> {
    let range = format!("{}..HEAD", base);
    let output = run_git_command(&["rev-list", "--count", &range], Some(repo_dir))?;
    output
        .trim()
        .parse()
        .map_err(|e| format!("Unexpected rev-list output '{}': {}", output.trim(), e))
}

/// Rebase the checked-out branch onto `onto`, aborting on conflict so the
/// worktree is left as it was.
pub fn rebase_onto(onto: &str, repo_dir: &Path) -> Result<(), String> {
    if let Err(e) = run_git_command(&["rebase", onto], Some(repo_dir)) {
        let _ = run_git_command(&["rebase", "--abort"], Some(repo_dir));
        return Err(e);
    }
    Ok(())
}

/// `git merge --no-ff` of `branch` into the checked-out branch. A conflicted
/// merge is aborted before the error is returned.
pub fn merge_no_ff(branch: &str, message: &str, repo_dir: &Path) -> Result<(), String> {
    if let Err(e) = run_git_command(&["merge", "--no-ff", "-m", message, branch], Some(repo_dir)) {
        let _ = run_git_command(&["merge", "--abort"], Some(repo_dir));
        return Err(e);
    }
    Ok(())
}

pub fn reset_hard(rev: &str, repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["reset", "--hard", rev], Some(repo_dir))?;
    Ok(())
}

fn path_arg(path: &Path) -> Result<&str, String> {
    path.to_str()
        .ok_or_else(|| format!("Path contains invalid UTF-8: {:?}", path))
}

/// Run a git command and return its stdout as a string.
pub(crate) fn run_git_command(args: &[&str], repo_dir: Option<&Path>) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args(args);

    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}
