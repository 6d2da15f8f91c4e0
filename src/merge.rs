use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};

use crate::conflict::normalize_pattern;
use crate::git;
use crate::types::compare_task_ids;
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{log_debug, log_info, log_warn};

/// A finished worker branch waiting to be integrated into trunk.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeCandidate {
    pub task_id: String,
    pub worker_id: String,
    pub branch: String,
    pub workspace: PathBuf,
    pub footprint: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeReport {
    pub merged: Vec<String>,
    /// `(task_id, reason)` for every candidate left unmerged.
    pub skipped: Vec<(String, String)>,
}

/// Integrates one candidate into trunk.
pub trait Merger {
    fn integrate(&self, candidate: &MergeCandidate) -> Result<(), String>;

    /// Called after a successful integration.
    fn cleanup(&self, _candidate: &MergeCandidate) -> Result<(), String> {
        Ok(())
    }
}

/// Directory a footprint pattern lives in.
///
/// A glob keys on its literal prefix up to the last separator. A plain path
/// that names a directory (trailing separator, or no file extension) is its
/// own key. Top-level files map to `.`.
pub fn directory_key(pattern: &str) -> String {
    let normalized = normalize_pattern(pattern);
    let literal = match normalized.find(['*', '?', '[', '{']) {
        Some(idx) => &normalized[..idx],
        None => {
            let trailing_sep = pattern.trim_end().ends_with(['/', '\\']);
            if trailing_sep || Path::new(&normalized).extension().is_none() {
                return normalized;
            }
            normalized.as_str()
        }
    };
    match literal.rfind('/') {
        Some(0) | None => ".".to_string(),
        Some(idx) => literal[..idx].to_string(),
    }
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    let mut node = i;
    while parent[node] != root {
        let next = parent[node];
        parent[node] = root;
        node = next;
    }
    root
}

fn by_completion(a: &MergeCandidate, b: &MergeCandidate) -> std::cmp::Ordering {
    a.completed_at
        .cmp(&b.completed_at)
        .then_with(|| compare_task_ids(&a.task_id, &b.task_id))
}

/// Order candidates so branches touching the same directories merge back to
/// back.
///
/// Candidates sharing a directory key (transitively) form a group. Groups are
/// emitted by their earliest completion; members by completion time, then
/// task id. Unrelated candidates keep completion order.
pub fn order_merges(candidates: Vec<MergeCandidate>) -> Vec<MergeCandidate> {
    let mut candidates = candidates;
    candidates.sort_by(by_completion);

    let mut parent: Vec<usize> = (0..candidates.len()).collect();
    let mut owner: HashMap<String, usize> = HashMap::new();

    for (idx, candidate) in candidates.iter().enumerate() {
        let keys: BTreeSet<String> = candidate.footprint.iter().map(|p| directory_key(p)).collect();
        for key in keys {
            match owner.get(&key) {
                Some(&other) => {
                    let a = find(&mut parent, idx);
                    let b = find(&mut parent, other);
                    if a != b {
                        // Keep the earlier candidate as the group root.
                        let (keep, join) = if a < b { (a, b) } else { (b, a) };
                        parent[join] = keep;
                    }
                }
                None => {
                    owner.insert(key, idx);
                }
            }
        }
    }

    // Group roots are the earliest member, so iterating in completion order
    // visits groups by their earliest completion.
    let roots: Vec<usize> = (0..candidates.len())
        .map(|i| find(&mut parent, i))
        .collect();
    let mut order: Vec<usize> = Vec::with_capacity(candidates.len());
    let mut seen_roots = BTreeSet::new();
    for &root in &roots {
        if seen_roots.insert(root) {
            order.extend((0..candidates.len()).filter(|&i| roots[i] == root));
        }
    }

    let mut slots: Vec<Option<MergeCandidate>> = candidates.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

/// Integrate candidates in `order_merges` order. A failing candidate is
/// skipped with its reason and the rest still merge.
pub fn merge_all<M: Merger + ?Sized>(candidates: Vec<MergeCandidate>, merger: &M) -> MergeReport {
    let mut report = MergeReport::default();

    for candidate in order_merges(candidates) {
        match merger.integrate(&candidate) {
            Ok(()) => {
                log_info!("[merge] {} merged ({})", candidate.task_id, candidate.branch);
                if let Err(e) = merger.cleanup(&candidate) {
                    log_warn!("[merge] {} cleanup failed: {}", candidate.task_id, e);
                }
                report.merged.push(candidate.task_id);
            }
            Err(reason) => {
                log_warn!("[merge] {} skipped: {}", candidate.task_id, reason);
                report.skipped.push((candidate.task_id, reason));
            }
        }
    }

    report
}

/// Merges worker branches into trunk at the project root with `--no-ff`.
pub struct GitMerger {
    workspaces: WorkspaceManager,
    validate_command: Option<String>,
}

impl GitMerger {
    pub fn new(workspaces: WorkspaceManager, validate_command: &str) -> Self {
        let validate_command = Some(validate_command.trim().to_string()).filter(|c| !c.is_empty());
        Self {
            workspaces,
            validate_command,
        }
    }

    fn validate(&self, root: &Path) -> Result<(), String> {
        let Some(command) = &self.validate_command else {
            return Ok(());
        };
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(root)
            .output()
            .map_err(|e| format!("Failed to run validation command: {}", e))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "validation failed ({:?}): {}",
                output.status.code(),
                stderr.trim()
            ))
        }
    }
}

impl Merger for GitMerger {
    fn integrate(&self, candidate: &MergeCandidate) -> Result<(), String> {
        let root = self.workspaces.root();
        let trunk = self.workspaces.trunk();

        let current = git::current_branch(root)?;
        if current != trunk {
            return Err(format!(
                "project root is on '{}', expected trunk '{}'",
                current, trunk
            ));
        }

        if candidate.workspace.exists() {
            git::rebase_onto(trunk, &candidate.workspace)
                .map_err(|e| format!("rebase onto {} failed: {}", trunk, e))?;
        }

        let message = format!("[{}] Merge {}", candidate.task_id, candidate.branch);
        git::merge_no_ff(&candidate.branch, &message, root)?;

        if let Err(e) = self.validate(root) {
            git::reset_hard("ORIG_HEAD", root)
                .map_err(|reset| format!("{}; rollback also failed: {}", e, reset))?;
            return Err(e);
        }

        if let Ok(sha) = git::get_head_sha(root) {
            log_debug!("[merge] {} at {} after {}", trunk, sha, candidate.task_id);
        }
        Ok(())
    }

    fn cleanup(&self, candidate: &MergeCandidate) -> Result<(), String> {
        let workspace = Workspace {
            path: candidate.workspace.clone(),
            branch: candidate.branch.clone(),
            reused: false,
        };
        self.workspaces
            .release(&workspace, true)
            .map_err(String::from)
    }
}
