use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchError;
use crate::log_debug;
use crate::types::{ClaimRef, ConflictClaim, QueueEntry};

const GLOB_META: &[char] = &['*', '?', '[', '{'];

/// Canonical form used for footprint comparison: forward slashes, no leading
/// `./`, no trailing `/`, no doubled separators. The project root becomes `.`.
pub fn normalize_pattern(pattern: &str) -> String {
    let mut p = pattern.trim().replace('\\', "/");
    while p.contains("//") {
        p = p.replace("//", "/");
    }
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    if p.is_empty() || p == "/" {
        ".".to_string()
    } else {
        p
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(GLOB_META)
}

/// Literal text before the first glob metacharacter.
fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(GLOB_META) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

fn contains_path(dir: &str, path: &str) -> bool {
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Conservative overlap test between two footprint patterns.
///
/// May report overlap for patterns that never match a common file, but never
/// misses a real one.
pub fn patterns_intersect(a: &str, b: &str) -> bool {
    let a = normalize_pattern(a);
    let b = normalize_pattern(b);

    if a == "." || b == "." || a == b {
        return true;
    }

    if is_glob(&a) || is_glob(&b) {
        let pa = literal_prefix(&a);
        let pb = literal_prefix(&b);
        return pa.starts_with(pb) || pb.starts_with(pa);
    }

    contains_path(&a, &b) || contains_path(&b, &a)
}

/// First pair `(ours, theirs)` of intersecting patterns between two footprints.
pub fn footprints_intersect<'a>(ours: &'a [String], theirs: &'a [String]) -> Option<(&'a str, &'a str)> {
    ours.iter().find_map(|a| {
        theirs
            .iter()
            .find(|b| patterns_intersect(a, b))
            .map(|b| (a.as_str(), b.as_str()))
    })
}

/// Active footprint claims plus the FIFO queue of tasks waiting on them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ConflictRegistry {
    #[serde(default)]
    claims: Vec<ConflictClaim>,
    #[serde(default)]
    queue: Vec<QueueEntry>,
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claims(&self) -> &[ConflictClaim] {
        &self.claims
    }

    pub fn queue(&self) -> &[QueueEntry] {
        &self.queue
    }

    pub fn claims_for<'a>(&'a self, worker_id: &'a str) -> impl Iterator<Item = &'a ConflictClaim> {
        self.claims.iter().filter(move |c| c.worker_id == worker_id)
    }

    /// The active claim that a footprint would collide with, if any.
    pub fn find_conflict(&self, footprint: &[String]) -> Option<ClaimRef> {
        footprint.iter().find_map(|pattern| {
            self.claims
                .iter()
                .find(|claim| patterns_intersect(pattern, &claim.pattern))
                .map(ConflictClaim::as_ref)
        })
    }

    /// Claim every pattern of the footprint for one worker, or none of them.
    pub fn claim(
        &mut self,
        footprint: &[String],
        worker_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OrchError> {
        if let Some(existing) = self.find_conflict(footprint) {
            return Err(OrchError::Conflict {
                pattern: existing.pattern,
                worker_id: existing.worker_id,
            });
        }

        for pattern in footprint {
            self.claims.push(ConflictClaim {
                pattern: normalize_pattern(pattern),
                worker_id: worker_id.to_string(),
                task_id: task_id.to_string(),
                claimed_at: now,
            });
        }
        log_debug!(
            "[conflict] {} claimed {} pattern(s) for {}",
            worker_id,
            footprint.len(),
            task_id
        );
        Ok(())
    }

    /// Drop a worker's claims and return the queued tasks that became free,
    /// in FIFO order. Entries still blocked are re-pointed at their new blocker.
    pub fn release(&mut self, worker_id: &str) -> Vec<String> {
        let before = self.claims.len();
        self.claims.retain(|c| c.worker_id != worker_id);
        let released = before - self.claims.len();

        let mut freed = Vec::new();
        let mut remaining = Vec::with_capacity(self.queue.len());
        for mut entry in std::mem::take(&mut self.queue) {
            if entry.blocking.worker_id != worker_id {
                remaining.push(entry);
                continue;
            }
            match self.find_conflict(&entry.footprint) {
                Some(blocker) => {
                    entry.blocking = blocker;
                    remaining.push(entry);
                }
                None => freed.push(entry.task_id),
            }
        }
        self.queue = remaining;

        if released > 0 || !freed.is_empty() {
            log_debug!(
                "[conflict] {} released {} claim(s); dequeued {:?}",
                worker_id,
                released,
                freed
            );
        }
        freed
    }

    /// Append a task to the wait queue. Re-enqueueing a queued task only
    /// refreshes its blocker; its position is kept.
    pub fn enqueue(
        &mut self,
        task_id: &str,
        footprint: &[String],
        blocking: ClaimRef,
        now: DateTime<Utc>,
    ) {
        if let Some(entry) = self.queue.iter_mut().find(|e| e.task_id == task_id) {
            entry.blocking = blocking;
            return;
        }
        self.queue.push(QueueEntry {
            task_id: task_id.to_string(),
            footprint: footprint.to_vec(),
            blocking,
            enqueued_at: now,
        });
    }

    pub fn dequeue(&mut self, task_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|e| e.task_id != task_id);
        before != self.queue.len()
    }

    pub fn is_queued(&self, task_id: &str) -> bool {
        self.queue.iter().any(|e| e.task_id == task_id)
    }
}
