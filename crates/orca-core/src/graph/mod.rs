//! In-memory dependency graph over tracked issues.
//!
//! Two multi-maps keyed by `issue_id`: `blocked_by[X]` holds every issue
//! that must reach `done` before `X` is dispatchable, `blocks[X]` is the
//! inverse. The graph is rebuilt atomically on every full tracker sync and
//! patched incrementally on webhook deltas.

use std::collections::{HashMap, HashSet};

/// A single "blocks" relation between two issues, as reported by the tracker.
#[derive(Debug, Clone)]
pub struct Relation {
    pub blocker: String,
    pub blocked: String,
}

/// The priority bucket used by `effective_priority`: `0` means
/// unprioritized and is treated as "no constraint", `1..=4` is a real
/// priority (lower is more urgent).
fn p_star(priority: i64) -> i64 {
    if (1..=4).contains(&priority) {
        priority
    } else {
        i64::MAX
    }
}

/// In-memory dependency graph. Not thread-safe on its own; callers hold a
/// single writer (tracker sync) and readers take a snapshot reference per
/// scheduler tick.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    blocked_by: HashMap<String, HashSet<String>>,
    blocks: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear and reload from a fresh relation set, as produced by a full
    /// tracker sync.
    pub fn rebuild(&mut self, relations: &[Relation]) {
        self.blocked_by.clear();
        self.blocks.clear();
        for relation in relations {
            self.add_relation(&relation.blocker, &relation.blocked);
        }
    }

    pub fn add_relation(&mut self, blocker: &str, blocked: &str) {
        self.blocked_by
            .entry(blocked.to_string())
            .or_default()
            .insert(blocker.to_string());
        self.blocks
            .entry(blocker.to_string())
            .or_default()
            .insert(blocked.to_string());
    }

    pub fn remove_relation(&mut self, blocker: &str, blocked: &str) {
        if let Some(set) = self.blocked_by.get_mut(blocked) {
            set.remove(blocker);
        }
        if let Some(set) = self.blocks.get_mut(blocker) {
            set.remove(blocked);
        }
    }

    /// Every issue currently recorded as blocking `blocked`, empty if none.
    pub fn blockers_of(&self, blocked: &str) -> HashSet<String> {
        self.blocked_by.get(blocked).cloned().unwrap_or_default()
    }

    /// True iff every issue blocking `task_id` has reached `done`. An empty
    /// blocking set is vacuously dispatchable.
    pub fn is_dispatchable<'a>(&self, task_id: &str, status_of: impl Fn(&str) -> Option<&'a str>) -> bool {
        match self.blocked_by.get(task_id) {
            None => true,
            Some(blockers) => blockers.iter().all(|b| status_of(b) == Some("done")),
        }
    }

    /// `p*(x) = priority(x)` when `priority(x) in 1..=4`, else `+inf`.
    /// Returns `min(p*(task_id), min over transitive blocks(task_id) of p*)`.
    /// If every candidate is `+inf`, the task's own raw priority is returned
    /// unchanged (this preserves `0`, which otherwise would be masked by the
    /// infinity sentinel). Cycles are broken via a visited set; a revisited
    /// node is logged once and skipped.
    pub fn effective_priority(&self, task_id: &str, priority_of: impl Fn(&str) -> i64) -> i64 {
        let own_priority = priority_of(task_id);
        let mut best = p_star(own_priority);
        let mut visited = HashSet::new();
        visited.insert(task_id.to_string());
        let mut stack: Vec<String> = self
            .blocks
            .get(task_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                tracing::warn!(task_id = %node, "cycle detected while computing effective priority, skipping revisit");
                continue;
            }
            best = best.min(p_star(priority_of(&node)));
            if let Some(children) = self.blocks.get(&node) {
                stack.extend(children.iter().cloned());
            }
        }

        if best == i64::MAX {
            own_priority
        } else {
            best
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blocked_by_is_dispatchable() {
        let graph = DependencyGraph::new();
        assert!(graph.is_dispatchable("T-1", |_| None));
    }

    #[test]
    fn blocked_task_is_dispatchable_only_once_blocker_is_done() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("T-1", "T-2");

        let statuses: HashMap<&str, &str> = [("T-1", "running")].into_iter().collect();
        assert!(!graph.is_dispatchable("T-2", |id| statuses.get(id).copied()));

        let statuses: HashMap<&str, &str> = [("T-1", "done")].into_iter().collect();
        assert!(graph.is_dispatchable("T-2", |id| statuses.get(id).copied()));
    }

    #[test]
    fn remove_relation_unblocks() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("T-1", "T-2");
        graph.remove_relation("T-1", "T-2");
        assert!(graph.is_dispatchable("T-2", |_| None));
    }

    #[test]
    fn rebuild_replaces_prior_state() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("T-1", "T-2");
        graph.rebuild(&[Relation {
            blocker: "T-3".to_string(),
            blocked: "T-4".to_string(),
        }]);
        assert!(graph.is_dispatchable("T-2", |_| None));
        assert!(!graph.is_dispatchable("T-4", |_| Some("running")));
    }

    #[test]
    fn effective_priority_propagates_through_blocking_chain() {
        let mut graph = DependencyGraph::new();
        // B (priority 0) blocks A (priority 4).
        graph.add_relation("B", "A");
        let priorities: HashMap<&str, i64> = [("A", 4), ("B", 0)].into_iter().collect();
        assert_eq!(graph.effective_priority("B", |id| priorities[id]), 4);
        assert_eq!(graph.effective_priority("A", |id| priorities[id]), 4);
    }

    #[test]
    fn effective_priority_preserves_zero_when_nothing_prioritized() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("B", "A");
        let priorities: HashMap<&str, i64> = [("A", 0), ("B", 0)].into_iter().collect();
        assert_eq!(graph.effective_priority("B", |id| priorities[id]), 0);
    }

    #[test]
    fn effective_priority_handles_cycles_without_looping() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "B");
        graph.add_relation("B", "A");
        let priorities: HashMap<&str, i64> = [("A", 2), ("B", 0)].into_iter().collect();
        // Must terminate and not double count; B's chain reaches A (priority 2).
        assert_eq!(graph.effective_priority("B", |id| priorities[id]), 2);
    }

    #[test]
    fn unprioritized_tasks_do_not_mask_blocked_priority() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("B", "A");
        graph.add_relation("C", "B");
        let priorities: HashMap<&str, i64> = [("A", 1), ("B", 0), ("C", 0)].into_iter().collect();
        assert_eq!(graph.effective_priority("C", |id| priorities[id]), 1);
    }
}
