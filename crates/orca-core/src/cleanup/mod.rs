//! Cleanup Loop: periodic GC of abandoned working trees and stale branches
//! (§4.K).
//!
//! Runs on its own timer, independent of the scheduler. Never deletes
//! anything belonging to a task that has not reached a terminal status --
//! `done` or `failed` is read as a proxy for "the PR is merged or closed",
//! since by the time a task lands there the code-host interaction that
//! produced that status has already happened.

use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use orca_db::models::TaskStatus;
use orca_db::queries::{invocations, tasks};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::worktree::{WorktreeManager, WorktreeError};

const ORCA_BRANCH_PREFIX: &str = "orca/";

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),

    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub worktrees_removed: u32,
    pub branches_removed: u32,
}

pub struct CleanupLoop {
    db: SqlitePool,
    worktree: WorktreeManager,
    branch_max_age: StdDuration,
}

impl CleanupLoop {
    pub fn new(db: SqlitePool, worktree: WorktreeManager, branch_max_age: StdDuration) -> Self {
        Self {
            db,
            worktree,
            branch_max_age,
        }
    }

    /// Run one cleanup pass. Individual failures (a task row disappearing,
    /// one bad git command) are logged and skipped so a single stale entry
    /// never blocks the rest of the sweep.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport, CleanupError> {
        let cutoff = now
            - chrono::Duration::from_std(self.branch_max_age).unwrap_or_else(|_| chrono::Duration::minutes(60));

        let mut report = CleanupReport::default();
        let candidates = invocations::list_ended_with_worktree_before(&self.db, cutoff).await?;

        for invocation in candidates {
            let Some(worktree_path) = invocation.worktree_path.as_deref() else {
                continue;
            };

            match tasks::get_task(&self.db, &invocation.task_id).await {
                Ok(Some(task)) if task_is_resolved(&task.orca_status) => {}
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task_id = %invocation.task_id, error = %e, "failed to look up task during cleanup, skipping");
                    continue;
                }
            }

            match self.worktree.remove_worktree(Path::new(worktree_path)) {
                Ok(()) => {
                    tracing::info!(invocation_id = invocation.id, path = worktree_path, "removed stale worktree");
                    report.worktrees_removed += 1;
                }
                Err(e) => {
                    tracing::warn!(invocation_id = invocation.id, path = worktree_path, error = %e, "failed to remove worktree during cleanup");
                }
            }
        }

        if let Err(e) = self.worktree.prune_stale() {
            tracing::warn!(error = %e, "failed to prune stale worktree references");
        }

        let branches = self.worktree.list_local_branches(ORCA_BRANCH_PREFIX).unwrap_or_default();
        for branch in branches {
            let Some(task_id) = task_id_from_branch(&branch) else {
                continue;
            };

            match tasks::get_task(&self.db, &task_id).await {
                Ok(Some(task)) if task_is_resolved(&task.orca_status) => {}
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to look up task for branch cleanup, skipping");
                    continue;
                }
            }

            match self.worktree.delete_branch(&branch) {
                Ok(()) => {
                    tracing::info!(branch = %branch, "removed stale branch");
                    report.branches_removed += 1;
                }
                Err(e) => {
                    tracing::warn!(branch = %branch, error = %e, "failed to delete branch during cleanup");
                }
            }
        }

        Ok(report)
    }
}

fn task_is_resolved(status: &TaskStatus) -> bool {
    matches!(status, TaskStatus::Done | TaskStatus::Failed)
}

/// `orca/<issue_id>-inv-<invocation_id>` -> `issue_id`. The issue id itself
/// may contain dashes, so this strips only the trailing `-inv-<digits>`.
fn task_id_from_branch(branch: &str) -> Option<String> {
    let rest = branch.strip_prefix(ORCA_BRANCH_PREFIX)?;
    let inv_pos = rest.rfind("-inv-")?;
    let (issue_id, suffix) = rest.split_at(inv_pos);
    let digits = &suffix["-inv-".len()..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(issue_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_task_id_from_simple_branch() {
        assert_eq!(task_id_from_branch("orca/EMI-6-inv-42"), Some("EMI-6".to_string()));
    }

    #[test]
    fn extracts_task_id_when_issue_id_contains_dashes() {
        assert_eq!(task_id_from_branch("orca/PROJ-ABC-123-inv-7"), Some("PROJ-ABC-123".to_string()));
    }

    #[test]
    fn rejects_branch_without_prefix() {
        assert_eq!(task_id_from_branch("feature/something"), None);
    }

    #[test]
    fn rejects_malformed_suffix() {
        assert_eq!(task_id_from_branch("orca/EMI-6-inv-"), None);
        assert_eq!(task_id_from_branch("orca/EMI-6-inv-abc"), None);
        assert_eq!(task_id_from_branch("orca/EMI-6"), None);
    }

    #[test]
    fn done_and_failed_are_resolved() {
        assert!(task_is_resolved(&TaskStatus::Done));
        assert!(task_is_resolved(&TaskStatus::Failed));
        assert!(!task_is_resolved(&TaskStatus::Running));
        assert!(!task_is_resolved(&TaskStatus::InReview));
    }
}
