//! Git worktree management for agent isolation.
//!
//! Each invocation runs in its own git worktree on a dedicated branch,
//! giving the agent filesystem isolation without the cost of a full
//! repository clone. Worktrees share the main repository's object store.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages the worktrees Orca creates under `<repo>-orca-worktrees`.
///
/// Git serialises worktree/branch mutations against a lock file on the
/// shared object store; this manager holds its own mutex so that concurrent
/// scheduler dispatches do not race each other issuing git commands.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    pub fn new(repo_path: impl Into<PathBuf>, worktree_base: Option<PathBuf>) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path.file_name().and_then(|n| n.to_str()).unwrap_or("repo");
            let base_name = format!("{repo_name}-orca-worktrees");
            repo_path.parent().map(|p| p.join(&base_name)).unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// `orca/<issue_id>-inv-<invocation_id>`, per the configured branch format.
    pub fn branch_name(issue_id: &str, invocation_id: i64) -> String {
        format!("orca/{issue_id}-inv-{invocation_id}")
    }

    /// Create a worktree for `branch_name`, creating the branch from HEAD if
    /// it does not already exist. Idempotent: a worktree already registered
    /// at the expected path and branch is returned as-is.
    pub fn create_worktree(&self, branch_name: &str) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir_name = branch_name.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            if existing.branch.as_deref() == Some(branch_name) || existing.branch.is_none() {
                tracing::info!(path = %worktree_path.display(), branch = branch_name, "worktree already exists");
                return Ok(existing);
            }
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create worktree base directory: {}", self.worktree_base.display()),
                source: e,
            })?;
        }

        let branch_exists = self.branch_exists(branch_name)?;

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(branch_name)
                .current_dir(&self.repo_path)
                .output()
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(branch_name)
                .arg(&worktree_path)
                .current_dir(&self.repo_path)
                .output()
        }
        .map_err(|e| WorktreeError::GitCommand {
            message: "failed to run git worktree add".into(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(&worktree_path)
    }

    /// Idempotent: a no-op if `path` is not a registered worktree.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(path = %path.display(), "removing unregistered worktree directory");
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// `git worktree prune`, clearing references whose directories were
    /// removed out from under git (e.g. by an external cleanup).
    pub fn prune_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Delete a local branch. Idempotent: a missing branch is not an error.
    /// Force-deletes (`-D`) since branches are merged by the code host via
    /// PR, not locally.
    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// List local branch names matching `prefix`, used by the cleanup loop
    /// to find candidate `orca/*` branches independent of whether they
    /// still have a worktree checked out.
    pub fn list_local_branches(&self, prefix: &str) -> Result<Vec<String>, WorktreeError> {
        let output = Command::new("git")
            .args(["branch", "--list", &format!("{prefix}*")])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch --list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "branch --list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let branches = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim_start_matches('*').trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();

        Ok(branches)
    }

    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        worktrees
            .into_iter()
            .find(|wt| wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone()) == canonical)
            .ok_or_else(|| WorktreeError::ParseError(format!("worktree not found at path: {}", path.display())))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.prune_stale();
    }
}

fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let out = Command::new("git").args(args).current_dir(&repo_path).output().unwrap();
            assert!(out.status.success(), "git {} failed: {}", args.join(" "), String::from_utf8_lossy(&out.stderr));
        };

        run(&["init"]);
        run(&["config", "user.email", "orca@example.com"]);
        run(&["config", "user.name", "Orca Test"]);
        std::fs::write(repo_path.join("README.md"), "# repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial"]);

        (dir, repo_path)
    }

    #[test]
    fn rejects_non_git_directory() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), None);
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn branch_name_matches_configured_format() {
        assert_eq!(WorktreeManager::branch_name("EMI-6", 42), "orca/EMI-6-inv-42");
    }

    #[test]
    fn create_and_list_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("EMI-6", 1);
        let info = mgr.create_worktree(&branch).unwrap();

        assert!(info.path.exists());
        assert_eq!(info.branch.as_deref(), Some(branch.as_str()));

        let all = mgr.list_worktrees().unwrap();
        assert!(all.iter().any(|wt| wt.branch.as_deref() == Some(branch.as_str())));
    }

    #[test]
    fn create_worktree_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("EMI-6", 2);
        let first = mgr.create_worktree(&branch).unwrap();
        let second = mgr.create_worktree(&branch).unwrap();
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn remove_worktree_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("EMI-6", 3);
        let info = mgr.create_worktree(&branch).unwrap();
        mgr.remove_worktree(&info.path).unwrap();
        assert!(!info.path.exists());
        mgr.remove_worktree(&info.path).unwrap();
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path, None).unwrap();
        mgr.delete_branch("orca/nonexistent-inv-1").unwrap();
    }

    #[test]
    fn delete_branch_removes_existing_branch() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("EMI-6", 4);
        let info = mgr.create_worktree(&branch).unwrap();
        mgr.remove_worktree(&info.path).unwrap();

        assert!(mgr.branch_exists(&branch).unwrap());
        mgr.delete_branch(&branch).unwrap();
        assert!(!mgr.branch_exists(&branch).unwrap());
    }

    #[test]
    fn prune_stale_clears_manually_removed_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("EMI-6", 5);
        let info = mgr.create_worktree(&branch).unwrap();
        std::fs::remove_dir_all(&info.path).unwrap();

        mgr.prune_stale().unwrap();

        let all = mgr.list_worktrees().unwrap();
        assert!(!all.iter().any(|wt| wt.branch.as_deref() == Some(branch.as_str())));
    }

    #[test]
    fn list_local_branches_filters_by_prefix() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = WorktreeManager::branch_name("EMI-6", 9);
        mgr.create_worktree(&branch).unwrap();

        let matches = mgr.list_local_branches("orca/").unwrap();
        assert!(matches.contains(&branch));
        assert!(!matches.contains(&"main".to_string()));
    }

    #[test]
    fn parse_porcelain_output_handles_detached_and_missing_trailing_newline() {
        let input = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo/wt\nHEAD def456\ndetached";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(result[1].branch, None);
    }
}
