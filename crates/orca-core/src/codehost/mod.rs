//! Code-Host Adapter: thin async wrapper over an external code-hosting CLI
//! (`gh` by convention).
//!
//! Every operation runs the configured binary, parses its JSON output, and
//! maps failures to [`CodeHostError`]. No operation retains state between
//! calls; retry loops (merge-commit propagation delay) live inside the
//! single call that needs them.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("failed to run {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed (exit {code}): {stderr}")]
    CommandFailed { command: String, code: i32, stderr: String },

    #[error("failed to parse {command} output: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of looking up the PR associated with a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct PrInfo {
    pub exists: bool,
    pub url: Option<String>,
    pub number: Option<i64>,
    pub merged: Option<bool>,
}

impl PrInfo {
    fn none() -> Self {
        Self {
            exists: false,
            url: None,
            number: None,
            merged: None,
        }
    }
}

/// Aggregated conclusion over the most recent CI runs on a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowRunStatus {
    Pending,
    InProgress,
    Success,
    Failure,
    NoRuns,
}

#[derive(Debug, Deserialize)]
struct PrListEntry {
    number: i64,
    url: String,
    state: String,
    #[serde(rename = "mergedAt")]
    merged_at: Option<String>,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
}

#[derive(Debug, Deserialize)]
struct PrMergeCommit {
    #[serde(rename = "mergeCommit")]
    merge_commit: Option<MergeCommitSha>,
}

#[derive(Debug, Deserialize)]
struct MergeCommitSha {
    oid: String,
}

#[derive(Debug, Deserialize)]
struct RunListEntry {
    status: String,
    conclusion: Option<String>,
}

const RUN_LIST_LIMIT: u32 = 20;
const MERGE_SHA_RETRIES: u32 = 3;
const MERGE_SHA_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Wraps the code-host CLI (`gh` by default).
pub struct CodeHostAdapter {
    bin: String,
}

impl CodeHostAdapter {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run_json(&self, args: &[&str], cwd: &Path) -> Result<serde_json::Value, CodeHostError> {
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|source| CodeHostError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CodeHostError::CommandFailed {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|source| CodeHostError::Parse {
            command: args.join(" "),
            source,
        })
    }

    async fn run(&self, args: &[&str], cwd: &Path) -> Result<(), CodeHostError> {
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|source| CodeHostError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CodeHostError::CommandFailed {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(())
    }

    /// Find the PR (open or closed) whose head branch is `branch`.
    pub async fn find_pr_for_branch(&self, branch: &str, cwd: &Path) -> Result<PrInfo, CodeHostError> {
        let value = self
            .run_json(
                &[
                    "pr",
                    "list",
                    "--head",
                    branch,
                    "--state",
                    "all",
                    "--json",
                    "number,url,state,mergedAt,headRefName",
                ],
                cwd,
            )
            .await?;

        let entries: Vec<PrListEntry> = serde_json::from_value(value).map_err(|source| CodeHostError::Parse {
            command: "pr list".to_string(),
            source,
        })?;

        match entries.into_iter().find(|e| e.head_ref_name == branch) {
            Some(entry) => Ok(PrInfo {
                exists: true,
                url: Some(entry.url),
                number: Some(entry.number),
                merged: Some(entry.merged_at.is_some() || entry.state.eq_ignore_ascii_case("merged")),
            }),
            None => Ok(PrInfo::none()),
        }
    }

    /// Retrieve the merge commit SHA for `pr_number`, retrying up to
    /// [`MERGE_SHA_RETRIES`] times with a fixed delay to absorb the
    /// code-host's post-merge propagation lag. Returns `None` if still
    /// unmerged after the final attempt.
    pub async fn get_merge_commit_sha(&self, pr_number: i64, cwd: &Path) -> Result<Option<String>, CodeHostError> {
        let pr_arg = pr_number.to_string();
        let mut last_err = None;

        for attempt in 0..MERGE_SHA_RETRIES {
            match self
                .run_json(&["pr", "view", &pr_arg, "--json", "mergeCommit"], cwd)
                .await
            {
                Ok(value) => {
                    let parsed: PrMergeCommit = serde_json::from_value(value).map_err(|source| CodeHostError::Parse {
                        command: "pr view".to_string(),
                        source,
                    })?;
                    if let Some(sha) = parsed.merge_commit {
                        return Ok(Some(sha.oid));
                    }
                }
                Err(e) => last_err = Some(e),
            }

            if attempt + 1 < MERGE_SHA_RETRIES {
                tokio::time::sleep(MERGE_SHA_RETRY_DELAY).await;
            }
        }

        if let Some(e) = last_err {
            tracing::warn!(pr_number, error = %e, "get_merge_commit_sha exhausted retries with errors, treating as unmerged");
        }
        Ok(None)
    }

    /// Aggregate status over the most recent [`RUN_LIST_LIMIT`] workflow
    /// runs on `sha`. Any queued/in-progress run wins over a failure; a
    /// failure wins over success; no rows is reported distinctly.
    pub async fn get_workflow_run_status(&self, sha: &str, cwd: &Path) -> Result<WorkflowRunStatus, CodeHostError> {
        let limit = RUN_LIST_LIMIT.to_string();
        let value = self
            .run_json(
                &["run", "list", "--commit", sha, "--limit", &limit, "--json", "status,conclusion"],
                cwd,
            )
            .await?;

        let entries: Vec<RunListEntry> = serde_json::from_value(value).map_err(|source| CodeHostError::Parse {
            command: "run list".to_string(),
            source,
        })?;

        if entries.is_empty() {
            return Ok(WorkflowRunStatus::NoRuns);
        }

        let in_progress = entries
            .iter()
            .any(|e| matches!(e.status.as_str(), "queued" | "waiting" | "in_progress" | "requested" | "pending"));
        if in_progress {
            return Ok(WorkflowRunStatus::InProgress);
        }

        let failed = entries.iter().any(|e| {
            matches!(
                e.conclusion.as_deref(),
                Some("failure") | Some("cancelled") | Some("timed_out")
            )
        });
        if failed {
            return Ok(WorkflowRunStatus::Failure);
        }

        Ok(WorkflowRunStatus::Success)
    }

    /// Close every open PR whose head branch starts with `orca/<task_id>-`
    /// (prefix-safe: the dash after `task_id` prevents `EMI-1` from matching
    /// `EMI-10`), excluding `current_pr`. Each candidate is commented on
    /// before it is closed; individual failures are logged and skipped so
    /// one bad PR never blocks the rest.
    pub async fn close_superseded_prs(&self, task_id: &str, current_pr: i64, cwd: &Path) -> Result<(), CodeHostError> {
        let value = self
            .run_json(&["pr", "list", "--state", "open", "--json", "number,headRefName"], cwd)
            .await?;

        let entries: Vec<PrListEntry> = serde_json::from_value(value).map_err(|source| CodeHostError::Parse {
            command: "pr list".to_string(),
            source,
        })?;

        let prefix = format!("orca/{task_id}-");
        for entry in entries {
            if entry.number == current_pr || !entry.head_ref_name.starts_with(&prefix) {
                continue;
            }

            let pr_arg = entry.number.to_string();
            let comment = format!("Superseded by #{current_pr}");
            if let Err(e) = self.run(&["pr", "comment", &pr_arg, "--body", &comment], cwd).await {
                tracing::warn!(pr_number = entry.number, error = %e, "failed to comment on superseded PR, skipping close");
                continue;
            }

            if let Err(e) = self.run(&["pr", "close", &pr_arg, "--delete-branch"], cwd).await {
                tracing::warn!(pr_number = entry.number, error = %e, "failed to close superseded PR");
            }
        }

        Ok(())
    }
}

/// Pure branch-prefix matching logic used by [`CodeHostAdapter::close_superseded_prs`],
/// extracted for direct unit testing of the `EMI-1` vs `EMI-10` prefix-safety property.
pub fn branch_belongs_to_task(branch: &str, task_id: &str) -> bool {
    branch.starts_with(&format!("orca/{task_id}-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_avoids_collisions() {
        assert!(branch_belongs_to_task("orca/EMI-1-inv-1", "EMI-1"));
        assert!(branch_belongs_to_task("orca/EMI-1-inv-2", "EMI-1"));
        assert!(!branch_belongs_to_task("orca/EMI-10-inv-1", "EMI-1"));
        assert!(!branch_belongs_to_task("orca/EMI-100-inv-1", "EMI-1"));
    }

    #[test]
    fn pr_info_none_has_no_fields_set() {
        let info = PrInfo::none();
        assert!(!info.exists);
        assert!(info.url.is_none());
        assert!(info.number.is_none());
        assert!(info.merged.is_none());
    }

    #[test]
    fn workflow_run_status_variants_are_distinct() {
        assert_ne!(WorkflowRunStatus::Success, WorkflowRunStatus::Failure);
        assert_ne!(WorkflowRunStatus::InProgress, WorkflowRunStatus::NoRuns);
    }
}
