use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task's progress through the implement/review/fix/deploy
/// lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    Dispatched,
    Running,
    InReview,
    ChangesRequested,
    Deploying,
    AwaitingCi,
    Done,
    Failed,
}

impl TaskStatus {
    /// Whether this status is at or past `Ready` in the lifecycle, i.e. a
    /// run has already been dispatched for the task or one is imminent.
    ///
    /// `Backlog` is the only status strictly before `Ready`; tracker-driven
    /// upserts must never regress a task from here back to `Backlog`.
    pub fn is_past_ready(self) -> bool {
        !matches!(self, Self::Backlog)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::InReview => "in_review",
            Self::ChangesRequested => "changes_requested",
            Self::Deploying => "deploying",
            Self::AwaitingCi => "awaiting_ci",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "in_review" => Ok(Self::InReview),
            "changes_requested" => Ok(Self::ChangesRequested),
            "deploying" => Ok(Self::Deploying),
            "awaiting_ci" => Ok(Self::AwaitingCi),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

impl FromStr for InvocationStatus {
    type Err = InvocationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(InvocationStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvocationStatus`] string.
#[derive(Debug, Clone)]
pub struct InvocationStatusParseError(pub String);

impl fmt::Display for InvocationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invocation status: {:?}", self.0)
    }
}

impl std::error::Error for InvocationStatusParseError {}

// ---------------------------------------------------------------------------

/// Which leg of the implement/review/fix cycle an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Implement,
    Review,
    Fix,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Fix => "fix",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implement" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            "fix" => Ok(Self::Fix),
            other => Err(PhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Phase`] string.
#[derive(Debug, Clone)]
pub struct PhaseParseError(pub String);

impl fmt::Display for PhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase: {:?}", self.0)
    }
}

impl std::error::Error for PhaseParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the supervisor's shadow record of one tracked issue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub issue_id: String,
    pub agent_prompt: String,
    pub repo_path: String,
    pub priority: i64,
    pub retry_count: i64,
    pub orca_status: TaskStatus,
    pub project_name: Option<String>,
    pub parent_issue_id: Option<String>,
    pub pr_branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub merge_commit_sha: Option<String>,
    pub review_cycle_count: i64,
    pub deploy_started_at: Option<DateTime<Utc>>,
    pub ci_started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution of the coding agent against a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invocation {
    pub id: i64,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: InvocationStatus,
    pub session_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub output_summary: Option<String>,
    pub log_path: Option<String>,
    pub phase: Phase,
}

/// An append-only record of cost incurred by a completed invocation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BudgetEvent {
    pub id: i64,
    pub invocation_id: i64,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
