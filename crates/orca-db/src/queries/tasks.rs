//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Task, TaskStatus};

/// Fields the tracker sync owns and writes on every upsert.
pub struct NewTask<'a> {
    pub issue_id: &'a str,
    pub agent_prompt: &'a str,
    pub repo_path: &'a str,
    pub priority: i64,
    pub project_name: Option<&'a str>,
    pub parent_issue_id: Option<&'a str>,
    /// Status the sync would like to set. Only applied when the existing row
    /// (if any) is still `backlog`, or is `ready` and this demotes it back
    /// to `backlog` -- any other current status is left untouched, so a
    /// tracker edit can never regress a task past `ready`.
    pub desired_status: TaskStatus,
}

/// Insert or update the tracker-owned fields of a task.
///
/// This is the sole write path for tracker-sourced data; it never touches
/// `retry_count`, PR handoff fields, or `review_cycle_count`, all of which
/// are owned by the scheduler.
pub async fn upsert_task(pool: &SqlitePool, new_task: NewTask<'_>, now: DateTime<Utc>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks ( \
             issue_id, agent_prompt, repo_path, priority, project_name, parent_issue_id, \
             orca_status, retry_count, review_cycle_count, created_at, updated_at \
         ) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?) \
         ON CONFLICT(issue_id) DO UPDATE SET \
             agent_prompt = excluded.agent_prompt, \
             repo_path = excluded.repo_path, \
             priority = excluded.priority, \
             project_name = excluded.project_name, \
             parent_issue_id = excluded.parent_issue_id, \
             orca_status = CASE \
                 WHEN tasks.orca_status = 'backlog' THEN excluded.orca_status \
                 WHEN tasks.orca_status = 'ready' AND excluded.orca_status = 'backlog' THEN excluded.orca_status \
                 ELSE tasks.orca_status \
             END, \
             updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(new_task.issue_id)
    .bind(new_task.agent_prompt)
    .bind(new_task.repo_path)
    .bind(new_task.priority)
    .bind(new_task.project_name)
    .bind(new_task.parent_issue_id)
    .bind(new_task.desired_status)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to upsert task")?;

    Ok(task)
}

/// Fetch a single task by issue id.
pub async fn get_task(pool: &SqlitePool, issue_id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE issue_id = ?")
        .bind(issue_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks, ordered by creation time. Used by `orca status`.
pub async fn list_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// Tasks with `orca_status = ready`, ordered by raw priority ascending then
/// `created_at` ascending.
///
/// This is the base ordering read on every scheduler tick (§4.A). The
/// scheduler re-sorts the returned slice by the dependency graph's
/// *effective* priority before dispatching, since that computation needs
/// the in-memory graph this store does not hold.
pub async fn ready_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE orca_status = 'ready' ORDER BY priority ASC, created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to fetch ready tasks")?;

    Ok(tasks)
}

/// Count of invocations currently `running`, across all tasks.
pub async fn active_session_count(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM invocations WHERE status = 'running'")
        .fetch_one(pool)
        .await
        .context("failed to count active sessions")?;

    Ok(row.0)
}

/// Sum of `cost_usd` over budget events recorded at or after `since`.
pub async fn sum_cost_since(pool: &SqlitePool, since: DateTime<Utc>) -> Result<f64> {
    let row: (Option<f64>,) =
        sqlx::query_as("SELECT SUM(cost_usd) FROM budget_events WHERE recorded_at >= ?")
            .bind(since)
            .fetch_one(pool)
            .await
            .context("failed to sum cost since window start")?;

    Ok(row.0.unwrap_or(0.0))
}

/// Atomically transition a task's status with optimistic locking: the row is
/// only updated if its current `orca_status` matches `from`. Returns the
/// number of rows affected (0 means the status did not match, i.e. someone
/// else already moved it).
pub async fn transition_status(
    pool: &SqlitePool,
    issue_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET orca_status = ?, updated_at = ? WHERE issue_id = ? AND orca_status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(issue_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Bump `retry_count` and move a task back to `ready` (or leave it on
/// `failed` if the caller determines retries are exhausted -- that decision
/// is made by the scheduler, not here).
pub async fn retry_to_ready(pool: &SqlitePool, issue_id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET orca_status = 'ready', retry_count = retry_count + 1, updated_at = ? \
         WHERE issue_id = ?",
    )
    .bind(now)
    .bind(issue_id)
    .execute(pool)
    .await
    .context("failed to retry task to ready")?;

    Ok(result.rows_affected())
}

/// Mark a task `failed`.
pub async fn mark_failed(pool: &SqlitePool, issue_id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET orca_status = 'failed', updated_at = ? WHERE issue_id = ?")
        .bind(now)
        .bind(issue_id)
        .execute(pool)
        .await
        .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Mark a task `done`, stamping `done_at`.
pub async fn mark_done(pool: &SqlitePool, issue_id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET orca_status = 'done', done_at = ?, updated_at = ? WHERE issue_id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(issue_id)
    .execute(pool)
    .await
    .context("failed to mark task done")?;

    Ok(result.rows_affected())
}

/// Record the PR handoff after a successful implement phase and move the
/// task to `in_review`.
pub async fn record_pr_and_review(
    pool: &SqlitePool,
    issue_id: &str,
    pr_number: i64,
    pr_branch_name: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET orca_status = 'in_review', pr_number = ?, pr_branch_name = ?, updated_at = ? \
         WHERE issue_id = ?",
    )
    .bind(pr_number)
    .bind(pr_branch_name)
    .bind(now)
    .bind(issue_id)
    .execute(pool)
    .await
    .context("failed to record PR and move task to review")?;

    Ok(result.rows_affected())
}

/// Record the merge commit SHA captured after review approval and move the
/// task to `deploying`.
pub async fn record_merge_and_deploy(
    pool: &SqlitePool,
    issue_id: &str,
    merge_commit_sha: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET orca_status = 'deploying', merge_commit_sha = ?, deploy_started_at = ?, updated_at = ? \
         WHERE issue_id = ?",
    )
    .bind(merge_commit_sha)
    .bind(now)
    .bind(now)
    .bind(issue_id)
    .execute(pool)
    .await
    .context("failed to record merge commit and move task to deploy")?;

    Ok(result.rows_affected())
}

/// Move a task from `in_review` or `changes_requested` to the fix or review
/// phase tracking state and bump `review_cycle_count`.
pub async fn bump_review_cycle(
    pool: &SqlitePool,
    issue_id: &str,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<(u64, i64)> {
    let result = sqlx::query(
        "UPDATE tasks SET orca_status = ?, review_cycle_count = review_cycle_count + 1, updated_at = ? \
         WHERE issue_id = ?",
    )
    .bind(to)
    .bind(now)
    .bind(issue_id)
    .execute(pool)
    .await
    .context("failed to bump review cycle")?;

    let count: (i64,) = sqlx::query_as("SELECT review_cycle_count FROM tasks WHERE issue_id = ?")
        .bind(issue_id)
        .fetch_one(pool)
        .await
        .context("failed to read review cycle count")?;

    Ok((result.rows_affected(), count.0))
}

/// Move a task into `changes_requested` (review found issues) without
/// bumping the review cycle counter -- that happens when the *fix* run
/// closes, not when the review assigns the fix.
pub async fn set_status(
    pool: &SqlitePool,
    issue_id: &str,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET orca_status = ?, updated_at = ? WHERE issue_id = ?")
        .bind(to)
        .bind(now)
        .bind(issue_id)
        .execute(pool)
        .await
        .context("failed to set task status")?;

    Ok(result.rows_affected())
}

/// Mark an unstarted task `done` on issue deletion. A task that has started
/// (anything past `backlog`/`ready`) is left untouched so active work is
/// never aborted by a tracker delete event.
pub async fn mark_done_if_unstarted(pool: &SqlitePool, issue_id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET orca_status = 'done', done_at = ?, updated_at = ? \
         WHERE issue_id = ? AND orca_status IN ('backlog', 'ready')",
    )
    .bind(now)
    .bind(now)
    .bind(issue_id)
    .execute(pool)
    .await
    .context("failed to mark unstarted task done")?;

    Ok(result.rows_affected())
}

/// Reset tasks stuck in `dispatched` or `running` back to `ready` (or
/// `failed` when retries are exhausted), used by the boot-time reconciler
/// when no live child process backs the invocation.
pub async fn reset_orphaned(pool: &SqlitePool, max_retries: i64, now: DateTime<Utc>) -> Result<Vec<Task>> {
    let retried = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET orca_status = 'ready', retry_count = retry_count + 1, updated_at = ? \
         WHERE orca_status IN ('dispatched', 'running') AND retry_count < ? \
         RETURNING *",
    )
    .bind(now)
    .bind(max_retries)
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned tasks to ready")?;

    let failed = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET orca_status = 'failed', updated_at = ? \
         WHERE orca_status IN ('dispatched', 'running') AND retry_count >= ? \
         RETURNING *",
    )
    .bind(now)
    .bind(max_retries)
    .fetch_all(pool)
    .await
    .context("failed to fail exhausted orphaned tasks")?;

    Ok(retried.into_iter().chain(failed).collect())
}

/// Status counts across all tasks, for `orca status`.
#[derive(Debug, Clone, Default)]
pub struct TaskProgress {
    pub backlog: i64,
    pub ready: i64,
    pub dispatched: i64,
    pub running: i64,
    pub in_review: i64,
    pub changes_requested: i64,
    pub deploying: i64,
    pub awaiting_ci: i64,
    pub done: i64,
    pub failed: i64,
    pub total: i64,
}

/// Get a summary of task counts by status.
pub async fn task_progress(pool: &SqlitePool) -> Result<TaskProgress> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT orca_status, COUNT(*) as cnt FROM tasks GROUP BY orca_status")
            .fetch_all(pool)
            .await
            .context("failed to get task progress")?;

    let mut progress = TaskProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "backlog" => progress.backlog = *count,
            "ready" => progress.ready = *count,
            "dispatched" => progress.dispatched = *count,
            "running" => progress.running = *count,
            "in_review" => progress.in_review = *count,
            "changes_requested" => progress.changes_requested = *count,
            "deploying" => progress.deploying = *count,
            "awaiting_ci" => progress.awaiting_ci = *count,
            "done" => progress.done = *count,
            "failed" => progress.failed = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
