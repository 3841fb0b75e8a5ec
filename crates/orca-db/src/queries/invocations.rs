//! Database query functions for the `invocations` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Invocation, InvocationStatus, Phase};

/// Open a new invocation row: status `running`, `started_at = now`.
///
/// The unique partial index `idx_invocations_one_running_per_task` rejects a
/// second concurrently-open invocation for the same task at the database
/// level, backing up the in-process concurrency gate.
pub async fn open_invocation(
    pool: &SqlitePool,
    task_id: &str,
    phase: Phase,
    branch_name: Option<&str>,
    worktree_path: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Invocation> {
    let invocation = sqlx::query_as::<_, Invocation>(
        "INSERT INTO invocations (task_id, started_at, status, branch_name, worktree_path, phase) \
         VALUES (?, ?, 'running', ?, ?, ?) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(now)
    .bind(branch_name)
    .bind(worktree_path)
    .bind(phase)
    .fetch_one(pool)
    .await
    .context("failed to open invocation")?;

    Ok(invocation)
}

/// Record the session id reported by the agent's `init` frame.
pub async fn set_session_id(pool: &SqlitePool, invocation_id: i64, session_id: &str) -> Result<()> {
    sqlx::query("UPDATE invocations SET session_id = ? WHERE id = ?")
        .bind(session_id)
        .bind(invocation_id)
        .execute(pool)
        .await
        .context("failed to set invocation session id")?;

    Ok(())
}

/// Outcome of a closed invocation, as resolved by the run pool's monitor.
pub struct CloseOutcome<'a> {
    pub status: InvocationStatus,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub output_summary: Option<&'a str>,
    pub log_path: Option<&'a str>,
}

/// Close an invocation and, if it reported a cost, append a budget event in
/// the same transaction.
pub async fn close_invocation(
    pool: &SqlitePool,
    invocation_id: i64,
    outcome: CloseOutcome<'_>,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to start close transaction")?;

    sqlx::query(
        "UPDATE invocations \
         SET ended_at = ?, status = ?, cost_usd = ?, num_turns = ?, output_summary = ?, log_path = ? \
         WHERE id = ?",
    )
    .bind(now)
    .bind(outcome.status)
    .bind(outcome.cost_usd)
    .bind(outcome.num_turns)
    .bind(outcome.output_summary)
    .bind(outcome.log_path)
    .bind(invocation_id)
    .execute(&mut *tx)
    .await
    .context("failed to close invocation")?;

    if let Some(cost_usd) = outcome.cost_usd {
        sqlx::query("INSERT INTO budget_events (invocation_id, cost_usd, recorded_at) VALUES (?, ?, ?)")
            .bind(invocation_id)
            .bind(cost_usd)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to append budget event")?;
    }

    tx.commit().await.context("failed to commit close transaction")?;
    Ok(())
}

/// Fetch a single invocation by id.
pub async fn get_invocation(pool: &SqlitePool, id: i64) -> Result<Option<Invocation>> {
    let invocation = sqlx::query_as::<_, Invocation>("SELECT * FROM invocations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch invocation")?;

    Ok(invocation)
}

/// The currently-running invocation for a task, if any. At most one exists
/// by construction (`idx_invocations_one_running_per_task`).
pub async fn running_invocation_for_task(pool: &SqlitePool, task_id: &str) -> Result<Option<Invocation>> {
    let invocation = sqlx::query_as::<_, Invocation>(
        "SELECT * FROM invocations WHERE task_id = ? AND status = 'running'",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch running invocation for task")?;

    Ok(invocation)
}

/// All invocations still `running`, across all tasks. Used by the boot-time
/// reconciler to find runs that need closing.
pub async fn list_running(pool: &SqlitePool) -> Result<Vec<Invocation>> {
    let invocations = sqlx::query_as::<_, Invocation>("SELECT * FROM invocations WHERE status = 'running'")
        .fetch_all(pool)
        .await
        .context("failed to list running invocations")?;

    Ok(invocations)
}

/// List invocations for a task, most recent first.
pub async fn list_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<Invocation>> {
    let invocations = sqlx::query_as::<_, Invocation>(
        "SELECT * FROM invocations WHERE task_id = ? ORDER BY started_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list invocations for task")?;

    Ok(invocations)
}

/// Invocations that ended before `cutoff` and still have a worktree path
/// recorded, i.e. candidates for the cleanup loop's working-tree GC.
pub async fn list_ended_with_worktree_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Invocation>> {
    let invocations = sqlx::query_as::<_, Invocation>(
        "SELECT * FROM invocations \
         WHERE ended_at IS NOT NULL AND ended_at < ? AND worktree_path IS NOT NULL",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list ended invocations with a worktree path")?;

    Ok(invocations)
}

/// Force-close an invocation as `failed` with a fixed summary, used by the
/// reconciler when no live child backs a `running` row after restart.
pub async fn force_close_as_failed(
    pool: &SqlitePool,
    invocation_id: i64,
    output_summary: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    close_invocation(
        pool,
        invocation_id,
        CloseOutcome {
            status: InvocationStatus::Failed,
            cost_usd: None,
            num_turns: None,
            output_summary: Some(output_summary),
            log_path: None,
        },
        now,
    )
    .await
}
