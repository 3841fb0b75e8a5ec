//! Database query functions for the append-only `budget_events` ledger.
//!
//! Rows are written exclusively by [`super::invocations::close_invocation`]
//! inside the same transaction as the invocation close; this module exists
//! for read-side inspection (`orca status`, tests).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::BudgetEvent;

/// List budget events recorded at or after `since`, oldest first.
pub async fn list_since(pool: &SqlitePool, since: DateTime<Utc>) -> Result<Vec<BudgetEvent>> {
    let events = sqlx::query_as::<_, BudgetEvent>(
        "SELECT * FROM budget_events WHERE recorded_at >= ? ORDER BY recorded_at ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to list budget events")?;

    Ok(events)
}

/// Total number of budget events recorded, for diagnostics.
pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM budget_events")
        .fetch_one(pool)
        .await
        .context("failed to count budget events")?;

    Ok(row.0)
}
