//! Reconciler: reconciles crashed prior state into a consistent set at boot
//! (§4.L).
//!
//! Agent runs are direct subprocess children of the supervisor, so a
//! `running` invocation row left over from a previous process can never
//! have a live child backing it once the supervisor itself has restarted --
//! the whole process tree died with the parent. Every row [`list_running`]
//! returns at boot is therefore closed unconditionally.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock as AsyncRwLock;

use orca_db::queries::{invocations, tasks};

use crate::graph::DependencyGraph;
use crate::tracker::{self, TrackerClient, TrackerError};

const ORPHAN_SUMMARY: &str = "supervisor restart";

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),

    #[error("tracker sync failed during reconciliation: {0}")]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileReport {
    pub invocations_closed: u32,
    pub tasks_reset: u32,
}

/// Close every orphaned `running` invocation, revert its task to `ready`
/// (or `failed` if retries are exhausted), then rebuild the dependency
/// graph from a fresh tracker sync.
pub async fn reconcile(
    db: &SqlitePool,
    client: &TrackerClient,
    graph: &Arc<AsyncRwLock<DependencyGraph>>,
    project_ids: &[String],
    ready_state_type: &str,
    repo_overrides: &HashMap<String, String>,
    default_cwd: Option<&str>,
    max_retries: i64,
    now: DateTime<Utc>,
) -> Result<ReconcileReport, ReconcilerError> {
    let running = invocations::list_running(db).await?;
    for invocation in &running {
        invocations::force_close_as_failed(db, invocation.id, ORPHAN_SUMMARY, now).await?;
    }

    let reset = tasks::reset_orphaned(db, max_retries, now).await?;

    tracing::info!(
        invocations_closed = running.len(),
        tasks_reset = reset.len(),
        "reconciled orphaned state from prior run"
    );

    tracker::full_sync(db, client, graph, project_ids, ready_state_type, repo_overrides, default_cwd, now).await?;

    Ok(ReconcileReport {
        invocations_closed: running.len() as u32,
        tasks_reset: reset.len() as u32,
    })
}
