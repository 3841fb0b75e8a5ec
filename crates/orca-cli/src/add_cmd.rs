//! `orca add <issue_id>`: register a single tracker issue outside the
//! periodic full sync.
//!
//! Runs as a short-lived process separate from `orca start`, so the
//! dependency graph it builds here is thrown away on exit -- it only
//! exists to satisfy `tracker::add_issue`'s signature. The task row it
//! upserts is what persists; the running supervisor picks up any relation
//! this issue reports on its next full sync.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::RwLock as AsyncRwLock;

use orca_core::config::OrcaConfig;
use orca_core::graph::DependencyGraph;
use orca_core::tracker::{self, TrackerClient};

pub async fn run(db: &SqlitePool, config: &OrcaConfig, issue_id: &str) -> anyhow::Result<()> {
    let client = TrackerClient::new(config.tracker_base_url.clone(), config.tracker_api_key.clone());
    let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));

    tracker::add_issue(
        db,
        &client,
        &graph,
        issue_id,
        &config.ready_state_type,
        &config.repo_path_overrides,
        config.default_cwd.as_deref(),
        Utc::now(),
    )
    .await?;

    println!("added {issue_id}");
    Ok(())
}
