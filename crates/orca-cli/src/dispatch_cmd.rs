//! `orca dispatch <issue_id>`: force an immediate implement run for one
//! `ready` task, bypassing the scheduler's tick cadence.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::RwLock as AsyncRwLock;

use orca_core::agent::claude::ClaudeAgentRunner;
use orca_core::codehost::CodeHostAdapter;
use orca_core::config::OrcaConfig;
use orca_core::event_bus::EventBus;
use orca_core::graph::DependencyGraph;
use orca_core::run_pool::RunPool;
use orca_core::scheduler::Scheduler;

const CODEHOST_BIN: &str = "gh";

pub async fn run(db: &SqlitePool, config: &OrcaConfig, issue_id: &str) -> anyhow::Result<()> {
    let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));
    let agent = Arc::new(ClaudeAgentRunner::new());
    let logs_dir = config.db_config.db_path.parent().map(|p| p.join("logs")).unwrap_or_else(|| "logs".into());
    let run_pool = Arc::new(RunPool::new(agent, logs_dir));
    let codehost = Arc::new(CodeHostAdapter::new(CODEHOST_BIN));

    let scheduler = Scheduler::new(db.clone(), graph, run_pool, codehost, config.clone(), EventBus::new());
    scheduler.dispatch_and_wait(issue_id, Utc::now()).await?;

    println!("dispatched {issue_id}");
    Ok(())
}
