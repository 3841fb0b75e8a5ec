//! `orca start`: the long-running supervisor process.
//!
//! Runs the reconciler once at boot, then drives the scheduler tick, the
//! cleanup sweep, the fallback poller, and the webhook HTTP server
//! concurrently until `Ctrl+C`. Each loop owns its own timer; none of them
//! block each other, matching the independent-cadence design of the
//! components they wrap.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::RwLock as AsyncRwLock;
use tokio_util::sync::CancellationToken;

use orca_core::agent::claude::ClaudeAgentRunner;
use orca_core::codehost::CodeHostAdapter;
use orca_core::config::OrcaConfig;
use orca_core::event_bus::EventBus;
use orca_core::graph::DependencyGraph;
use orca_core::poller::{PollAction, Poller};
use orca_core::reconciler;
use orca_core::run_pool::RunPool;
use orca_core::scheduler::Scheduler;
use orca_core::tracker::TrackerClient;
use orca_core::tunnel::{TunnelConfig, TunnelSupervisor};
use orca_core::webhook::{self, WebhookState};
use orca_db::pool as db_pool;

const CODEHOST_BIN: &str = "gh";

struct SupervisorPollAction {
    db: SqlitePool,
    client: TrackerClient,
    graph: Arc<AsyncRwLock<DependencyGraph>>,
    tunnel: Arc<TunnelSupervisor>,
    config: OrcaConfig,
}

#[async_trait]
impl PollAction for SupervisorPollAction {
    async fn full_sync(&self) -> anyhow::Result<()> {
        orca_core::tracker::full_sync(
            &self.db,
            &self.client,
            &self.graph,
            &self.config.project_ids,
            &self.config.ready_state_type,
            &self.config.repo_path_overrides,
            self.config.default_cwd.as_deref(),
            Utc::now(),
        )
        .await?;
        Ok(())
    }

    fn tunnel_is_up(&self) -> bool {
        self.tunnel.is_tunnel_connected()
    }
}

fn default_repo_path(config: &OrcaConfig) -> anyhow::Result<String> {
    config
        .default_cwd
        .clone()
        .or_else(|| config.repo_path_overrides.values().next().cloned())
        .ok_or_else(|| anyhow::anyhow!("no default_cwd or repo_path_overrides configured, cleanup has no repo to scan"))
}

pub async fn run(db: SqlitePool, config: OrcaConfig) -> anyhow::Result<()> {
    let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));
    let client = TrackerClient::new(config.tracker_base_url.clone(), config.tracker_api_key.clone());

    let tunnel = Arc::new(TunnelSupervisor::new(TunnelConfig {
        bin: config.tunnel_bin.clone(),
        hostname: config.tunnel_hostname.clone(),
        token: config.tunnel_token.clone(),
        ..TunnelConfig::default()
    })?);
    tunnel.start().await?;

    reconciler::reconcile(
        &db,
        &client,
        &graph,
        &config.project_ids,
        &config.ready_state_type,
        &config.repo_path_overrides,
        config.default_cwd.as_deref(),
        config.max_retries,
        Utc::now(),
    )
    .await?;

    let agent = Arc::new(ClaudeAgentRunner::new());
    let logs_dir = config.db_config.db_path.parent().map(|p| p.join("logs")).unwrap_or_else(|| "logs".into());
    let run_pool = Arc::new(RunPool::new(agent, logs_dir));
    let codehost = Arc::new(CodeHostAdapter::new(CODEHOST_BIN));
    let event_bus = EventBus::new();
    let scheduler = Scheduler::new(db.clone(), graph.clone(), run_pool, codehost, config.clone(), event_bus);

    let repo_path = default_repo_path(&config)?;
    let worktree = orca_core::worktree::WorktreeManager::new(repo_path, None)?;
    let cleanup = orca_core::cleanup::CleanupLoop::new(
        db.clone(),
        worktree,
        StdDuration::from_secs(config.cleanup_branch_max_age_min * 60),
    );

    let poller = Arc::new(Poller::new(Arc::new(SupervisorPollAction {
        db: db.clone(),
        client,
        graph: graph.clone(),
        tunnel: tunnel.clone(),
        config: config.clone(),
    })));

    let webhook_state = WebhookState::new(db.clone(), graph.clone(), &config);
    let webhook_router = webhook::build_router(webhook_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "webhook receiver listening");

    let cancel = CancellationToken::new();

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        let interval = StdDuration::from_secs(config.scheduler_interval_sec);
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = scheduler.tick(Utc::now()).await {
                            tracing::warn!(error = %e, "scheduler tick failed");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }
    });

    let cleanup_task = tokio::spawn({
        let cancel = cancel.clone();
        let interval = StdDuration::from_secs(config.cleanup_interval_min * 60);
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cleanup.run_once(Utc::now()).await {
                            tracing::warn!(error = %e, "cleanup pass failed");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }
    });

    let poller_task = tokio::spawn({
        let poller = poller.clone();
        let cancel = cancel.clone();
        async move { poller.run(cancel).await }
    });

    let server_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            axum::serve(listener, webhook_router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping supervisor");
    cancel.cancel();

    let _ = scheduler_task.await;
    let _ = cleanup_task.await;
    let _ = poller_task.await;
    let _ = server_task.await;

    tunnel.stop().await?;
    db_pool::checkpoint_wal(&db).await?;
    db.close().await;

    Ok(())
}
