//! `orca sync`: run one full tracker sync outside the poller's schedule.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::RwLock as AsyncRwLock;

use orca_core::config::OrcaConfig;
use orca_core::graph::DependencyGraph;
use orca_core::tracker::{self, TrackerClient};

pub async fn run(db: &SqlitePool, config: &OrcaConfig) -> anyhow::Result<()> {
    let client = TrackerClient::new(config.tracker_base_url.clone(), config.tracker_api_key.clone());
    let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));

    let report = tracker::full_sync(
        db,
        &client,
        &graph,
        &config.project_ids,
        &config.ready_state_type,
        &config.repo_path_overrides,
        config.default_cwd.as_deref(),
        Utc::now(),
    )
    .await?;

    println!("synced {} issues ({} succeeded, {} failed)", report.total, report.succeeded, report.failed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> OrcaConfig {
        OrcaConfig {
            tracker_api_key: "test-key".to_string(),
            tracker_base_url: base_url,
            webhook_secret: "secret".to_string(),
            project_ids: vec!["PROJ".to_string()],
            ready_state_type: "ready".to_string(),
            tunnel_hostname: "tunnel.example.com".to_string(),
            tunnel_token: None,
            tunnel_bin: "cloudflared".to_string(),
            agent_bin: "claude".to_string(),
            default_max_turns: 50,
            disallowed_tools: vec![],
            implement_prompt: None,
            review_prompt: "review".to_string(),
            fix_prompt: "fix".to_string(),
            max_review_cycles: 3,
            review_max_turns: 30,
            concurrency_cap: 3,
            session_timeout_min: 45,
            max_retries: 3,
            budget_window_hours: 4,
            budget_max_cost_usd: 1000.0,
            scheduler_interval_sec: 10,
            cleanup_interval_min: 10,
            cleanup_branch_max_age_min: 60,
            deploy_strategy: orca_core::config::DeployStrategy::None,
            deploy_poll_interval_sec: 30,
            deploy_timeout_min: 30,
            port: 3000,
            db_config: orca_db::config::DbConfig::new("orca-test.db"),
            default_cwd: Some("/tmp/repo".to_string()),
            repo_path_overrides: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn syncs_every_ready_issue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/issues"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issues": [
                    {
                        "id": "PROJ-1",
                        "title": "First",
                        "description": "repo: /tmp/repo",
                        "state_type": "ready",
                        "project_id": "PROJ",
                        "priority": 1,
                        "parent_id": null,
                        "blocked_by": [],
                    },
                    {
                        "id": "PROJ-2",
                        "title": "Second",
                        "description": "repo: /tmp/repo",
                        "state_type": "ready",
                        "project_id": "PROJ",
                        "priority": 2,
                        "parent_id": null,
                        "blocked_by": [],
                    },
                ]
            })))
            .mount(&server)
            .await;

        let (db, _dir) = orca_test_utils::create_test_db().await;
        let config = test_config(server.uri());

        run(&db, &config).await.unwrap();

        let progress = orca_db::queries::tasks::task_progress(&db).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.ready, 2);
    }
}
