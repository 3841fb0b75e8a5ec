//! Tracker Sync: keeps the local task store and dependency graph consistent
//! with the external issue tracker (§4.C).
//!
//! Two entry points share the same upsert/graph-patch logic: [`full_sync`]
//! (everything in the configured ready states, called by the poller and at
//! boot) and [`handle_webhook_event`] (one delta at a time, called by the
//! webhook receiver). Both are safe to replay: the upsert never regresses a
//! task past `ready`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock as AsyncRwLock;

use orca_db::models::TaskStatus;
use orca_db::queries::tasks::{self, NewTask};

use crate::graph::{DependencyGraph, Relation};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),

    #[error("issue {issue_id} has no resolvable repo_path")]
    UnresolvedRepoPath { issue_id: String },
}

/// Result of a full sync, reported to the caller (poller, `orca sync`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// One issue as reported by the tracker's list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub state_type: String,
    pub project_id: String,
    pub priority: i64,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListIssuesResponse {
    issues: Vec<TrackerIssue>,
}

/// A single webhook delta payload (§4.C, §4.J).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    IssueUpserted { issue: TrackerIssue },
    IssueDeleted { issue_id: String },
    RelationCreated { blocker: String, blocked: String },
    RelationDeleted { blocker: String, blocked: String },
}

static REPO_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?im)^repo:\s*(.+)$").unwrap());

/// Resolve `repo_path` for an issue per §4.C's fallback chain. Returns
/// `None` only when every option is exhausted.
pub fn resolve_repo_path(
    description: Option<&str>,
    project_id: &str,
    overrides: &HashMap<String, String>,
    default_cwd: Option<&str>,
) -> Option<String> {
    if let Some(description) = description {
        if let Some(caps) = REPO_LINE.captures(description) {
            return Some(caps[1].trim().to_string());
        }
    }
    if let Some(path) = overrides.get(project_id) {
        return Some(path.clone());
    }
    default_cwd.map(|s| s.to_string())
}

/// Derive the status to *propose* for a task given the tracker's reported
/// state. The upsert's own `CASE` expression is what actually guards a
/// task that has progressed past `ready` -- it only ever applies this value
/// when the stored row is still `backlog`, or demotes `ready` back to
/// `backlog`, so this function does not need to know the task's current
/// status itself.
pub fn derive_desired_status(state_type: &str, ready_state_type: &str) -> TaskStatus {
    if state_type == ready_state_type {
        TaskStatus::Ready
    } else {
        TaskStatus::Backlog
    }
}

/// Thin HTTP client over the tracker's REST API.
pub struct TrackerClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl TrackerClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn list_issues(&self, project_ids: &[String], ready_state_type: &str) -> Result<Vec<TrackerIssue>, TrackerError> {
        let response = self
            .client
            .get(format!("{}/issues", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("state_type", ready_state_type)])
            .query(&[("project_ids", project_ids.join(","))])
            .send()
            .await?
            .error_for_status()?;

        let parsed: ListIssuesResponse = response.json().await?;
        Ok(parsed.issues)
    }

    /// Fetch a single issue by id, for `orca add`.
    pub async fn get_issue(&self, issue_id: &str) -> Result<TrackerIssue, TrackerError> {
        let response = self
            .client
            .get(format!("{}/issues/{issue_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

/// Fetch one issue by id and upsert it as a task, adding any relation it
/// reports to the graph. Used by `orca add` to register a single issue
/// outside the periodic full sync.
pub async fn add_issue(
    db: &SqlitePool,
    client: &TrackerClient,
    graph: &Arc<AsyncRwLock<DependencyGraph>>,
    issue_id: &str,
    ready_state_type: &str,
    repo_overrides: &HashMap<String, String>,
    default_cwd: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), TrackerError> {
    let issue = client.get_issue(issue_id).await?;
    let relations = upsert_issue(db, &issue, ready_state_type, repo_overrides, default_cwd, now).await?;
    let mut graph = graph.write().await;
    for relation in &relations {
        graph.add_relation(&relation.blocker, &relation.blocked);
    }
    Ok(())
}

/// Upsert one issue's task row and return the relations it reported, for
/// the caller to fold into the dependency graph.
async fn upsert_issue(
    db: &SqlitePool,
    issue: &TrackerIssue,
    ready_state_type: &str,
    repo_overrides: &HashMap<String, String>,
    default_cwd: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<Relation>, TrackerError> {
    let repo_path = resolve_repo_path(issue.description.as_deref(), &issue.project_id, repo_overrides, default_cwd)
        .ok_or_else(|| TrackerError::UnresolvedRepoPath { issue_id: issue.id.clone() })?;

    let desired_status = derive_desired_status(&issue.state_type, ready_state_type);

    if !(0..=4).contains(&issue.priority) {
        tracing::warn!(issue_id = %issue.id, priority = issue.priority, "tracker priority out of range, clamping to 0-4");
    }
    let priority = issue.priority.clamp(0, 4);

    tasks::upsert_task(
        db,
        NewTask {
            issue_id: &issue.id,
            agent_prompt: &issue.title,
            repo_path: &repo_path,
            priority,
            project_name: Some(&issue.project_id),
            parent_issue_id: issue.parent_id.as_deref(),
            desired_status,
        },
        now,
    )
    .await?;

    Ok(issue
        .blocked_by
        .iter()
        .map(|blocker| Relation {
            blocker: blocker.clone(),
            blocked: issue.id.clone(),
        })
        .collect())
}

/// Fetch every issue in the configured ready states, upsert each as a task,
/// and rebuild the dependency graph from the relations they reported.
/// Individual issue failures (most commonly an unresolved `repo_path`) are
/// counted but do not abort the sweep.
pub async fn full_sync(
    db: &SqlitePool,
    client: &TrackerClient,
    graph: &Arc<AsyncRwLock<DependencyGraph>>,
    project_ids: &[String],
    ready_state_type: &str,
    repo_overrides: &HashMap<String, String>,
    default_cwd: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SyncReport, TrackerError> {
    let issues = client.list_issues(project_ids, ready_state_type).await?;

    let mut report = SyncReport {
        total: issues.len() as u32,
        ..Default::default()
    };
    let mut relations = Vec::new();

    for issue in &issues {
        match upsert_issue(db, issue, ready_state_type, repo_overrides, default_cwd, now).await {
            Ok(issue_relations) => {
                report.succeeded += 1;
                relations.extend(issue_relations);
            }
            Err(e) => {
                tracing::warn!(issue_id = %issue.id, error = %e, "failed to sync issue, skipping");
                report.failed += 1;
            }
        }
    }

    graph.write().await.rebuild(&relations);
    Ok(report)
}

/// Handle one webhook-delivered delta. Idempotent and safe to replay.
pub async fn handle_webhook_event(
    db: &SqlitePool,
    graph: &Arc<AsyncRwLock<DependencyGraph>>,
    event: WebhookEvent,
    ready_state_type: &str,
    repo_overrides: &HashMap<String, String>,
    default_cwd: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), TrackerError> {
    match event {
        WebhookEvent::IssueUpserted { issue } => {
            let incoming_blockers: HashSet<String> = issue.blocked_by.iter().cloned().collect();
            upsert_issue(db, &issue, ready_state_type, repo_overrides, default_cwd, now).await?;

            let mut graph = graph.write().await;
            let stored_blockers = graph.blockers_of(&issue.id);
            for blocker in stored_blockers.difference(&incoming_blockers) {
                graph.remove_relation(blocker, &issue.id);
            }
            for blocker in &incoming_blockers {
                graph.add_relation(blocker, &issue.id);
            }
        }
        WebhookEvent::IssueDeleted { issue_id } => {
            tasks::mark_done_if_unstarted(db, &issue_id, now).await?;
        }
        WebhookEvent::RelationCreated { blocker, blocked } => {
            graph.write().await.add_relation(&blocker, &blocked);
        }
        WebhookEvent::RelationDeleted { blocker, blocked } => {
            graph.write().await.remove_relation(&blocker, &blocked);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_line_in_description_wins_over_overrides() {
        let overrides: HashMap<String, String> = [("PROJ".to_string(), "/override".to_string())].into_iter().collect();
        let resolved = resolve_repo_path(Some("Some text\nrepo: /from/description\nmore text"), "PROJ", &overrides, None);
        assert_eq!(resolved.as_deref(), Some("/from/description"));
    }

    #[test]
    fn repo_line_match_is_case_insensitive() {
        let overrides = HashMap::new();
        let resolved = resolve_repo_path(Some("REPO:   /caps/path  "), "PROJ", &overrides, None);
        assert_eq!(resolved.as_deref(), Some("/caps/path"));
    }

    #[test]
    fn falls_back_to_override_map() {
        let overrides: HashMap<String, String> = [("PROJ".to_string(), "/override".to_string())].into_iter().collect();
        let resolved = resolve_repo_path(None, "PROJ", &overrides, None);
        assert_eq!(resolved.as_deref(), Some("/override"));
    }

    #[test]
    fn falls_back_to_default_cwd() {
        let overrides = HashMap::new();
        let resolved = resolve_repo_path(None, "PROJ", &overrides, Some("/default"));
        assert_eq!(resolved.as_deref(), Some("/default"));
    }

    #[test]
    fn unresolved_when_nothing_matches() {
        let overrides = HashMap::new();
        assert_eq!(resolve_repo_path(None, "PROJ", &overrides, None), None);
    }

    #[test]
    fn derive_desired_status_non_ready_state_yields_backlog() {
        assert_eq!(derive_desired_status("triage", "ready"), TaskStatus::Backlog);
    }

    #[test]
    fn derive_desired_status_ready_state_yields_ready() {
        assert_eq!(derive_desired_status("ready", "ready"), TaskStatus::Ready);
    }

    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn full_sync_upserts_issues_and_rebuilds_graph() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/issues"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issues": [{
                    "id": "PROJ-1",
                    "title": "Fix the thing",
                    "description": "repo: /tmp/repo",
                    "state_type": "ready",
                    "project_id": "PROJ",
                    "priority": 5,
                    "parent_id": null,
                    "blocked_by": ["PROJ-0"],
                }]
            })))
            .mount(&server)
            .await;

        let (db, _dir) = orca_test_utils::create_test_db().await;
        let client = TrackerClient::new(server.uri(), "test-key");
        let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));

        let report =
            full_sync(&db, &client, &graph, &["PROJ".to_string()], "ready", &HashMap::new(), None, Utc::now())
                .await
                .unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);

        let task = tasks::get_task(&db, "PROJ-1").await.unwrap().unwrap();
        assert_eq!(task.orca_status, TaskStatus::Ready);
        assert_eq!(task.repo_path, "/tmp/repo");
        assert_eq!(task.priority, 4, "out-of-range tracker priority should clamp to the task store's max");

        assert!(!graph.read().await.is_dispatchable("PROJ-1", |_| None));
    }

    #[tokio::test]
    async fn full_sync_counts_unresolved_repo_path_as_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/issues"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issues": [{
                    "id": "PROJ-2",
                    "title": "No repo info",
                    "description": null,
                    "state_type": "ready",
                    "project_id": "PROJ",
                    "priority": 0,
                    "parent_id": null,
                    "blocked_by": [],
                }]
            })))
            .mount(&server)
            .await;

        let (db, _dir) = orca_test_utils::create_test_db().await;
        let client = TrackerClient::new(server.uri(), "test-key");
        let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));

        let report =
            full_sync(&db, &client, &graph, &["PROJ".to_string()], "ready", &HashMap::new(), None, Utc::now())
                .await
                .unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 1);
        assert!(tasks::get_task(&db, "PROJ-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_issue_fetches_single_issue_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/issues/PROJ-3$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "PROJ-3",
                "title": "Single fetch",
                "description": "repo: /tmp/other",
                "state_type": "ready",
                "project_id": "PROJ",
                "priority": 1,
                "parent_id": null,
                "blocked_by": [],
            })))
            .mount(&server)
            .await;

        let client = TrackerClient::new(server.uri(), "test-key");
        let issue = client.get_issue("PROJ-3").await.unwrap();
        assert_eq!(issue.id, "PROJ-3");
        assert_eq!(issue.title, "Single fetch");
    }

    #[tokio::test]
    async fn add_issue_upserts_task_and_adds_relation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/issues/PROJ-4$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "PROJ-4",
                "title": "Needs a blocker",
                "description": "repo: /tmp/repo",
                "state_type": "ready",
                "project_id": "PROJ",
                "priority": 0,
                "parent_id": null,
                "blocked_by": ["PROJ-3"],
            })))
            .mount(&server)
            .await;

        let (db, _dir) = orca_test_utils::create_test_db().await;
        let client = TrackerClient::new(server.uri(), "test-key");
        let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));

        add_issue(&db, &client, &graph, "PROJ-4", "ready", &HashMap::new(), None, Utc::now()).await.unwrap();

        let task = tasks::get_task(&db, "PROJ-4").await.unwrap().unwrap();
        assert_eq!(task.orca_status, TaskStatus::Ready);
        assert!(!graph.read().await.is_dispatchable("PROJ-4", |_| None));
    }

    #[tokio::test]
    async fn issue_upserted_prunes_blockers_the_update_dropped() {
        let (db, _dir) = orca_test_utils::create_test_db().await;
        let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));
        graph.write().await.add_relation("PROJ-OLD", "PROJ-5");

        let issue = TrackerIssue {
            id: "PROJ-5".to_string(),
            title: "Blocker swapped".to_string(),
            description: Some("repo: /tmp/repo".to_string()),
            state_type: "ready".to_string(),
            project_id: "PROJ".to_string(),
            priority: 0,
            parent_id: None,
            blocked_by: vec!["PROJ-NEW".to_string()],
        };

        handle_webhook_event(
            &db,
            &graph,
            WebhookEvent::IssueUpserted { issue },
            "ready",
            &HashMap::new(),
            None,
            Utc::now(),
        )
        .await
        .unwrap();

        let graph = graph.read().await;
        let blockers = graph.blockers_of("PROJ-5");
        assert!(blockers.contains("PROJ-NEW"));
        assert!(!blockers.contains("PROJ-OLD"), "stale blocker should have been pruned by the diff");
    }
}
