//! Run Pool: spawns and monitors one agent invocation end to end.
//!
//! Owns the single [`AgentRunner`] implementation and drives the full
//! open-invocation -> spawn -> stream -> close-invocation lifecycle for one
//! run. The scheduler calls [`RunPool::run`] once per dispatch/phase-progress
//! decision and spawns it as its own task so multiple runs proceed
//! concurrently, bounded by the caller's semaphore.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use orca_db::models::{InvocationStatus, Phase};
use orca_db::queries::invocations::{self, CloseOutcome};

use crate::agent::{AgentEvent, AgentFrame, AgentHandle, AgentRunner, AgentRunnerError, SpawnSpec};

#[derive(Debug, Error)]
pub enum RunPoolError {
    #[error("failed to open invocation row: {0}")]
    OpenInvocation(#[source] anyhow::Error),
    #[error("failed to spawn agent: {0}")]
    Spawn(#[from] AgentRunnerError),
    #[error("failed to close invocation row: {0}")]
    CloseInvocation(#[source] anyhow::Error),
}

/// Result of running one invocation to completion, returned to the
/// scheduler so it can decide the next task-status transition (§4.G.2).
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub invocation_id: i64,
    pub status: InvocationStatus,
    pub session_id: Option<String>,
    pub result_subtype: Option<String>,
    pub result_text: Option<String>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
}

pub struct RunPool {
    agent: Arc<dyn AgentRunner>,
    logs_dir: PathBuf,
}

impl RunPool {
    pub fn new(agent: Arc<dyn AgentRunner>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            logs_dir: logs_dir.into(),
        }
    }

    /// Open an invocation row, spawn the agent, stream its frames to
    /// `logs/<invocation_id>.ndjson` until it completes or `session_timeout`
    /// elapses, then close the invocation and return the resolved outcome.
    pub async fn run(
        &self,
        pool: &SqlitePool,
        task_id: &str,
        phase: Phase,
        mut spec: SpawnSpec,
        branch_name: Option<&str>,
        worktree_path: Option<&str>,
        session_timeout: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, RunPoolError> {
        let invocation = invocations::open_invocation(pool, task_id, phase, branch_name, worktree_path, now)
            .await
            .map_err(RunPoolError::OpenInvocation)?;
        spec.invocation_id = invocation.id;

        let log_path = self.logs_dir.join(format!("{}.ndjson", invocation.id));
        if let Some(parent) = log_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let handle = match self.agent.spawn(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.close(
                    pool,
                    invocation.id,
                    InvocationStatus::Failed,
                    None,
                    None,
                    None,
                    None,
                    Some(&log_path),
                    now,
                )
                .await?;
                return Err(RunPoolError::Spawn(e));
            }
        };

        let (session_id, outcome_status, subtype, result_text, cost_usd, num_turns) =
            self.drive(&handle, &log_path, session_timeout).await;

        self.close(
            pool,
            invocation.id,
            outcome_status,
            session_id.as_deref(),
            cost_usd,
            num_turns,
            result_text.as_deref(),
            Some(&log_path),
            now,
        )
        .await?;

        Ok(RunOutcome {
            invocation_id: invocation.id,
            status: outcome_status,
            session_id,
            result_subtype: subtype,
            result_text,
            cost_usd,
            num_turns,
        })
    }

    /// Consume the agent's event stream, racing it against the session
    /// timeout. Returns the fields needed to close the invocation.
    #[allow(clippy::type_complexity)]
    async fn drive(
        &self,
        handle: &AgentHandle,
        log_path: &std::path::Path,
        session_timeout: StdDuration,
    ) -> (
        Option<String>,
        InvocationStatus,
        Option<String>,
        Option<String>,
        Option<f64>,
        Option<i64>,
    ) {
        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .ok();

        let events = self.agent.events(handle);
        tokio::pin!(events);
        let sleep = tokio::time::sleep(session_timeout);
        tokio::pin!(sleep);

        let mut session_id = None;
        let mut subtype = None;
        let mut result_text = None;
        let mut cost_usd = None;
        let mut num_turns = None;
        let mut timed_out = false;
        let mut saw_result_frame = false;

        loop {
            tokio::select! {
                _ = &mut sleep, if !timed_out => {
                    timed_out = true;
                    tracing::warn!(pid = handle.pid, invocation_id = handle.invocation_id, "session timeout elapsed, killing agent");
                    if let Err(e) = self.agent.kill(handle).await {
                        tracing::warn!(pid = handle.pid, error = %e, "failed to kill timed-out agent");
                    }
                }
                maybe_event = events.next() => {
                    match maybe_event {
                        Some(AgentEvent::Frame(frame)) => {
                            append_frame_line(&mut log_file, &frame).await;
                            match frame {
                                AgentFrame::Init { session_id: sid } => session_id = Some(sid),
                                AgentFrame::Result { subtype: st, total_cost_usd, num_turns: nt, result } => {
                                    saw_result_frame = true;
                                    subtype = Some(st);
                                    cost_usd = total_cost_usd;
                                    num_turns = nt;
                                    result_text = result;
                                }
                                AgentFrame::Intermediate(_) => {}
                            }
                        }
                        Some(AgentEvent::Completed) | None => break,
                    }
                }
            }
        }

        let status = if timed_out {
            InvocationStatus::TimedOut
        } else if saw_result_frame && subtype.as_deref() == Some("success") {
            InvocationStatus::Completed
        } else {
            if !saw_result_frame {
                tracing::warn!(invocation_id = handle.invocation_id, "agent exited without a result frame");
            }
            InvocationStatus::Failed
        };

        (session_id, status, subtype, result_text, cost_usd, num_turns)
    }

    #[allow(clippy::too_many_arguments)]
    async fn close(
        &self,
        pool: &SqlitePool,
        invocation_id: i64,
        status: InvocationStatus,
        session_id: Option<&str>,
        cost_usd: Option<f64>,
        num_turns: Option<i64>,
        output_summary: Option<&str>,
        log_path: Option<&std::path::Path>,
        now: DateTime<Utc>,
    ) -> Result<(), RunPoolError> {
        if let Some(session_id) = session_id {
            if let Err(e) = invocations::set_session_id(pool, invocation_id, session_id).await {
                tracing::warn!(invocation_id, error = %e, "failed to record session id (non-fatal)");
            }
        }

        let log_path_str = log_path.map(|p| p.to_string_lossy().into_owned());

        invocations::close_invocation(
            pool,
            invocation_id,
            CloseOutcome {
                status,
                cost_usd,
                num_turns,
                output_summary,
                log_path: log_path_str.as_deref(),
            },
            now,
        )
        .await
        .map_err(RunPoolError::CloseInvocation)
    }
}

async fn append_frame_line(log_file: &mut Option<tokio::fs::File>, frame: &AgentFrame) {
    let Some(file) = log_file.as_mut() else { return };

    let value = match frame {
        AgentFrame::Init { session_id } => {
            serde_json::json!({"type": "system", "subtype": "init", "session_id": session_id})
        }
        AgentFrame::Intermediate(v) => v.clone(),
        AgentFrame::Result {
            subtype,
            total_cost_usd,
            num_turns,
            result,
        } => {
            serde_json::json!({
                "type": "result",
                "subtype": subtype,
                "total_cost_usd": total_cost_usd,
                "num_turns": num_turns,
                "result": result,
            })
        }
    };

    let mut line = value.to_string();
    line.push('\n');
    if let Err(e) = file.write_all(line.as_bytes()).await {
        tracing::warn!(error = %e, "failed to append agent frame to log (non-fatal)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use futures::Stream;

    use orca_test_utils::create_test_db;

    /// A scripted [`AgentRunner`] that replays a fixed event sequence,
    /// optionally never completing (to exercise the timeout path).
    struct ScriptedRunner {
        frames: Vec<AgentEvent>,
        hang: bool,
        killed: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn spawn(&self, spec: &SpawnSpec) -> Result<AgentHandle, AgentRunnerError> {
            Ok(AgentHandle {
                pid: 1,
                invocation_id: spec.invocation_id,
            })
        }

        fn events(&self, _handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
            let frames = self.frames.clone();
            let hang = self.hang;
            Box::pin(async_stream::stream! {
                for frame in frames {
                    yield frame;
                }
                if hang {
                    futures::future::pending::<()>().await;
                } else {
                    yield AgentEvent::Completed;
                }
            })
        }

        async fn kill(&self, _handle: &AgentHandle) -> Result<(), AgentRunnerError> {
            *self.killed.lock().unwrap() = true;
            Ok(())
        }

        async fn is_running(&self, _handle: &AgentHandle) -> bool {
            !*self.killed.lock().unwrap()
        }
    }

    fn spec() -> SpawnSpec {
        SpawnSpec {
            agent_prompt: "do the thing".to_string(),
            worktree_path: PathBuf::from("/tmp/wt"),
            max_turns: 10,
            invocation_id: 0,
            agent_bin: "unused".to_string(),
            system_prompt: None,
            disallowed_tools: vec![],
        }
    }

    #[tokio::test]
    async fn successful_run_closes_completed_with_cost() {
        let (pool, _dir) = create_test_db().await;
        orca_db::queries::tasks::upsert_task(
            &pool,
            orca_db::queries::tasks::NewTask {
                issue_id: "T-1",
                agent_prompt: "fix it",
                repo_path: "/repo",
                priority: 2,
                project_name: None,
                parent_issue_id: None,
                desired_status: orca_db::models::TaskStatus::Ready,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner {
            frames: vec![
                AgentEvent::Frame(AgentFrame::Init {
                    session_id: "s1".to_string(),
                }),
                AgentEvent::Frame(AgentFrame::Result {
                    subtype: "success".to_string(),
                    total_cost_usd: Some(0.05),
                    num_turns: Some(3),
                    result: Some("done".to_string()),
                }),
            ],
            hang: false,
            killed: Arc::new(StdMutex::new(false)),
        };

        let pool_runner = RunPool::new(Arc::new(runner), tmp.path());
        let outcome = pool_runner
            .run(
                &pool,
                "T-1",
                Phase::Implement,
                spec(),
                Some("orca/T-1-inv-1"),
                Some("/tmp/wt"),
                StdDuration::from_secs(5),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(outcome.session_id.as_deref(), Some("s1"));
        assert_eq!(outcome.cost_usd, Some(0.05));

        let closed = invocations::get_invocation(&pool, outcome.invocation_id).await.unwrap().unwrap();
        assert!(closed.ended_at.is_some());
        assert_eq!(closed.cost_usd, Some(0.05));

        let log_contents = tokio::fs::read_to_string(tmp.path().join(format!("{}.ndjson", outcome.invocation_id)))
            .await
            .unwrap();
        assert_eq!(log_contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn missing_result_frame_closes_failed() {
        let (pool, _dir) = create_test_db().await;
        orca_db::queries::tasks::upsert_task(
            &pool,
            orca_db::queries::tasks::NewTask {
                issue_id: "T-2",
                agent_prompt: "fix it",
                repo_path: "/repo",
                priority: 2,
                project_name: None,
                parent_issue_id: None,
                desired_status: orca_db::models::TaskStatus::Ready,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner {
            frames: vec![AgentEvent::Frame(AgentFrame::Init {
                session_id: "s2".to_string(),
            })],
            hang: false,
            killed: Arc::new(StdMutex::new(false)),
        };

        let pool_runner = RunPool::new(Arc::new(runner), tmp.path());
        let outcome = pool_runner
            .run(&pool, "T-2", Phase::Implement, spec(), None, None, StdDuration::from_secs(5), Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.status, InvocationStatus::Failed);
    }

    #[tokio::test]
    async fn timeout_kills_agent_and_closes_timed_out() {
        let (pool, _dir) = create_test_db().await;
        orca_db::queries::tasks::upsert_task(
            &pool,
            orca_db::queries::tasks::NewTask {
                issue_id: "T-3",
                agent_prompt: "fix it",
                repo_path: "/repo",
                priority: 2,
                project_name: None,
                parent_issue_id: None,
                desired_status: orca_db::models::TaskStatus::Ready,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let killed = Arc::new(StdMutex::new(false));
        let runner = ScriptedRunner {
            frames: vec![],
            hang: true,
            killed: Arc::clone(&killed),
        };

        let pool_runner = RunPool::new(Arc::new(runner), tmp.path());
        let outcome = pool_runner
            .run(
                &pool,
                "T-3",
                Phase::Implement,
                spec(),
                None,
                None,
                StdDuration::from_millis(50),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, InvocationStatus::TimedOut);
        assert!(*killed.lock().unwrap());
    }

    #[tokio::test]
    async fn spawn_failure_closes_invocation_failed() {
        let (pool, _dir) = create_test_db().await;
        orca_db::queries::tasks::upsert_task(
            &pool,
            orca_db::queries::tasks::NewTask {
                issue_id: "T-4",
                agent_prompt: "fix it",
                repo_path: "/repo",
                priority: 2,
                project_name: None,
                parent_issue_id: None,
                desired_status: orca_db::models::TaskStatus::Ready,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let mut s = spec();
        s.agent_bin = "/nonexistent/path/to/claude".to_string();

        let pool_runner = RunPool::new(Arc::new(crate::agent::claude::ClaudeAgentRunner::new()), tmp.path());
        let result = pool_runner
            .run(&pool, "T-4", Phase::Implement, s, None, None, StdDuration::from_secs(5), Utc::now())
            .await;

        assert!(matches!(result, Err(RunPoolError::Spawn(_))));

        let invocations = invocations::list_for_task(&pool, "T-4").await.unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].status, InvocationStatus::Failed);
    }

}
