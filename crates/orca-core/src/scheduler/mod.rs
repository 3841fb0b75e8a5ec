//! Scheduler: the cooperative tick that drives tasks through
//! ready -> dispatched -> running -> in_review -> changes_requested ->
//! deploying -> done/failed.
//!
//! Each tick runs to completion before the next one starts (an
//! in-progress tick causes a concurrent firing to return immediately, the
//! same overlap guard used by the poller). Dispatching an agent run hands
//! the run off to a background task; the tick that eventually observes its
//! result drains a completion queue rather than awaiting the run inline, so
//! a single slow invocation never blocks the scheduler's other bookkeeping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};

use orca_db::models::{Phase, Task, TaskStatus};
use orca_db::queries::tasks;

use crate::agent::SpawnSpec;
use crate::codehost::{CodeHostAdapter, WorkflowRunStatus};
use crate::config::{DeployStrategy, OrcaConfig};
use crate::event_bus::{topics, Event, EventBus};
use crate::graph::DependencyGraph;
use crate::review::{self, ReviewDecision};
use crate::run_pool::RunPool;
use crate::worktree::WorktreeManager;
use orca_db::models::InvocationStatus;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),
}

struct ImplementCompletion {
    task: Task,
    branch_name: String,
}

struct ReviewCompletion {
    task: Task,
}

struct FixCompletion {
    task: Task,
}

enum RunCompletion {
    Implement(ImplementCompletion, crate::run_pool::RunOutcome),
    Review(ReviewCompletion, crate::run_pool::RunOutcome),
    Fix(FixCompletion, crate::run_pool::RunOutcome),
}

struct Inner {
    db: SqlitePool,
    graph: Arc<AsyncRwLock<DependencyGraph>>,
    run_pool: Arc<RunPool>,
    codehost: Arc<CodeHostAdapter>,
    config: OrcaConfig,
    worktree_managers: AsyncMutex<HashMap<String, WorktreeManager>>,
    event_bus: EventBus,
    completions_tx: mpsc::UnboundedSender<RunCompletion>,
    completions_rx: AsyncMutex<mpsc::UnboundedReceiver<RunCompletion>>,
    in_flight: AtomicI64,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    ticking: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        db: SqlitePool,
        graph: Arc<AsyncRwLock<DependencyGraph>>,
        run_pool: Arc<RunPool>,
        codehost: Arc<CodeHostAdapter>,
        config: OrcaConfig,
        event_bus: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                db,
                graph,
                run_pool,
                codehost,
                config,
                worktree_managers: AsyncMutex::new(HashMap::new()),
                event_bus,
                completions_tx: tx,
                completions_rx: AsyncMutex::new(rx),
                in_flight: AtomicI64::new(0),
            }),
            ticking: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run one tick. An already-in-progress tick makes this a no-op.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.ticking.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.do_tick(now).await;
        self.ticking.store(false, Ordering::SeqCst);
        result
    }

    async fn do_tick(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let since = now - chrono::Duration::hours(self.inner.config.budget_window_hours);
        let spent = tasks::sum_cost_since(&self.inner.db, since).await?;
        if spent >= self.inner.config.budget_max_cost_usd {
            tracing::debug!(spent, cap = self.inner.config.budget_max_cost_usd, "budget gate blocked tick");
            return Ok(());
        }

        let active = tasks::active_session_count(&self.inner.db).await? + self.inner.in_flight.load(Ordering::SeqCst);
        if active >= self.inner.config.concurrency_cap {
            tracing::debug!(active, cap = self.inner.config.concurrency_cap, "concurrency gate blocked tick");
            return Ok(());
        }

        self.drain_completions(now).await?;
        self.progress_non_run_phases(now).await?;
        self.dispatch_ready_tasks(now, active).await?;

        Ok(())
    }

    // -- step 3: advance post-run tasks ------------------------------------

    async fn drain_completions(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let mut rx = self.inner.completions_rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(completion) => {
                    self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(rx);
                    self.resolve_completion(completion, now).await?;
                    rx = self.inner.completions_rx.lock().await;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
        Ok(())
    }

    async fn resolve_completion(&self, completion: RunCompletion, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        match completion {
            RunCompletion::Implement(c, outcome) => self.resolve_implement(c, outcome, now).await,
            RunCompletion::Review(c, outcome) => self.resolve_review(c, outcome, now).await,
            RunCompletion::Fix(c, outcome) => self.resolve_fix(c, outcome, now).await,
        }
    }

    async fn resolve_implement(
        &self,
        c: ImplementCompletion,
        outcome: crate::run_pool::RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        if outcome.status == InvocationStatus::Completed {
            let repo_path = PathBuf::from(&c.task.repo_path);
            match self.inner.codehost.find_pr_for_branch(&c.branch_name, &repo_path).await {
                Ok(pr) if pr.exists => {
                    let pr_number = pr.number.unwrap_or_default();
                    tasks::record_pr_and_review(&self.inner.db, &c.task.issue_id, pr_number, &c.branch_name, now).await?;
                    if let Err(e) = self.inner.codehost.close_superseded_prs(&c.task.issue_id, pr_number, &repo_path).await {
                        tracing::warn!(issue_id = %c.task.issue_id, error = %e, "failed to close superseded PRs");
                    }
                    self.publish_task_updated(&c.task.issue_id, "in_review");
                    return Ok(());
                }
                Ok(_) => {
                    tracing::info!(issue_id = %c.task.issue_id, "implement run completed but produced no PR");
                }
                Err(e) => {
                    tracing::warn!(issue_id = %c.task.issue_id, error = %e, "failed to look up PR for implement branch");
                }
            }
        } else {
            tracing::info!(issue_id = %c.task.issue_id, status = ?outcome.status, "implement run did not complete successfully");
        }

        self.retry_or_fail(&c.task, now).await
    }

    async fn resolve_review(
        &self,
        c: ReviewCompletion,
        outcome: crate::run_pool::RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let decision = review::parse_review_decision(outcome.result_text.as_deref());
        match decision {
            ReviewDecision::Approved => {
                let Some(pr_number) = c.task.pr_number else {
                    tracing::warn!(issue_id = %c.task.issue_id, "review approved but task has no pr_number on record");
                    tasks::mark_failed(&self.inner.db, &c.task.issue_id, now).await?;
                    return Ok(());
                };
                let repo_path = PathBuf::from(&c.task.repo_path);
                match self.inner.codehost.get_merge_commit_sha(pr_number, &repo_path).await {
                    Ok(Some(sha)) => {
                        tasks::record_merge_and_deploy(&self.inner.db, &c.task.issue_id, &sha, now).await?;
                        self.publish_task_updated(&c.task.issue_id, "deploying");
                    }
                    Ok(None) => {
                        tracing::warn!(issue_id = %c.task.issue_id, "merge commit sha not yet observable, parking in awaiting_ci");
                        tasks::set_status(&self.inner.db, &c.task.issue_id, TaskStatus::AwaitingCi, now).await?;
                    }
                    Err(e) => {
                        tracing::warn!(issue_id = %c.task.issue_id, error = %e, "failed to query merge commit sha");
                        tasks::set_status(&self.inner.db, &c.task.issue_id, TaskStatus::AwaitingCi, now).await?;
                    }
                }
            }
            ReviewDecision::ChangesRequested => {
                tasks::set_status(&self.inner.db, &c.task.issue_id, TaskStatus::ChangesRequested, now).await?;
                self.publish_task_updated(&c.task.issue_id, "changes_requested");
            }
            ReviewDecision::NoDecision => {
                tracing::warn!(issue_id = %c.task.issue_id, status = ?outcome.status, "review run produced no decision");
                tasks::mark_failed(&self.inner.db, &c.task.issue_id, now).await?;
            }
        }
        Ok(())
    }

    async fn resolve_fix(
        &self,
        c: FixCompletion,
        _outcome: crate::run_pool::RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let (_, new_count) = tasks::bump_review_cycle(&self.inner.db, &c.task.issue_id, TaskStatus::InReview, now).await?;
        if new_count > self.inner.config.max_review_cycles {
            tasks::mark_failed(&self.inner.db, &c.task.issue_id, now).await?;
        } else {
            self.publish_task_updated(&c.task.issue_id, "in_review");
        }
        Ok(())
    }

    async fn retry_or_fail(&self, task: &Task, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if task.retry_count < self.inner.config.max_retries {
            tasks::retry_to_ready(&self.inner.db, &task.issue_id, now).await?;
        } else {
            tasks::mark_failed(&self.inner.db, &task.issue_id, now).await?;
        }
        self.publish_task_updated(&task.issue_id, "retry_or_fail");
        Ok(())
    }

    // -- step 4: progress non-run phases ------------------------------------

    async fn progress_non_run_phases(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let all_tasks = tasks::list_tasks(&self.inner.db).await?;

        for task in all_tasks {
            if orca_db::queries::invocations::running_invocation_for_task(&self.inner.db, &task.issue_id)
                .await?
                .is_some()
            {
                continue;
            }

            match task.orca_status {
                TaskStatus::InReview => self.dispatch_review(task, now).await,
                TaskStatus::ChangesRequested => self.dispatch_fix(task, now).await,
                TaskStatus::Deploying | TaskStatus::AwaitingCi => self.progress_deploy(task, now).await?,
                _ => {}
            }
        }

        Ok(())
    }

    async fn progress_deploy(&self, task: Task, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.inner.config.deploy_strategy == DeployStrategy::None {
            tasks::mark_done(&self.inner.db, &task.issue_id, now).await?;
            self.publish_task_updated(&task.issue_id, "done");
            return Ok(());
        }

        let Some(sha) = task.merge_commit_sha.as_deref() else {
            return Ok(());
        };
        let Some(started) = task.deploy_started_at else {
            return Ok(());
        };

        let elapsed = now.signed_duration_since(started);
        if elapsed > chrono::Duration::minutes(self.inner.config.deploy_timeout_min as i64) {
            tracing::warn!(issue_id = %task.issue_id, "deploy timed out");
            tasks::mark_failed(&self.inner.db, &task.issue_id, now).await?;
            return Ok(());
        }

        let repo_path = PathBuf::from(&task.repo_path);
        match self.inner.codehost.get_workflow_run_status(sha, &repo_path).await {
            Ok(WorkflowRunStatus::Success) => {
                tasks::mark_done(&self.inner.db, &task.issue_id, now).await?;
                self.publish_task_updated(&task.issue_id, "done");
            }
            Ok(WorkflowRunStatus::Failure) => {
                tasks::mark_failed(&self.inner.db, &task.issue_id, now).await?;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(issue_id = %task.issue_id, error = %e, "failed to query workflow run status");
            }
        }

        Ok(())
    }

    // -- step 5: dispatch ----------------------------------------------------

    async fn dispatch_ready_tasks(&self, now: DateTime<Utc>, mut active: i64) -> Result<(), SchedulerError> {
        loop {
            if active >= self.inner.config.concurrency_cap {
                break;
            }

            let ready = tasks::ready_tasks(&self.inner.db).await?;
            let all_tasks = tasks::list_tasks(&self.inner.db).await?;
            let statuses: HashMap<String, String> =
                all_tasks.iter().map(|t| (t.issue_id.clone(), t.orca_status.to_string())).collect();

            let candidate = {
                let graph = self.inner.graph.read().await;
                pick_dispatch_candidate(&ready, &graph, self.inner.config.max_retries, &statuses)
            };

            let Some(task) = candidate else {
                break;
            };

            let rows = tasks::transition_status(&self.inner.db, &task.issue_id, TaskStatus::Ready, TaskStatus::Dispatched, now).await?;
            if rows == 0 {
                // Someone else (a concurrent webhook-driven edit) already moved this task; try again.
                continue;
            }

            self.dispatch_implement(task.clone(), now).await;
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            active += 1;
            self.publish_task_updated(&task.issue_id, "dispatched");
        }

        Ok(())
    }

    async fn dispatch_implement(&self, task: Task, now: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let branch_name_prefix = task.issue_id.clone();
            let system_prompt = inner.config.implement_prompt.clone();

            let worktree = match get_or_create_worktree_manager(&inner, &task.repo_path).await {
                Ok(mgr) => mgr,
                Err(e) => {
                    tracing::warn!(issue_id = %task.issue_id, error = %e, "failed to initialize worktree manager");
                    let _ = tasks::retry_to_ready(&inner.db, &task.issue_id, now).await;
                    return;
                }
            };

            // A placeholder invocation id of 0 in the branch name is fine: the real
            // invocation row (and its id) is created inside RunPool::run; the branch
            // only needs to be unique per dispatch attempt, which the wall-clock
            // dispatch timestamp guarantees in combination with the issue id.
            let branch_name = format!("orca/{}-inv-{}", branch_name_prefix, now.timestamp_millis());

            let worktree_info = match tokio::task::spawn_blocking({
                let worktree = worktree.clone();
                let branch_name = branch_name.clone();
                move || worktree.create_worktree(&branch_name)
            })
            .await
            {
                Ok(Ok(info)) => info,
                _ => {
                    tracing::warn!(issue_id = %task.issue_id, "failed to create worktree for implement run");
                    let _ = tasks::retry_to_ready(&inner.db, &task.issue_id, now).await;
                    return;
                }
            };

            let spec = SpawnSpec {
                agent_prompt: task.agent_prompt.clone(),
                worktree_path: worktree_info.path.clone(),
                max_turns: inner.config.default_max_turns,
                invocation_id: 0,
                agent_bin: inner.config.agent_bin.clone(),
                system_prompt,
                disallowed_tools: inner.config.disallowed_tools.clone(),
            };

            let _ = tasks::transition_status(&inner.db, &task.issue_id, TaskStatus::Dispatched, TaskStatus::Running, now).await;

            let worktree_path_str = worktree_info.path.to_string_lossy().into_owned();
            let outcome = inner
                .run_pool
                .run(
                    &inner.db,
                    &task.issue_id,
                    Phase::Implement,
                    spec,
                    Some(&branch_name),
                    Some(&worktree_path_str),
                    StdDuration::from_secs((inner.config.session_timeout_min * 60) as u64),
                    now,
                )
                .await;

            if let Ok(outcome) = outcome {
                let _ = inner
                    .completions_tx
                    .send(RunCompletion::Implement(ImplementCompletion { task, branch_name }, outcome));
            } else {
                tracing::warn!(error = ?outcome.err(), "implement run pool invocation failed to spawn");
                let _ = tasks::retry_to_ready(&inner.db, &task.issue_id, now).await;
            }
        });
    }

    async fn dispatch_review(&self, task: Task, now: DateTime<Utc>) {
        self.dispatch_phase_run(task, Phase::Review, now, |issue_id, pr_branch| {
            format!("review run for {issue_id} against {pr_branch}")
        })
        .await;
    }

    async fn dispatch_fix(&self, task: Task, now: DateTime<Utc>) {
        self.dispatch_phase_run(task, Phase::Fix, now, |issue_id, pr_branch| {
            format!("fix run for {issue_id} against {pr_branch}")
        })
        .await;
    }

    async fn dispatch_phase_run(
        &self,
        task: Task,
        phase: Phase,
        now: DateTime<Utc>,
        prompt_fallback: impl Fn(&str, &str) -> String + Send + 'static,
    ) {
        let Some(pr_branch) = task.pr_branch_name.clone() else {
            tracing::warn!(issue_id = %task.issue_id, ?phase, "cannot dispatch phase run without a recorded PR branch");
            return;
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let worktree = match get_or_create_worktree_manager(&inner, &task.repo_path).await {
                Ok(mgr) => mgr,
                Err(e) => {
                    tracing::warn!(issue_id = %task.issue_id, error = %e, "failed to initialize worktree manager for phase run");
                    return;
                }
            };

            let worktree_info = match tokio::task::spawn_blocking({
                let worktree = worktree.clone();
                let pr_branch = pr_branch.clone();
                move || worktree.create_worktree(&pr_branch)
            })
            .await
            {
                Ok(Ok(info)) => info,
                _ => {
                    tracing::warn!(issue_id = %task.issue_id, ?phase, "failed to check out PR branch for phase run");
                    return;
                }
            };

            let (prompt, system_prompt, max_turns) = match phase {
                Phase::Review => (
                    prompt_fallback(&task.issue_id, &pr_branch),
                    Some(inner.config.review_prompt.clone()),
                    inner.config.review_max_turns,
                ),
                Phase::Fix => (
                    prompt_fallback(&task.issue_id, &pr_branch),
                    Some(inner.config.fix_prompt.clone()),
                    inner.config.default_max_turns,
                ),
                Phase::Implement => unreachable!("dispatch_phase_run is only used for review/fix"),
            };

            let spec = SpawnSpec {
                agent_prompt: prompt,
                worktree_path: worktree_info.path.clone(),
                max_turns,
                invocation_id: 0,
                agent_bin: inner.config.agent_bin.clone(),
                system_prompt,
                disallowed_tools: inner.config.disallowed_tools.clone(),
            };

            let worktree_path_str = worktree_info.path.to_string_lossy().into_owned();
            let outcome = inner
                .run_pool
                .run(
                    &inner.db,
                    &task.issue_id,
                    phase,
                    spec,
                    Some(&pr_branch),
                    Some(&worktree_path_str),
                    StdDuration::from_secs((inner.config.session_timeout_min * 60) as u64),
                    now,
                )
                .await;

            if let Ok(outcome) = outcome {
                let completion = match phase {
                    Phase::Review => RunCompletion::Review(ReviewCompletion { task }, outcome),
                    Phase::Fix => RunCompletion::Fix(FixCompletion { task }, outcome),
                    Phase::Implement => unreachable!(),
                };
                let _ = inner.completions_tx.send(completion);
            } else {
                tracing::warn!(issue_id = %task.issue_id, ?phase, "phase run failed to spawn");
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    /// Force an immediate implement dispatch for one `ready` task, bypassing
    /// the budget/concurrency gates and priority ordering the tick applies.
    /// Used by the `orca dispatch` CLI command, a short-lived process with
    /// no other scheduler activity sharing this `Scheduler`'s completion
    /// channel, so waiting on the very next completion is safe here in a
    /// way it would not be inside a long-running tick loop.
    pub async fn dispatch_and_wait(&self, issue_id: &str, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let task = tasks::get_task(&self.inner.db, issue_id)
            .await?
            .ok_or_else(|| SchedulerError::Db(anyhow::anyhow!("task {issue_id} not found")))?;

        if task.orca_status != TaskStatus::Ready {
            return Err(SchedulerError::Db(anyhow::anyhow!(
                "task {issue_id} is not ready (status: {})",
                task.orca_status
            )));
        }

        let rows =
            tasks::transition_status(&self.inner.db, issue_id, TaskStatus::Ready, TaskStatus::Dispatched, now).await?;
        if rows == 0 {
            return Err(SchedulerError::Db(anyhow::anyhow!("task {issue_id} changed status concurrently, retry")));
        }

        self.dispatch_implement(task, now).await;

        let completion = self
            .inner
            .completions_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SchedulerError::Db(anyhow::anyhow!("dispatch channel closed before completion")))?;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.resolve_completion(completion, now).await
    }

    fn publish_task_updated(&self, issue_id: &str, event: &str) {
        self.inner.event_bus.publish(Event::new(
            topics::TASK_UPDATED,
            serde_json::json!({"issue_id": issue_id, "event": event}),
        ));
    }
}

async fn get_or_create_worktree_manager(inner: &Inner, repo_path: &str) -> Result<WorktreeManager, crate::worktree::WorktreeError> {
    let mut managers = inner.worktree_managers.lock().await;
    if let Some(mgr) = managers.get(repo_path) {
        return Ok(mgr.clone());
    }
    let mgr = WorktreeManager::new(repo_path, None)?;
    managers.insert(repo_path.to_string(), mgr.clone());
    Ok(mgr)
}

/// Pick the highest-(effective-)priority dispatchable ready task, ties
/// broken by `created_at` (already the `ready_tasks()` ordering, which this
/// function preserves by scanning in order and only re-keying by effective
/// priority, a stable sort).
fn pick_dispatch_candidate<'a>(
    ready: &'a [Task],
    graph: &DependencyGraph,
    max_retries: i64,
    statuses: &HashMap<String, String>,
) -> Option<&'a Task> {
    let mut candidates: Vec<&Task> = ready
        .iter()
        .filter(|t| t.retry_count < max_retries)
        .filter(|t| graph.is_dispatchable(&t.issue_id, |id| statuses.get(id).map(|s| s.as_str())))
        .collect();

    candidates.sort_by_key(|t| dispatch_sort_key(graph.effective_priority(&t.issue_id, |id| priority_of(ready, id))));
    candidates.into_iter().next()
}

fn priority_of(tasks: &[Task], issue_id: &str) -> i64 {
    tasks.iter().find(|t| t.issue_id == issue_id).map(|t| t.priority).unwrap_or(0)
}

/// Unprioritized tasks (effective priority `0`) sort after every real
/// priority (`1..=4`).
fn dispatch_sort_key(effective_priority: i64) -> i64 {
    if effective_priority == 0 {
        i64::MAX
    } else {
        effective_priority
    }
}
