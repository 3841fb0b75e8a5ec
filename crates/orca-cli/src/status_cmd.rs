//! `orca status`: task progress summary and per-task listing.

use anyhow::Result;
use sqlx::SqlitePool;

use orca_db::queries::tasks;

pub async fn run(db: &SqlitePool) -> Result<()> {
    let progress = tasks::task_progress(db).await?;

    println!("Progress: {}/{} done", progress.done, progress.total);
    println!(
        "  backlog={} ready={} dispatched={} running={} in_review={} changes_requested={} deploying={} awaiting_ci={} done={} failed={}",
        progress.backlog,
        progress.ready,
        progress.dispatched,
        progress.running,
        progress.in_review,
        progress.changes_requested,
        progress.deploying,
        progress.awaiting_ci,
        progress.done,
        progress.failed,
    );

    if progress.total == 0 {
        return Ok(());
    }

    println!();
    println!("{:<20} {:<16} {:>8} {:>7}", "ISSUE", "STATUS", "PRIORITY", "RETRIES");
    println!("{}", "-".repeat(56));

    let all = tasks::list_tasks(db).await?;
    for task in &all {
        let icon = status_icon(&task.orca_status.to_string());
        println!(
            "[{}] {:<16} {:<16} {:>8} {:>7}",
            icon, task.issue_id, task.orca_status, task.priority, task.retry_count
        );
    }

    Ok(())
}

fn status_icon(status: &str) -> &'static str {
    match status {
        "backlog" => ".",
        "ready" => ">",
        "dispatched" => ">",
        "running" => "*",
        "in_review" => "?",
        "changes_requested" => "?",
        "deploying" => "^",
        "awaiting_ci" => "^",
        "done" => "+",
        "failed" => "!",
        _ => " ",
    }
}
