use anyhow::Result;

use crate::cli_utils;

use super::shared::open_queue;

pub(crate) async fn dead_list(
    config: Option<String>,
    namespace: Option<String>,
    limit: usize,
    raw: bool,
) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    let jobs = queue.dead_jobs(limit).await?;

    if raw {
        for job in &jobs {
            println!("{}", serde_json::to_string_pretty(job)?);
        }
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No dead jobs in namespace: {}", queue.namespace());
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<30} {:<18} {:>8}",
        "Job ID", "Group", "Error", "Failed At", "Attempts"
    );
    for job in &jobs {
        let error = job.last_error.as_deref().unwrap_or("Unknown");
        println!(
            "{:<38} {:<20} {:<30} {:<18} {:>8}",
            cli_utils::truncate(&job.id, 36),
            cli_utils::truncate(&job.group_id, 18),
            cli_utils::truncate(error, 28),
            cli_utils::format_timestamp(job.failed_at),
            job.attempts
        );
    }

    let total = queue.counts().await?.dead;
    println!("\nShowing {} of {total} dead jobs", jobs.len());
    Ok(())
}

pub(crate) async fn dead_retry(
    job_id: String,
    config: Option<String>,
    namespace: Option<String>,
) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    if queue.retry_dead(&job_id).await? {
        println!("Job {job_id} returned to its group");
    } else {
        println!("Job {job_id} is not dead; nothing changed");
    }
    Ok(())
}
