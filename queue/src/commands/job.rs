use anyhow::Result;
use serde_json::Value;

use groupq::EnqueueRequest;

use crate::cli_utils;

use super::shared::{open_queue, parse_payload};

pub(crate) async fn job_show(
    job_id: String,
    config: Option<String>,
    namespace: Option<String>,
    raw: bool,
) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    let Some(job) = queue.get_job(&job_id).await? else {
        println!("Job {job_id} not found");
        return Ok(());
    };

    if raw {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("Job ID:        {}", job.id);
    println!("Group:         {}", job.group_id);
    println!("State:         {}", job.state.as_str().to_uppercase());
    println!(
        "Order:         {} ({})",
        cli_utils::format_order_ms(job.order_ms),
        job.order_ms
    );
    println!("Sequence:      {}", job.seq);
    println!("Attempts:      {}/{}", job.attempts, job.max_attempts);
    println!(
        "Enqueued:      {}",
        cli_utils::format_timestamp(job.enqueued_at)
    );
    if job.reserved_at.is_some() {
        println!(
            "Reserved:      {}",
            cli_utils::format_timestamp(job.reserved_at)
        );
    }
    if job.lease_expires_at.is_some() {
        println!(
            "Lease expires: {}",
            cli_utils::format_timestamp(job.lease_expires_at)
        );
    }
    if job.failed_at.is_some() {
        println!(
            "Failed:        {}",
            cli_utils::format_timestamp(job.failed_at)
        );
    }
    if let Some(error) = job.last_error.as_deref() {
        println!("Last error:    {error}");
    }

    let lease_holder = queue.store().group_lease_holder(&job.group_id).await?;
    if let Some(holder) = lease_holder {
        let marker = if holder == job.id { " (this job)" } else { "" };
        println!("Group lease:   {holder}{marker}");
    }

    println!("Payload:");
    match serde_json::from_str::<Value>(&job.payload) {
        Ok(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
        Err(_) => println!("{}", job.payload),
    }
    Ok(())
}

pub(crate) struct JobSubmitOptions {
    pub(crate) config: Option<String>,
    pub(crate) namespace: Option<String>,
    pub(crate) group: String,
    pub(crate) payload: String,
    pub(crate) order_ms: Option<i64>,
    pub(crate) job_id: Option<String>,
    pub(crate) max_attempts: Option<i64>,
}

pub(crate) async fn job_submit(options: JobSubmitOptions) -> Result<()> {
    let queue = open_queue(options.config.as_deref(), options.namespace.as_deref()).await?;
    let mut request = EnqueueRequest::new(options.group, parse_payload(&options.payload)?);
    if let Some(order_ms) = options.order_ms {
        request = request.order_ms(order_ms);
    }
    if let Some(job_id) = options.job_id {
        request = request.job_id(job_id);
    }
    if let Some(max_attempts) = options.max_attempts {
        request = request.max_attempts(max_attempts);
    }

    let receipt = queue.add_detailed(request).await?;
    if receipt.created {
        println!(
            "Submitted job {} (sequence {}, score {})",
            receipt.job_id, receipt.seq, receipt.score
        );
    } else {
        println!("Job {} already exists; nothing added", receipt.job_id);
    }
    Ok(())
}
