use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{self as tokio_io, AsyncBufRead, AsyncBufReadExt, BufReader};

use groupq::QueueCounts;

use crate::cli_utils;

use super::shared::open_queue;

fn print_counts(namespace: &str, counts: &QueueCounts) {
    println!("Namespace: {namespace}");
    println!("  {:<16} {:>10}", "Active", counts.active);
    println!("  {:<16} {:>10}", "Waiting", counts.waiting);
    println!("  {:<16} {:>10}", "Groups", counts.groups);
    println!("  {:<16} {:>10}", "Ready groups", counts.ready_groups);
    println!("  {:<16} {:>10}", "Delayed groups", counts.delayed_groups);
    println!("  {:<16} {:>10}", "Dead", counts.dead);
}

pub(crate) async fn queue_stats(config: Option<String>, namespace: Option<String>) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    let counts = queue.counts().await?;
    print_counts(queue.namespace(), &counts);
    Ok(())
}

pub(crate) async fn queue_monitor(
    config: Option<String>,
    namespace: Option<String>,
    interval_ms: u64,
) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    let interval = Duration::from_millis(interval_ms.max(100));
    println!(
        "{:<20} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "Time", "Active", "Waiting", "Groups", "Ready", "Delayed", "Dead"
    );
    loop {
        let counts = queue.counts().await?;
        println!(
            "{:<20} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            counts.active,
            counts.waiting,
            counts.groups,
            counts.ready_groups,
            counts.delayed_groups,
            counts.dead
        );
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    Ok(())
}

pub(crate) async fn queue_groups(
    config: Option<String>,
    namespace: Option<String>,
    limit: usize,
) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    let store = queue.store();

    let ready = store.ready_groups(limit).await?;
    if ready.is_empty() {
        println!("No ready groups");
    } else {
        println!("{:<32} {:<26} {:>8}", "Ready group", "Head order", "Pending");
        for (group_id, score) in &ready {
            let pending = store.group_len(group_id).await?;
            println!(
                "{:<32} {:<26} {:>8}",
                cli_utils::truncate(group_id, 30),
                cli_utils::format_order_ms(cli_utils::order_ms_from_score(*score)),
                pending
            );
        }
    }

    let active = store.active_job_ids(limit).await?;
    if !active.is_empty() {
        println!();
        println!("{:<32} {:<38} {:>14}", "Leased group", "Job ID", "Lease expiry");
        let ids: Vec<String> = active.into_iter().map(|(id, _)| id).collect();
        for job in store.get_jobs(&ids).await? {
            println!(
                "{:<32} {:<38} {:>14}",
                cli_utils::truncate(&job.group_id, 30),
                job.id,
                cli_utils::format_timestamp(job.lease_expires_at)
            );
        }
    }
    Ok(())
}

pub(crate) async fn queue_reap(
    config: Option<String>,
    namespace: Option<String>,
    limit: usize,
) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    let report = queue.reap(limit).await?;
    println!(
        "Reclaimed {} leases, {} jobs moved to dead, {} delayed groups promoted",
        report.reclaimed, report.dead, report.promoted
    );
    Ok(())
}

/// Reads one answer line. Only `y` confirms; end of input declines.
async fn read_confirmation<R: AsyncBufRead + Unpin>(mut reader: R) -> Result<bool> {
    let mut input = String::new();
    reader
        .read_line(&mut input)
        .await
        .context("failed to read confirmation")?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

pub(crate) async fn queue_purge(
    config: Option<String>,
    namespace: Option<String>,
    yes: bool,
) -> Result<()> {
    let queue = open_queue(config.as_deref(), namespace.as_deref()).await?;
    let store = queue.store();
    let keys = store
        .scan_keys_by_pattern(&store.keys().namespace_pattern())
        .await?;
    if keys.is_empty() {
        println!("No keys found in namespace: {}", queue.namespace());
        return Ok(());
    }
    println!(
        "Found {} keys in namespace: {}",
        keys.len(),
        queue.namespace()
    );

    let confirmed = if yes {
        true
    } else {
        println!("Delete {} keys? [y/N]", keys.len());
        read_confirmation(BufReader::new(tokio_io::stdin())).await?
    };
    if !confirmed {
        println!("Purge cancelled");
        return Ok(());
    }

    let deleted = store.delete_namespace().await?;
    tracing::warn!(namespace = %queue.namespace(), deleted, "namespace purged");
    println!("Deleted {deleted} keys");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    struct BrokenInput;

    impl AsyncRead for BrokenInput {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("stdin closed by terminal")))
        }
    }

    #[tokio::test]
    async fn confirmation_accepts_only_y() {
        assert!(read_confirmation(&b"y\n"[..]).await.unwrap());
        assert!(read_confirmation(&b" Y \n"[..]).await.unwrap());
        assert!(!read_confirmation(&b"yes\n"[..]).await.unwrap());
        assert!(!read_confirmation(&b"\n"[..]).await.unwrap());
        assert!(!read_confirmation(&b""[..]).await.unwrap());
    }

    #[tokio::test]
    async fn confirmation_read_error_is_reported() {
        let err = read_confirmation(BufReader::new(BrokenInput))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("stdin closed by terminal"));
    }
}
