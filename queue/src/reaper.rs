use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::constants::{DEFAULT_REAPER_BATCH_SIZE, MAX_REAP_BATCHES_PER_TICK};
use crate::job::now_ms;
use crate::queue::Queue;
use crate::store::{QueueStore, ReapReport};
use crate::telemetry;
use crate::worker::sleep_with_shutdown;

/// Returns jobs whose lease expired to their groups (or to dead once their
/// attempts are spent) and re-admits groups whose retry backoff elapsed.
///
/// Safe to run from any number of processes at once; each expired lease is
/// settled by exactly one script call.
#[derive(Clone)]
pub struct LeaseReaper {
    store: QueueStore,
    interval: Duration,
    batch_size: usize,
}

impl LeaseReaper {
    pub fn new(store: QueueStore, interval: Duration, batch_size: usize) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(1)),
            batch_size: batch_size.max(1),
        }
    }

    pub fn for_queue<T>(queue: &Queue<T>, interval: Duration) -> Self {
        if interval >= queue.job_timeout() {
            tracing::warn!(
                namespace = %queue.namespace(),
                interval_ms = interval.as_millis() as u64,
                job_timeout_ms = queue.job_timeout().as_millis() as u64,
                "reaper interval is not shorter than the job timeout; expired leases will linger"
            );
        }
        Self::new(queue.store().clone(), interval, DEFAULT_REAPER_BATCH_SIZE)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run_once(&self) -> Result<ReapReport> {
        let mut total = ReapReport::default();
        for _ in 0..MAX_REAP_BATCHES_PER_TICK {
            let report = self.store.reap_expired(now_ms(), self.batch_size).await?;
            total.absorb(report);
            if report.reclaimed + report.dead < self.batch_size as u64 {
                break;
            }
        }

        if total.reclaimed > 0 || total.dead > 0 {
            tracing::warn!(
                event = "groupq.lease_reclaim",
                namespace = %self.store.keys().namespace(),
                reclaimed = total.reclaimed,
                dead = total.dead,
                "reclaimed expired leases"
            );
        }
        if total.promoted > 0 {
            tracing::debug!(promoted = total.promoted, "promoted groups out of backoff");
        }
        telemetry::record_reap(&total);
        Ok(total)
    }

    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        tracing::debug!(
            namespace = %self.store.keys().namespace(),
            interval_ms = self.interval.as_millis() as u64,
            "lease reaper started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.run_once().await {
                tracing::error!("failed to reap expired leases: {err:#}");
            }
            sleep_with_shutdown(&shutdown, self.interval).await;
        }
        tracing::debug!("lease reaper stopped");
    }

    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
