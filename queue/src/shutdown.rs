use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::queue::Queue;
use crate::worker::{RunningJobInfo, Worker};

const DEFAULT_QUEUE_EMPTY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// A queue whose backlog a graceful shutdown waits on.
#[async_trait]
pub trait DrainableQueue: Send + Sync {
    fn namespace(&self) -> &str;
    async fn wait_for_empty(&self, timeout: Duration) -> Result<bool>;
}

/// A worker a graceful shutdown stops.
#[async_trait]
pub trait StoppableWorker: Send + Sync {
    fn worker_id(&self) -> &str;
    async fn stop(&self) -> Result<()>;
    async fn current_jobs(&self) -> Vec<RunningJobInfo>;
}

#[async_trait]
impl<T: 'static> DrainableQueue for Queue<T> {
    fn namespace(&self) -> &str {
        Queue::namespace(self)
    }

    async fn wait_for_empty(&self, timeout: Duration) -> Result<bool> {
        Queue::wait_for_empty(self, timeout).await
    }
}

#[async_trait]
impl<T: 'static> StoppableWorker for Worker<T> {
    fn worker_id(&self) -> &str {
        Worker::worker_id(self)
    }

    async fn stop(&self) -> Result<()> {
        self.close().await
    }

    async fn current_jobs(&self) -> Vec<RunningJobInfo> {
        self.running_jobs().await
    }
}

#[derive(Debug, Clone)]
pub struct GracefulShutdownOptions {
    /// How long to let workers drain the queues before stopping them.
    pub queue_empty_timeout: Duration,
    /// Bound on each worker's `close`.
    pub worker_stop_timeout: Duration,
}

impl Default for GracefulShutdownOptions {
    fn default() -> Self {
        Self {
            queue_empty_timeout: DEFAULT_QUEUE_EMPTY_TIMEOUT,
            worker_stop_timeout: DEFAULT_WORKER_STOP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every queue emptied before `queue_empty_timeout`.
    pub queues_drained: bool,
    pub workers_stopped: Vec<String>,
    pub workers_failed: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub running: Vec<RunningJobInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkersStatus {
    pub total: usize,
    pub processing: usize,
    pub idle: usize,
    pub workers: Vec<WorkerStatus>,
}

/// Coordinated stop for a process hosting queues and workers: on a trigger,
/// give workers a bounded window to empty the queues, then close every worker
/// concurrently with a per-worker timeout.
///
/// Unlike a signal handler that exits the process, this returns a
/// [`ShutdownReport`] and leaves the exit to the caller.
#[derive(Clone, Default)]
pub struct GracefulShutdown {
    queues: Vec<Arc<dyn DrainableQueue>>,
    workers: Vec<Arc<dyn StoppableWorker>>,
    options: GracefulShutdownOptions,
}

impl GracefulShutdown {
    pub fn new(options: GracefulShutdownOptions) -> Self {
        Self {
            queues: Vec::new(),
            workers: Vec::new(),
            options,
        }
    }

    pub fn with_queue(mut self, queue: impl DrainableQueue + 'static) -> Self {
        self.queues.push(Arc::new(queue));
        self
    }

    pub fn with_worker(mut self, worker: impl StoppableWorker + 'static) -> Self {
        self.workers.push(Arc::new(worker));
        self
    }

    /// Waits for SIGINT or SIGTERM, then shuts down.
    pub async fn run_until_signal(&self) -> Result<ShutdownReport> {
        let signal = wait_for_signal().await?;
        tracing::info!(signal, "shutdown signal received");
        Ok(self.shutdown().await)
    }

    /// Waits for `trigger` to resolve, then shuts down.
    pub async fn run_until<F>(&self, trigger: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        trigger.await;
        self.shutdown().await
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        tracing::info!(
            queues = self.queues.len(),
            workers = self.workers.len(),
            "graceful shutdown started"
        );

        let queues_drained = self.wait_for_queues().await;
        let (workers_stopped, workers_failed) = self.stop_workers().await;

        let report = ShutdownReport {
            queues_drained,
            workers_stopped,
            workers_failed,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            stopped = report.workers_stopped.len(),
            failed = report.workers_failed.len(),
            queues_drained,
            "graceful shutdown completed"
        );
        report
    }

    async fn wait_for_queues(&self) -> bool {
        let deadline = Instant::now() + self.options.queue_empty_timeout;
        let mut drained = true;
        for queue in &self.queues {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match queue.wait_for_empty(remaining).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        namespace = queue.namespace(),
                        "queue not empty before timeout, stopping workers anyway"
                    );
                    drained = false;
                }
                Err(err) => {
                    tracing::warn!(
                        namespace = queue.namespace(),
                        "failed to check queue backlog: {err:#}"
                    );
                    drained = false;
                }
            }
        }
        drained
    }

    async fn stop_workers(&self) -> (Vec<String>, Vec<String>) {
        let timeout = self.options.worker_stop_timeout;
        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            tasks.spawn(async move {
                let worker_id = worker.worker_id().to_string();
                let result = match tokio::time::timeout(timeout, worker.stop()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "did not stop within {} ms",
                        timeout.as_millis()
                    )),
                };
                (worker_id, result)
            });
        }

        let mut stopped = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((worker_id, Ok(()))) => {
                    tracing::info!(worker_id = %worker_id, "worker stopped");
                    stopped.push(worker_id);
                }
                Ok((worker_id, Err(err))) => {
                    tracing::warn!(worker_id = %worker_id, "worker failed to stop: {err:#}");
                    failed.push(worker_id);
                }
                Err(err) => tracing::error!("worker stop task failed: {err}"),
            }
        }
        stopped.sort();
        failed.sort();
        (stopped, failed)
    }

    pub async fn workers_status(&self) -> WorkersStatus {
        let mut workers = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            workers.push(WorkerStatus {
                worker_id: worker.worker_id().to_string(),
                running: worker.current_jobs().await,
            });
        }
        let processing = workers.iter().filter(|w| !w.running.is_empty()).count();
        WorkersStatus {
            total: workers.len(),
            processing,
            idle: workers.len() - processing,
            workers,
        }
    }
}

/// Resolves on the first SIGINT (ctrl-c) or, on unix, SIGTERM and returns its
/// name.
pub async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::job::ReservedJob;
    use crate::queue::EnqueueRequest;
    use crate::test_support::RedisTestContext;
    use crate::worker::{WorkerOptions, handler_fn};
    use serde_json::{Value, json};
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(50),
            backoff: BackoffPolicy::none(),
            ..WorkerOptions::default()
        }
    }

    fn sleeping_worker(queue: &Queue<Value>, id: &str, work: Duration) -> Worker<Value> {
        let handler = handler_fn(move |_job: ReservedJob<Value>| async move {
            sleep(work).await;
            Ok(())
        });
        Worker::new(queue.clone(), handler, fast_options().with_worker_id(id)).unwrap()
    }

    #[tokio::test]
    async fn trigger_drains_queue_then_stops_workers() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        for n in 0..5 {
            queue
                .add(EnqueueRequest::new(format!("g{}", n % 2), json!({"n": n})))
                .await
                .unwrap();
        }

        let worker = sleeping_worker(&queue, "w-1", Duration::from_millis(5));
        let runner = worker.clone();
        let run_handle = tokio::spawn(async move { runner.run().await });

        let (tx, rx) = oneshot::channel::<()>();
        let shutdown = GracefulShutdown::new(GracefulShutdownOptions {
            queue_empty_timeout: Duration::from_secs(10),
            worker_stop_timeout: Duration::from_secs(5),
        })
        .with_queue(queue.clone())
        .with_worker(worker.clone());
        let shutdown_handle = tokio::spawn(async move {
            shutdown
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });

        tx.send(()).unwrap();
        let report = shutdown_handle.await.unwrap();
        assert!(report.queues_drained);
        assert_eq!(report.workers_stopped, vec!["w-1".to_string()]);
        assert!(report.workers_failed.is_empty());
        assert_eq!(queue.counts().await.unwrap().waiting, 0);

        tokio::time::timeout(Duration::from_secs(2), run_handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn slow_worker_is_reported_as_failed() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        queue
            .add(EnqueueRequest::new("g", json!({})))
            .await
            .unwrap();

        let worker = sleeping_worker(&queue, "w-slow", Duration::from_millis(800));
        let runner = worker.clone();
        let run_handle = tokio::spawn(async move { runner.run().await });
        while !worker.is_processing().await {
            sleep(Duration::from_millis(10)).await;
        }

        let shutdown = GracefulShutdown::new(GracefulShutdownOptions {
            queue_empty_timeout: Duration::from_millis(50),
            worker_stop_timeout: Duration::from_millis(100),
        })
        .with_queue(queue.clone())
        .with_worker(worker.clone());

        let status = shutdown.workers_status().await;
        assert_eq!(status.total, 1);
        assert_eq!(status.processing, 1);
        assert_eq!(status.idle, 0);
        assert_eq!(status.workers[0].running.len(), 1);

        let report = shutdown.shutdown().await;
        assert!(!report.queues_drained);
        assert!(report.workers_stopped.is_empty());
        assert_eq!(report.workers_failed, vec!["w-slow".to_string()]);

        tokio::time::timeout(Duration::from_secs(5), run_handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!worker.is_processing().await);
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_nothing_registered_is_immediate() {
        let report = GracefulShutdown::default().shutdown().await;
        assert!(report.queues_drained);
        assert!(report.workers_stopped.is_empty());
        assert!(report.workers_failed.is_empty());
        assert_eq!(GracefulShutdown::default().workers_status().await.total, 0);
    }
}
