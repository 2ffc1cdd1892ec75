use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Instrument;
use tracing::field::Empty;
use uuid::Uuid;

use groupq_config::{DEFAULT_REAPER_INTERVAL_MS, GroupqSettings};

use crate::backoff::{BackoffPolicy, idle_poll_delay, jittered_delay};
use crate::constants::{DEFAULT_REAPER_BATCH_SIZE, DEFAULT_WORKER_ID_PREFIX};
use crate::error::{JobError, WorkerError};
use crate::job::{JobLease, ReservedJob};
use crate::queue::{FailOptions, Queue};
use crate::reaper::LeaseReaper;
use crate::store::FailOutcome;
use crate::telemetry;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;
pub type Handler<T> = Arc<dyn Fn(ReservedJob<T>) -> HandlerFuture + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&WorkerError) + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<T, F, Fut>(handler: F) -> Handler<T>
where
    T: 'static,
    F: Fn(ReservedJob<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(move |job: ReservedJob<T>| -> HandlerFuture { Box::pin(handler(job)) })
}

#[derive(Clone)]
pub struct WorkerOptions {
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Ceiling for the idle poll backoff.
    pub max_poll_interval: Duration,
    pub heartbeat: bool,
    /// Defaults to a third of the queue's job timeout.
    pub heartbeat_interval: Option<Duration>,
    pub reaper: bool,
    /// Defaults to half the job timeout, capped at five seconds.
    pub reaper_interval: Option<Duration>,
    pub reaper_batch_size: usize,
    pub shutdown_grace_period: Duration,
    pub backoff: BackoffPolicy,
    pub on_error: Option<ErrorCallback>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_settings(&GroupqSettings::default())
    }
}

impl WorkerOptions {
    pub fn from_settings(settings: &GroupqSettings) -> Self {
        Self {
            worker_id: None,
            concurrency: settings.worker_concurrency,
            poll_interval: settings.poll_interval(),
            max_poll_interval: settings.max_poll_interval(),
            heartbeat: settings.heartbeat_enabled,
            heartbeat_interval: settings.heartbeat_interval_ms.map(Duration::from_millis),
            reaper: settings.reaper_enabled,
            reaper_interval: settings.reaper_interval_ms.map(Duration::from_millis),
            reaper_batch_size: settings.reaper_batch_size,
            shutdown_grace_period: settings.shutdown_grace_period(),
            backoff: BackoffPolicy::from_settings(settings),
            on_error: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_on_error(mut self, callback: impl Fn(&WorkerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone)]
struct RunningJob {
    group_id: String,
    attempts: i64,
    started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJobInfo {
    pub job_id: String,
    pub group_id: String,
    pub attempts: i64,
    pub elapsed: Duration,
}

/// Pulls jobs from a [`Queue`] and runs them through a handler with bounded
/// concurrency. At most one job per group runs at a time across all workers.
///
/// Cloning yields another handle to the same worker, so one task can `run`
/// while another calls `close`. A closed worker cannot be restarted.
pub struct Worker<T> {
    worker_id: String,
    queue: Queue<T>,
    handler: Handler<T>,
    options: WorkerOptions,
    heartbeat_interval: Option<Duration>,
    reaper_interval: Option<Duration>,
    semaphore: Arc<Semaphore>,
    running_jobs: Arc<Mutex<HashMap<String, RunningJob>>>,
    shutdown: Arc<AtomicBool>,
    loop_active: Arc<AtomicBool>,
    loop_stopped: Arc<Notify>,
}

impl<T> Clone for Worker<T> {
    fn clone(&self) -> Self {
        Self {
            worker_id: self.worker_id.clone(),
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            options: self.options.clone(),
            heartbeat_interval: self.heartbeat_interval,
            reaper_interval: self.reaper_interval,
            semaphore: self.semaphore.clone(),
            running_jobs: self.running_jobs.clone(),
            shutdown: self.shutdown.clone(),
            loop_active: self.loop_active.clone(),
            loop_stopped: self.loop_stopped.clone(),
        }
    }
}

impl<T> Worker<T> {
    pub fn new(queue: Queue<T>, handler: Handler<T>, options: WorkerOptions) -> Result<Self> {
        if options.concurrency == 0 {
            anyhow::bail!("worker concurrency must be a positive integer");
        }

        let job_timeout = queue.job_timeout();
        let heartbeat_interval = options.heartbeat.then(|| {
            options
                .heartbeat_interval
                .unwrap_or(job_timeout / 3)
                .max(Duration::from_millis(1))
        });
        let reaper_interval = options.reaper.then(|| {
            options
                .reaper_interval
                .unwrap_or_else(|| {
                    (job_timeout / 2).min(Duration::from_millis(DEFAULT_REAPER_INTERVAL_MS))
                })
                .max(Duration::from_millis(1))
        });
        if let Some(interval) = reaper_interval
            && interval >= job_timeout
        {
            tracing::warn!(
                interval_ms = interval.as_millis() as u64,
                job_timeout_ms = job_timeout.as_millis() as u64,
                "reaper interval is not shorter than the job timeout"
            );
        }

        let worker_id = options.worker_id.clone().unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!(
                "{DEFAULT_WORKER_ID_PREFIX}{}_{}",
                std::process::id(),
                &suffix[..8]
            )
        });

        Ok(Self {
            worker_id,
            semaphore: Arc::new(Semaphore::new(options.concurrency)),
            queue,
            handler,
            options,
            heartbeat_interval,
            reaper_interval,
            running_jobs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            loop_active: Arc::new(AtomicBool::new(false)),
            loop_stopped: Arc::new(Notify::new()),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn running_jobs(&self) -> Vec<RunningJobInfo> {
        let running = self.running_jobs.lock().await;
        let mut jobs: Vec<RunningJobInfo> = running
            .iter()
            .map(|(job_id, job)| RunningJobInfo {
                job_id: job_id.clone(),
                group_id: job.group_id.clone(),
                attempts: job.attempts,
                elapsed: job.started_at.elapsed(),
            })
            .collect();
        jobs.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
        jobs
    }

    pub async fn is_processing(&self) -> bool {
        !self.running_jobs.lock().await.is_empty()
    }

    /// Stops reserving and waits up to the shutdown grace period for
    /// in-flight handlers. Handlers are never aborted; a job still running
    /// after the grace period keeps its lease until it finishes or expires.
    pub async fn close(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace_period;
        let stopped = self.loop_stopped.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        self.request_shutdown();
        if self.loop_active.load(Ordering::SeqCst) {
            stopped.await;
        }
        self.drain_tasks(deadline).await;
        Ok(())
    }

    async fn drain_tasks(&self, deadline: tokio::time::Instant) {
        loop {
            let remaining = {
                let running = self.running_jobs.lock().await;
                running.len()
            };
            if remaining == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        let job_ids: Vec<String> = self.running_jobs.lock().await.keys().cloned().collect();
        tracing::warn!(
            worker_id = %self.worker_id,
            remaining = job_ids.len(),
            job_ids = ?job_ids,
            "shutdown grace period elapsed with jobs still running"
        );
    }
}

impl<T> Worker<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub async fn run(&self) -> Result<()> {
        if self.loop_active.swap(true, Ordering::SeqCst) {
            anyhow::bail!("worker {} is already running", self.worker_id);
        }
        let reaper_stop = Arc::new(AtomicBool::new(false));
        let _guard = LoopGuard {
            loop_active: self.loop_active.clone(),
            loop_stopped: self.loop_stopped.clone(),
            reaper_stop: reaper_stop.clone(),
        };
        tracing::info!(
            worker_id = %self.worker_id,
            namespace = %self.queue.namespace(),
            concurrency = self.options.concurrency,
            "worker started"
        );

        let reaper_handle = self.reaper_interval.map(|interval| {
            LeaseReaper::new(
                self.queue.store().clone(),
                interval,
                if self.options.reaper_batch_size == 0 {
                    DEFAULT_REAPER_BATCH_SIZE
                } else {
                    self.options.reaper_batch_size
                },
            )
            .spawn(reaper_stop.clone())
        });

        let mut idle_streak = 0u32;
        while !self.shutdown.load(Ordering::SeqCst) {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                telemetry::record_poll_cycle("no_capacity");
                let delay = jittered_delay(self.options.poll_interval, 0.5);
                sleep_with_shutdown(&self.shutdown, delay).await;
                continue;
            };

            match self.queue.reserve().await {
                Ok(Some(job)) => {
                    idle_streak = 0;
                    telemetry::record_poll_cycle("fetched");
                    self.dispatch(job, permit).await;
                }
                Ok(None) => {
                    drop(permit);
                    idle_streak = idle_streak.saturating_add(1);
                    telemetry::record_poll_cycle("no_jobs");
                    self.idle(idle_streak).await;
                }
                Err(err) => {
                    drop(permit);
                    idle_streak = idle_streak.saturating_add(1);
                    telemetry::record_poll_cycle("error");
                    tracing::warn!(worker_id = %self.worker_id, "reserve failed: {err:#}");
                    report_error(&self.options.on_error, &WorkerError::Store(err));
                    self.idle(idle_streak).await;
                }
            }
        }

        self.drain_tasks(tokio::time::Instant::now() + self.options.shutdown_grace_period)
            .await;
        reaper_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = reaper_handle {
            let _ = handle.await;
        }
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn idle(&self, idle_streak: u32) {
        let delay = idle_poll_delay(
            self.options.poll_interval,
            self.options.max_poll_interval,
            idle_streak,
        );
        sleep_with_shutdown(&self.shutdown, jittered_delay(delay, 0.5)).await;
    }

    async fn dispatch(&self, job: ReservedJob<T>, permit: OwnedSemaphorePermit) {
        self.running_jobs.lock().await.insert(
            job.id.clone(),
            RunningJob {
                group_id: job.group_id.clone(),
                attempts: job.attempts,
                started_at: Instant::now(),
            },
        );

        let context = JobContext {
            worker_id: self.worker_id.clone(),
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            heartbeat_interval: self.heartbeat_interval,
            backoff: self.options.backoff,
            running_jobs: self.running_jobs.clone(),
            on_error: self.options.on_error.clone(),
        };
        tokio::spawn(async move {
            let _permit = permit;
            process_job(job, context).await;
        });
    }
}

/// Marks the run loop as stopped however `run` ends, including when its
/// future is dropped before completing.
struct LoopGuard {
    loop_active: Arc<AtomicBool>,
    loop_stopped: Arc<Notify>,
    reaper_stop: Arc<AtomicBool>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.reaper_stop.store(true, Ordering::SeqCst);
        self.loop_active.store(false, Ordering::SeqCst);
        self.loop_stopped.notify_waiters();
    }
}

struct JobContext<T> {
    worker_id: String,
    queue: Queue<T>,
    handler: Handler<T>,
    heartbeat_interval: Option<Duration>,
    backoff: BackoffPolicy,
    running_jobs: Arc<Mutex<HashMap<String, RunningJob>>>,
    on_error: Option<ErrorCallback>,
}

async fn process_job<T: Send + 'static>(job: ReservedJob<T>, context: JobContext<T>) {
    let lease = job.lease();
    let span = tracing::info_span!(
        "groupq.job",
        "groupq.worker_id" = %context.worker_id,
        "groupq.job_id" = %lease.job_id,
        "groupq.group_id" = %lease.group_id,
        "groupq.attempt" = lease.attempts,
        "groupq.outcome" = Empty,
        "groupq.duration_ms" = Empty,
    );

    async {
        let started = Instant::now();
        let heartbeat = context
            .heartbeat_interval
            .map(|interval| spawn_heartbeat(context.queue.clone(), lease.clone(), interval));

        let handler = context.handler.clone();
        let execution = tokio::spawn(async move { handler(job).await }.in_current_span());
        let result = match execution.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(JobError::retryable(anyhow::anyhow!(
                "job handler panicked"
            ))),
            Err(err) => Err(JobError::retryable(anyhow::anyhow!(
                "job handler task failed: {err}"
            ))),
        };
        if let Some(handle) = heartbeat {
            handle.abort();
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let span = tracing::Span::current();
        span.record("groupq.duration_ms", duration_ms);
        match settle_job(&context, &lease, result).await {
            Ok(outcome) => {
                span.record("groupq.outcome", outcome);
                telemetry::record_job_outcome(outcome, duration_ms);
            }
            Err(err) => {
                tracing::error!("failed to settle job: {err:#}");
                report_error(&context.on_error, &WorkerError::Store(err));
            }
        }

        context.running_jobs.lock().await.remove(&lease.job_id);
    }
    .instrument(span)
    .await;
}

async fn settle_job<T>(
    context: &JobContext<T>,
    lease: &JobLease,
    result: Result<(), JobError>,
) -> Result<&'static str> {
    let err = match result {
        Ok(()) => {
            return if context.queue.complete(lease).await? {
                tracing::info!(outcome = "success", "job completed");
                Ok("success")
            } else {
                Ok(FailOutcome::LeaseLost.as_str())
            };
        }
        Err(err) => err,
    };

    let fatal = err.is_fatal();
    let error = match err {
        JobError::Retryable(error) | JobError::Fatal(error) => error,
    };
    let message = format!("{error:#}");
    let options = if fatal {
        FailOptions::dead()
    } else if lease.is_final_attempt() {
        FailOptions::retry()
    } else {
        FailOptions::retry().with_backoff(context.backoff.delay_for_attempt(lease.attempts))
    };
    let outcome = context
        .queue
        .fail(lease, options.with_error(message.clone()))
        .await?;

    match outcome {
        FailOutcome::Requeued => {
            tracing::warn!(outcome = "retry", error = %message, "job failed; will retry");
        }
        FailOutcome::Dead => {
            tracing::error!(outcome = "dead", fatal, error = %message, "job moved to dead");
        }
        FailOutcome::LeaseLost => {}
    }
    report_error(
        &context.on_error,
        &WorkerError::Job {
            job_id: lease.job_id.clone(),
            group_id: lease.group_id.clone(),
            attempts: lease.attempts,
            outcome,
            error,
        },
    );
    Ok(match outcome {
        FailOutcome::Requeued => "retry",
        other => other.as_str(),
    })
}

fn spawn_heartbeat<T: 'static>(
    queue: Queue<T>,
    lease: JobLease,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                sleep(interval).await;
                match queue.heartbeat(&lease, None).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("lease lost while job was running");
                        break;
                    }
                    Err(err) => tracing::warn!("lease heartbeat failed: {err:#}"),
                }
            }
        }
        .in_current_span(),
    )
}

fn report_error(callback: &Option<ErrorCallback>, error: &WorkerError) {
    if let Some(callback) = callback {
        callback(error);
    }
}

pub(crate) async fn sleep_with_shutdown(shutdown: &Arc<AtomicBool>, duration: Duration) {
    let mut remaining = duration;
    let step = Duration::from_millis(100);
    while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
        let next = if remaining > step { step } else { remaining };
        sleep(next).await;
        remaining = remaining.saturating_sub(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueRequest;
    use crate::test_support::RedisTestContext;
    use serde_json::{Value, json};
    use std::sync::Mutex as StdMutex;

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(50),
            backoff: BackoffPolicy::none(),
            ..WorkerOptions::default()
        }
    }

    fn recording_handler(seen: Arc<Mutex<Vec<(String, i64)>>>) -> Handler<Value> {
        handler_fn(move |job: ReservedJob<Value>| {
            let seen = seen.clone();
            async move {
                let n = job.payload["n"].as_i64().unwrap_or_default();
                seen.lock().await.push((job.group_id.clone(), n));
                sleep(Duration::from_millis(5)).await;
                Ok(())
            }
        })
    }

    async fn run_until_empty(worker: &Worker<Value>) {
        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        assert!(
            worker
                .queue()
                .wait_for_empty(Duration::from_secs(10))
                .await
                .unwrap()
        );
        worker.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn worker_rejects_zero_concurrency() {
        let ctx = RedisTestContext::new().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let result = Worker::new(
            ctx.queue::<Value>(),
            recording_handler(seen),
            fast_options().with_concurrency(0),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn worker_preserves_per_group_order_with_concurrency() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        for n in 0..5 {
            for group in ["g1", "g2", "g3"] {
                queue
                    .add(EnqueueRequest::new(group, json!({ "n": n })).order_ms(1_704_067_200_000 + n))
                    .await
                    .unwrap();
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new(
            queue,
            recording_handler(seen.clone()),
            fast_options().with_concurrency(3),
        )
        .unwrap();
        run_until_empty(&worker).await;

        let seen = seen.lock().await.clone();
        assert_eq!(seen.len(), 15);
        for group in ["g1", "g2", "g3"] {
            let order: Vec<i64> = seen
                .iter()
                .filter(|(g, _)| g == group)
                .map(|(_, n)| *n)
                .collect();
            assert_eq!(order, vec![0, 1, 2, 3, 4], "group {group}");
        }
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn worker_retries_failed_job_before_later_jobs_of_its_group() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        queue
            .add(EnqueueRequest::new("g", json!({"n": 1})).order_ms(1_704_067_200_001))
            .await
            .unwrap();
        queue
            .add(EnqueueRequest::new("g", json!({"n": 2})).order_ms(1_704_067_200_002))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            handler_fn(move |job: ReservedJob<Value>| {
                let seen = seen.clone();
                async move {
                    let n = job.payload["n"].as_i64().unwrap_or_default();
                    seen.lock().await.push((n, job.attempts));
                    if n == 1 && job.attempts == 1 {
                        return Err(JobError::retryable(anyhow::anyhow!("transient")));
                    }
                    Ok(())
                }
            })
        };
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let options = {
            let errors = errors.clone();
            fast_options().with_on_error(move |err| {
                if let WorkerError::Job { outcome, .. } = err {
                    errors.lock().unwrap().push(*outcome);
                }
            })
        };
        let worker = Worker::new(queue, handler, options).unwrap();
        run_until_empty(&worker).await;

        assert_eq!(*seen.lock().await, vec![(1, 1), (1, 2), (2, 1)]);
        assert_eq!(*errors.lock().unwrap(), vec![FailOutcome::Requeued]);
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn fatal_error_dead_letters_without_retry() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        let id = queue
            .add(EnqueueRequest::new("g", json!({})))
            .await
            .unwrap();

        let calls = Arc::new(Mutex::new(0u32));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |_job: ReservedJob<Value>| {
                let calls = calls.clone();
                async move {
                    *calls.lock().await += 1;
                    Err(JobError::fatal(anyhow::anyhow!("malformed order")))
                }
            })
        };
        let worker = Worker::new(queue.clone(), handler, fast_options()).unwrap();
        run_until_empty(&worker).await;

        assert_eq!(*calls.lock().await, 1);
        let dead = queue.dead_jobs(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert!(
            dead[0]
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("malformed order"))
        );
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn handler_panic_is_retried() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        queue
            .add(EnqueueRequest::new("g", json!({})))
            .await
            .unwrap();

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let attempts = attempts.clone();
            handler_fn(move |job: ReservedJob<Value>| {
                let attempts = attempts.clone();
                async move {
                    attempts.lock().await.push(job.attempts);
                    if job.attempts == 1 {
                        panic!("handler bug");
                    }
                    Ok(())
                }
            })
        };
        let worker = Worker::new(queue, handler, fast_options()).unwrap();
        run_until_empty(&worker).await;

        assert_eq!(*attempts.lock().await, vec![1, 2]);
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_handler() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        let id = queue
            .add(EnqueueRequest::new("g", json!({})))
            .await
            .unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let handler = {
            let finished = finished.clone();
            handler_fn(move |_job: ReservedJob<Value>| {
                let finished = finished.clone();
                async move {
                    sleep(Duration::from_millis(300)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let worker = Worker::new(queue.clone(), handler, fast_options()).unwrap();
        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_processing().await {
            assert!(Instant::now() < deadline, "job never started");
            sleep(Duration::from_millis(10)).await;
        }
        let running = worker.running_jobs().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].job_id, id);

        worker.close().await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(!worker.is_processing().await);
        assert!(queue.get_job(&id).await.unwrap().is_none());
        handle.await.unwrap().unwrap();
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let ctx = RedisTestContext::new().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new(ctx.queue::<Value>(), recording_handler(seen), fast_options())
            .unwrap();
        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        sleep(Duration::from_millis(50)).await;

        assert!(worker.run().await.is_err());
        worker.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_returns_after_run_future_is_dropped() {
        let ctx = RedisTestContext::new().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new(ctx.queue::<Value>(), recording_handler(seen), fast_options())
            .unwrap();

        tokio::select! {
            _ = worker.run() => panic!("worker stopped without a shutdown request"),
            _ = sleep(Duration::from_millis(100)) => {}
        }

        tokio::time::timeout(Duration::from_secs(2), worker.close())
            .await
            .expect("close hung after run was dropped")
            .unwrap();
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn worker_can_run_again_after_run_future_is_dropped() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.queue::<Value>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new(queue.clone(), recording_handler(seen.clone()), fast_options())
            .unwrap();

        tokio::select! {
            _ = worker.run() => panic!("worker stopped without a shutdown request"),
            _ = sleep(Duration::from_millis(50)) => {}
        }

        queue
            .add(EnqueueRequest::new("g", json!({"n": 1})))
            .await
            .unwrap();
        run_until_empty(&worker).await;
        assert_eq!(*seen.lock().await, vec![("g".to_string(), 1)]);
        ctx.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn sleep_with_shutdown_returns_early() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let started = Instant::now();
        sleep_with_shutdown(&shutdown, Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
