use std::marker::PhantomData;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value;
use tokio::time::sleep;
use tracing::Instrument;

use groupq_config::{GroupqSettings, validate_namespace};

use crate::constants::{DEFAULT_JOB_TIMEOUT_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RESERVE_SCAN_LIMIT};
use crate::job::{JobLease, JobRecord, ReservedJob, new_job_id, now_ms, validate_order_ms};
use crate::store::{EnqueueReceipt, FailOutcome, NewJob, QueueCounts, QueueStore, ReapReport};
use crate::telemetry;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub namespace: String,
    /// Lease length for reserved jobs. Clamped to at least one millisecond.
    pub job_timeout: Duration,
    /// Default attempt budget for jobs added without their own.
    pub max_attempts: i64,
    /// Ready-set candidates examined per reserve before giving up.
    pub reserve_scan_limit: usize,
}

impl QueueOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            job_timeout: Duration::from_millis(DEFAULT_JOB_TIMEOUT_MS as u64),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reserve_scan_limit: DEFAULT_RESERVE_SCAN_LIMIT,
        }
    }

    pub fn from_settings(settings: &GroupqSettings) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            job_timeout: settings.job_timeout(),
            max_attempts: settings.max_attempts,
            reserve_scan_limit: settings.reserve_scan_limit,
        }
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_reserve_scan_limit(mut self, limit: usize) -> Self {
        self.reserve_scan_limit = limit;
        self
    }

    pub(crate) fn lease_ms(&self) -> i64 {
        i64::try_from(self.job_timeout.as_millis())
            .unwrap_or(i64::MAX)
            .max(1)
    }

    fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace)?;
        if self.max_attempts < 1 {
            anyhow::bail!("max_attempts must be at least 1, got {}", self.max_attempts);
        }
        if self.reserve_scan_limit == 0 {
            anyhow::bail!("reserve_scan_limit must be a positive integer");
        }
        Ok(())
    }
}

/// A job to add. `order_ms` defaults to now; `job_id` to a fresh UUID.
#[derive(Debug, Clone)]
pub struct EnqueueRequest<T> {
    pub group_id: String,
    pub payload: T,
    pub order_ms: Option<i64>,
    pub job_id: Option<String>,
    pub max_attempts: Option<i64>,
}

impl<T> EnqueueRequest<T> {
    pub fn new(group_id: impl Into<String>, payload: T) -> Self {
        Self {
            group_id: group_id.into(),
            payload,
            order_ms: None,
            job_id: None,
            max_attempts: None,
        }
    }

    pub fn order_ms(mut self, order_ms: i64) -> Self {
        self.order_ms = Some(order_ms);
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FailOptions {
    /// Return the job to its group if attempts remain. When false the job is
    /// dead-lettered immediately.
    pub retry: bool,
    /// Hold the whole group back this long before the retry becomes eligible.
    pub backoff: Duration,
    pub error: Option<String>,
}

impl Default for FailOptions {
    fn default() -> Self {
        Self {
            retry: true,
            backoff: Duration::ZERO,
            error: None,
        }
    }
}

impl FailOptions {
    pub fn retry() -> Self {
        Self::default()
    }

    pub fn dead() -> Self {
        Self {
            retry: false,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Group-ordered queue over one namespace.
///
/// Jobs of one group are handed out strictly one at a time in `order_ms`
/// order; distinct groups are served in parallel. Delivery is at-least-once:
/// a lease that expires is reclaimed and the job handed out again.
pub struct Queue<T> {
    store: QueueStore,
    options: QueueOptions,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            options: self.options.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> Queue<T> {
    pub fn new(conn: ConnectionManager, options: QueueOptions) -> Result<Self> {
        options.validate()?;
        let store = QueueStore::with_connection(conn, &options.namespace);
        Ok(Self {
            store,
            options,
            _payload: PhantomData,
        })
    }

    pub async fn connect(settings: &GroupqSettings) -> Result<Self> {
        let options = QueueOptions::from_settings(settings);
        options.validate()?;
        let store = QueueStore::connect(&settings.redis_dsn, &options.namespace).await?;
        Ok(Self {
            store,
            options,
            _payload: PhantomData,
        })
    }

    /// Shares `store` and takes the namespace from it.
    pub fn from_store(store: QueueStore, mut options: QueueOptions) -> Self {
        options.namespace = store.keys().namespace().to_string();
        Self {
            store,
            options,
            _payload: PhantomData,
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn namespace(&self) -> &str {
        &self.options.namespace
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.options.lease_ms() as u64)
    }

    /// Finishes a job. Returns false if the lease was no longer held, in which
    /// case nothing changed and the job will be (or was) delivered again.
    pub async fn complete(&self, job: impl Into<JobLease>) -> Result<bool> {
        let lease = job.into();
        let completed = self.store.complete_job(&lease).await?;
        if !completed {
            tracing::warn!(
                job_id = %lease.job_id,
                group_id = %lease.group_id,
                attempt = lease.attempts,
                "complete ignored; lease no longer held"
            );
        }
        Ok(completed)
    }

    pub async fn fail(&self, job: impl Into<JobLease>, options: FailOptions) -> Result<FailOutcome> {
        let lease = job.into();
        let backoff_ms = i64::try_from(options.backoff.as_millis()).unwrap_or(i64::MAX);
        let outcome = self
            .store
            .fail_job(
                &lease,
                options.retry,
                backoff_ms,
                now_ms(),
                options.error.as_deref().unwrap_or_default(),
            )
            .await?;
        if outcome == FailOutcome::LeaseLost {
            tracing::warn!(
                job_id = %lease.job_id,
                group_id = %lease.group_id,
                attempt = lease.attempts,
                "fail ignored; lease no longer held"
            );
        }
        Ok(outcome)
    }

    /// Pushes the lease deadline to `extend` (default: one job timeout) from
    /// now. Returns false if the lease is no longer held.
    pub async fn heartbeat(
        &self,
        job: impl Into<JobLease>,
        extend: Option<Duration>,
    ) -> Result<bool> {
        let lease = job.into();
        let extend_ms = match extend {
            Some(extend) => i64::try_from(extend.as_millis()).unwrap_or(i64::MAX),
            None => self.options.lease_ms(),
        };
        self.store.extend_lease(&lease, now_ms(), extend_ms).await
    }

    /// Reclaims up to `limit` expired leases and promotes groups whose retry
    /// backoff has elapsed.
    pub async fn reap(&self, limit: usize) -> Result<ReapReport> {
        let report = self.store.reap_expired(now_ms(), limit).await?;
        telemetry::record_reap(&report);
        Ok(report)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.store.counts().await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.store.get_job(job_id).await
    }

    pub async fn dead_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let ids = self.store.dead_job_ids(limit).await?;
        self.store.get_jobs(&ids).await
    }

    /// Returns a dead job to its group with a fresh attempt budget.
    pub async fn retry_dead(&self, job_id: &str) -> Result<bool> {
        let retried = self.store.retry_dead_job(job_id).await?;
        if retried {
            tracing::info!(job_id, namespace = %self.namespace(), "dead job requeued");
        }
        Ok(retried)
    }

    /// Waits until nothing is pending or leased. Returns false on timeout.
    pub async fn wait_for_empty(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let counts = self.counts().await?;
            if counts.active == 0 && counts.waiting == 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}

impl<T: Serialize> Queue<T> {
    /// Adds a job and returns its id. Adding an id that already exists is a
    /// no-op that returns the same id.
    pub async fn add(&self, request: EnqueueRequest<T>) -> Result<String> {
        Ok(self.add_detailed(request).await?.job_id)
    }

    pub async fn add_detailed(&self, request: EnqueueRequest<T>) -> Result<EnqueueReceipt> {
        if request.group_id.is_empty() {
            anyhow::bail!("group_id cannot be empty");
        }
        if request.job_id.as_deref() == Some("") {
            anyhow::bail!("job_id cannot be empty");
        }
        let max_attempts = request.max_attempts.unwrap_or(self.options.max_attempts);
        if max_attempts < 1 {
            anyhow::bail!("max_attempts must be at least 1, got {max_attempts}");
        }
        let enqueued_at_ms = now_ms();
        let order_ms = request.order_ms.unwrap_or(enqueued_at_ms);
        validate_order_ms(order_ms)?;

        let payload =
            serde_json::to_string(&request.payload).context("failed to serialize job payload")?;
        let job_id = request.job_id.unwrap_or_else(new_job_id);
        let span = tracing::info_span!(
            "groupq.enqueue",
            "groupq.namespace" = %self.options.namespace,
            "groupq.job_id" = %job_id,
            "groupq.group_id" = %request.group_id,
        );

        let receipt = async {
            let receipt = self
                .store
                .enqueue_job(&NewJob {
                    job_id: &job_id,
                    group_id: &request.group_id,
                    payload: &payload,
                    order_ms,
                    max_attempts,
                    enqueued_at_ms,
                })
                .await?;
            if receipt.created {
                tracing::debug!(seq = receipt.seq, order_ms, "job enqueued");
            } else {
                tracing::debug!("job id already present; enqueue skipped");
            }
            Ok::<_, anyhow::Error>(receipt)
        }
        .instrument(span)
        .await?;

        telemetry::record_enqueue(receipt.created);
        Ok(receipt)
    }
}

impl<T: DeserializeOwned> Queue<T> {
    /// Leases the head job of the oldest ready group, or returns `None` when
    /// no group is ready.
    ///
    /// A payload that cannot be decoded into `T` moves the job to dead and is
    /// reported as an error; the group is released for its next job.
    pub async fn reserve(&self) -> Result<Option<ReservedJob<T>>> {
        let span = tracing::debug_span!(
            "groupq.reserve",
            "groupq.namespace" = %self.options.namespace,
        );
        let Some(raw) = self
            .store
            .reserve_job(
                now_ms(),
                self.options.lease_ms(),
                self.options.reserve_scan_limit,
            )
            .instrument(span.clone())
            .await?
        else {
            return Ok(None);
        };
        span.in_scope(|| {
            tracing::debug!(
                job_id = %raw.id,
                group_id = %raw.group_id,
                attempt = raw.attempts,
                "job reserved"
            )
        });
        telemetry::record_reserved();

        match decode_payload::<T>(&raw.payload) {
            Ok(payload) => Ok(Some(raw.with_payload(payload))),
            Err(err) => {
                let lease = raw.lease();
                let message = format!("payload could not be decoded: {err}");
                self.store
                    .fail_job(&lease, false, 0, now_ms(), &message)
                    .await?;
                tracing::error!(
                    job_id = %lease.job_id,
                    group_id = %lease.group_id,
                    error = %err,
                    "moved job with undecodable payload to dead"
                );
                Err(anyhow::Error::new(err).context(format!(
                    "job {} has an undecodable payload and was moved to dead",
                    lease.job_id
                )))
            }
        }
    }
}

/// Malformed JSON decodes as `null` when `T` accepts it.
fn decode_payload<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    match serde_json::from_str::<T>(raw) {
        Ok(payload) => Ok(payload),
        Err(err) if serde_json::from_str::<IgnoredAny>(raw).is_err() => {
            serde_json::from_value(Value::Null).map_err(|_| err)
        }
        Err(err) => Err(err),
    }
}
