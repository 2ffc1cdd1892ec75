use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_BASE_RETRY_DELAY_MS, DEFAULT_JOB_TIMEOUT_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_POLL_INTERVAL_MS, DEFAULT_MAX_RETRY_DELAY_MS, DEFAULT_NAMESPACE,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_REAPER_BATCH_SIZE, DEFAULT_REAPER_INTERVAL_MS,
    DEFAULT_REDIS_DSN, DEFAULT_RESERVE_SCAN_LIMIT, DEFAULT_RETRY_JITTER,
    DEFAULT_SHUTDOWN_GRACE_PERIOD_MS, DEFAULT_WORKER_CONCURRENCY,
};

pub(crate) const SETTINGS_FIELDS: [&str; 17] = [
    "redis_dsn",
    "namespace",
    "job_timeout_ms",
    "max_attempts",
    "reserve_scan_limit",
    "worker_concurrency",
    "poll_interval_ms",
    "max_poll_interval_ms",
    "heartbeat_enabled",
    "heartbeat_interval_ms",
    "reaper_enabled",
    "reaper_interval_ms",
    "reaper_batch_size",
    "base_retry_delay_ms",
    "max_retry_delay_ms",
    "retry_jitter",
    "shutdown_grace_period_ms",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct GroupqSettings {
    pub redis_dsn: String,
    pub namespace: String,
    pub job_timeout_ms: i64,
    pub max_attempts: i64,
    pub reserve_scan_limit: usize,
    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: Option<u64>,
    pub reaper_enabled: bool,
    pub reaper_interval_ms: Option<u64>,
    pub reaper_batch_size: usize,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter: f64,
    pub shutdown_grace_period_ms: u64,
}

impl Default for GroupqSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_timeout_ms: DEFAULT_JOB_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reserve_scan_limit: DEFAULT_RESERVE_SCAN_LIMIT,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            heartbeat_enabled: true,
            heartbeat_interval_ms: None,
            reaper_enabled: true,
            reaper_interval_ms: None,
            reaper_batch_size: DEFAULT_REAPER_BATCH_SIZE,
            base_retry_delay_ms: DEFAULT_BASE_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            retry_jitter: DEFAULT_RETRY_JITTER,
            shutdown_grace_period_ms: DEFAULT_SHUTDOWN_GRACE_PERIOD_MS,
        }
    }
}

impl GroupqSettings {
    /// Lease length; never shorter than one millisecond.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms.max(1) as u64)
    }

    /// Explicit interval, otherwise a third of the lease.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        if !self.heartbeat_enabled {
            return None;
        }
        let interval = match self.heartbeat_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.job_timeout() / 3,
        };
        Some(interval.max(Duration::from_millis(1)))
    }

    /// Explicit interval, otherwise half the lease capped at the default tick.
    pub fn reaper_interval(&self) -> Option<Duration> {
        if !self.reaper_enabled {
            return None;
        }
        let interval = match self.reaper_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => (self.job_timeout() / 2).min(Duration::from_millis(DEFAULT_REAPER_INTERVAL_MS)),
        };
        Some(interval.max(Duration::from_millis(1)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms).max(self.poll_interval())
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}
