pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";
pub const DEFAULT_NAMESPACE: &str = "groupq";

pub const DEFAULT_JOB_TIMEOUT_MS: i64 = 30_000;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
pub const DEFAULT_RESERVE_SCAN_LIMIT: usize = 20;

pub const DEFAULT_WORKER_CONCURRENCY: usize = 1;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_REAPER_BATCH_SIZE: usize = 100;
pub const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RETRY_JITTER: f64 = 0.25;
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_MS: u64 = 30_000;
