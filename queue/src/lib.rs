pub mod backoff;
pub mod constants;
pub mod error;
pub mod job;
pub mod keys;
pub mod lock;
pub mod queue;
pub mod reaper;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backoff::BackoffPolicy;
pub use error::{JobError, WorkerError};
pub use groupq_config::{GroupqSettings, load_toml_settings, resolve_config_source};
pub use job::{JobLease, JobRecord, JobState, ReservedJob};
pub use keys::QueueKeys;
pub use lock::{DistributedLock, RedisLock};
pub use queue::{EnqueueRequest, FailOptions, Queue, QueueOptions};
pub use reaper::LeaseReaper;
pub use shutdown::{
    DrainableQueue, GracefulShutdown, GracefulShutdownOptions, ShutdownReport, StoppableWorker,
    WorkerStatus, WorkersStatus, wait_for_signal,
};
pub use store::{
    EnqueueReceipt, FailOutcome, QueueCounts, QueueStore, ReapReport, open_connection,
};
pub use worker::{Handler, RunningJobInfo, Worker, WorkerOptions, handler_fn};
