pub use groupq_config::defaults::{
    DEFAULT_JOB_TIMEOUT_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_NAMESPACE, DEFAULT_REAPER_BATCH_SIZE,
    DEFAULT_RESERVE_SCAN_LIMIT,
};

pub const GROUP_KEY_SEGMENT: &str = "g";
pub const READY_KEY_SEGMENT: &str = "ready";
pub const JOB_KEY_SEGMENT: &str = "job";
pub const SEQUENCE_KEY_SEGMENT: &str = "seq";
pub const PROCESSING_KEY_SEGMENT: &str = "processing";
pub const LOCK_KEY_SEGMENT: &str = "lock";
pub const DELAYED_KEY_SEGMENT: &str = "delayed";
pub const DEAD_KEY_SEGMENT: &str = "dead";

/// 2024-01-01T00:00:00Z. Ordering scores are offsets from this instant.
pub const SCORE_BASE_EPOCH_MS: i64 = 1_704_067_200_000;
/// Slots per millisecond for jobs sharing an order timestamp within a group.
pub const SCORE_TIE_SLOTS: i64 = 1024;
/// Keeps `offset * SCORE_TIE_SLOTS` exactly representable as an f64 score.
pub const MAX_ORDER_OFFSET_MS: i64 = 1 << 43;

pub const DEFAULT_WORKER_ID_PREFIX: &str = "groupq_worker_";
pub const DEFAULT_LOCK_PREFIX: &str = "groupq-singleton";

/// Upper bound on reaper batches per tick so one tick cannot monopolise Redis.
pub const MAX_REAP_BATCHES_PER_TICK: usize = 10;
