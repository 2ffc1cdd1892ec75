use std::collections::HashMap;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;
use serde::Serialize;

use groupq_config::validate_namespace;

use crate::constants::{SCORE_BASE_EPOCH_MS, SCORE_TIE_SLOTS};
use crate::job::{JobLease, JobRecord, RawReservation};
use crate::keys::QueueKeys;

const ENQUEUE_LUA: &str = concat!(
    include_str!("lua/prelude.lua"),
    include_str!("lua/enqueue.lua")
);
const RESERVE_LUA: &str = concat!(
    include_str!("lua/prelude.lua"),
    include_str!("lua/reserve.lua")
);
const COMPLETE_LUA: &str = concat!(
    include_str!("lua/prelude.lua"),
    include_str!("lua/complete.lua")
);
const FAIL_LUA: &str = concat!(include_str!("lua/prelude.lua"), include_str!("lua/fail.lua"));
const HEARTBEAT_LUA: &str = concat!(
    include_str!("lua/prelude.lua"),
    include_str!("lua/heartbeat.lua")
);
const REAP_LUA: &str = concat!(include_str!("lua/prelude.lua"), include_str!("lua/reap.lua"));
const RETRY_DEAD_LUA: &str = concat!(
    include_str!("lua/prelude.lua"),
    include_str!("lua/retry_dead.lua")
);

const SCAN_COUNT: usize = 200;

fn summarize_redis_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);

    if scheme.is_empty() {
        host.to_string()
    } else if host.is_empty() {
        format!("{scheme}://")
    } else {
        format!("{scheme}://{host}")
    }
}

fn redis_connect_context(dsn: &str, err: &redis::RedisError) -> String {
    let summary = summarize_redis_dsn(dsn);
    let mut context = if summary.is_empty() {
        "failed to connect to Redis".to_string()
    } else {
        format!("failed to connect to Redis ({summary})")
    };

    let message = err.to_string().to_ascii_lowercase();
    if message.contains("tls handshake") && !dsn.starts_with("rediss://") {
        context.push_str("; TLS handshake failed - if Redis requires TLS, use rediss:// for the DSN");
    }

    context
}

/// Arguments for a single enqueue.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub job_id: &'a str,
    pub group_id: &'a str,
    pub payload: &'a str,
    pub order_ms: i64,
    pub max_attempts: i64,
    pub enqueued_at_ms: i64,
}

/// Result of an enqueue. `created` is false when the job id already existed,
/// in which case `seq` and `score` describe the existing job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub job_id: String,
    pub created: bool,
    pub seq: i64,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Returned to its group at its original position.
    Requeued,
    /// Attempts exhausted or retry declined; the job sits in the dead set.
    Dead,
    /// The lease had already expired or moved to another attempt.
    LeaseLost,
}

impl FailOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailOutcome::Requeued => "requeued",
            FailOutcome::Dead => "dead",
            FailOutcome::LeaseLost => "lease_lost",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub reclaimed: u64,
    pub dead: u64,
    pub promoted: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed == 0 && self.dead == 0 && self.promoted == 0
    }

    pub fn absorb(&mut self, other: ReapReport) {
        self.reclaimed += other.reclaimed;
        self.dead += other.dead;
        self.promoted += other.promoted;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Jobs currently leased.
    pub active: u64,
    /// Jobs pending across all groups, including groups in backoff.
    pub waiting: u64,
    pub ready_groups: u64,
    pub delayed_groups: u64,
    pub dead: u64,
    /// Groups with at least one pending job.
    pub groups: u64,
}

/// Redis adapter for one namespace. Every state transition is a single Lua
/// script so concurrent producers, workers and reapers never observe a
/// half-applied change.
#[derive(Clone)]
pub struct QueueStore {
    conn: ConnectionManager,
    keys: QueueKeys,
    enqueue_script: Script,
    reserve_script: Script,
    complete_script: Script,
    fail_script: Script,
    heartbeat_script: Script,
    reap_script: Script,
    retry_dead_script: Script,
}

impl QueueStore {
    pub async fn connect(redis_dsn: &str, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        let conn = open_connection(redis_dsn).await?;
        Ok(Self::with_connection(conn, namespace))
    }

    pub fn with_connection(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            keys: QueueKeys::new(namespace),
            enqueue_script: Script::new(ENQUEUE_LUA),
            reserve_script: Script::new(RESERVE_LUA),
            complete_script: Script::new(COMPLETE_LUA),
            fail_script: Script::new(FAIL_LUA),
            heartbeat_script: Script::new(HEARTBEAT_LUA),
            reap_script: Script::new(REAP_LUA),
            retry_dead_script: Script::new(RETRY_DEAD_LUA),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn enqueue_job(&self, job: &NewJob<'_>) -> Result<EnqueueReceipt> {
        let mut conn = self.conn.clone();
        let (created, seq, score): (i64, i64, i64) = self
            .enqueue_script
            .key(self.keys.job(job.job_id))
            .key(self.keys.group(job.group_id))
            .key(self.keys.ready())
            .key(self.keys.sequence())
            .key(self.keys.delayed())
            .arg(self.keys.namespace())
            .arg(job.job_id)
            .arg(job.group_id)
            .arg(job.payload)
            .arg(job.order_ms)
            .arg(job.max_attempts)
            .arg(job.enqueued_at_ms)
            .arg(SCORE_TIE_SLOTS)
            .arg(SCORE_BASE_EPOCH_MS)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to enqueue job {}", job.job_id))?;
        Ok(EnqueueReceipt {
            job_id: job.job_id.to_string(),
            created: created == 1,
            seq,
            score,
        })
    }

    pub(crate) async fn reserve_job(
        &self,
        now_ms: i64,
        lease_ms: i64,
        scan_limit: usize,
    ) -> Result<Option<RawReservation>> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<Option<String>>> = self
            .reserve_script
            .key(self.keys.ready())
            .key(self.keys.processing())
            .key(self.keys.delayed())
            .arg(self.keys.namespace())
            .arg(now_ms)
            .arg(lease_ms.max(1))
            .arg(scan_limit.max(1))
            .invoke_async(&mut conn)
            .await
            .context("failed to reserve job")?;
        reply.map(RawReservation::from_reply).transpose()
    }

    pub async fn complete_job(&self, lease: &JobLease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let completed: i64 = self
            .complete_script
            .key(self.keys.ready())
            .key(self.keys.processing())
            .key(self.keys.delayed())
            .arg(self.keys.namespace())
            .arg(&lease.job_id)
            .arg(lease.attempts)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to complete job {}", lease.job_id))?;
        Ok(completed == 1)
    }

    pub async fn fail_job(
        &self,
        lease: &JobLease,
        retry: bool,
        backoff_ms: i64,
        now_ms: i64,
        error: &str,
    ) -> Result<FailOutcome> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .fail_script
            .key(self.keys.ready())
            .key(self.keys.processing())
            .key(self.keys.delayed())
            .key(self.keys.dead())
            .arg(self.keys.namespace())
            .arg(&lease.job_id)
            .arg(lease.attempts)
            .arg(if retry { "1" } else { "0" })
            .arg(backoff_ms.max(0))
            .arg(now_ms)
            .arg(error)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to record failure of job {}", lease.job_id))?;
        Ok(match outcome {
            1 => FailOutcome::Requeued,
            0 => FailOutcome::Dead,
            _ => FailOutcome::LeaseLost,
        })
    }

    pub async fn extend_lease(&self, lease: &JobLease, now_ms: i64, extend_ms: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .heartbeat_script
            .key(self.keys.processing())
            .arg(self.keys.namespace())
            .arg(&lease.job_id)
            .arg(lease.attempts)
            .arg(now_ms)
            .arg(extend_ms.max(1))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to extend lease of job {}", lease.job_id))?;
        Ok(extended == 1)
    }

    pub async fn reap_expired(&self, now_ms: i64, limit: usize) -> Result<ReapReport> {
        let mut conn = self.conn.clone();
        let (reclaimed, dead, promoted): (u64, u64, u64) = self
            .reap_script
            .key(self.keys.ready())
            .key(self.keys.processing())
            .key(self.keys.delayed())
            .key(self.keys.dead())
            .arg(self.keys.namespace())
            .arg(now_ms)
            .arg(limit.max(1))
            .invoke_async(&mut conn)
            .await
            .context("failed to reap expired leases")?;
        Ok(ReapReport {
            reclaimed,
            dead,
            promoted,
        })
    }

    pub async fn retry_dead_job(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let retried: i64 = self
            .retry_dead_script
            .key(self.keys.ready())
            .key(self.keys.delayed())
            .key(self.keys.dead())
            .arg(self.keys.namespace())
            .arg(job_id)
            .arg(SCORE_TIE_SLOTS)
            .arg(SCORE_BASE_EPOCH_MS)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to retry dead job {job_id}"))?;
        Ok(retried == 1)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        JobRecord::from_hash(&map).map(Some)
    }

    pub async fn get_jobs(&self, job_ids: &[String]) -> Result<Vec<JobRecord>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for job_id in job_ids {
            pipe.hgetall(self.keys.job(job_id));
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        maps.iter()
            .filter(|map| !map.is_empty())
            .map(JobRecord::from_hash)
            .collect()
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.conn.clone();
        let (active, ready_groups, delayed_groups, dead): (u64, u64, u64, u64) = redis::pipe()
            .zcard(self.keys.processing())
            .zcard(self.keys.ready())
            .zcard(self.keys.delayed())
            .zcard(self.keys.dead())
            .query_async(&mut conn)
            .await?;

        let group_keys = self.scan_keys_by_pattern(&self.keys.group_pattern()).await?;
        let mut waiting = 0u64;
        let mut groups = 0u64;
        for chunk in group_keys.chunks(SCAN_COUNT) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.zcard(key);
            }
            let sizes: Vec<u64> = pipe.query_async(&mut conn).await?;
            for size in sizes {
                waiting += size;
                if size > 0 {
                    groups += 1;
                }
            }
        }

        Ok(QueueCounts {
            active,
            waiting,
            ready_groups,
            delayed_groups,
            dead,
            groups,
        })
    }

    pub async fn scan_group_ids(&self) -> Result<Vec<String>> {
        let keys = self.scan_keys_by_pattern(&self.keys.group_pattern()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.group_id_from_key(key))
            .map(str::to_string)
            .collect())
    }

    /// Ready groups in dispatch order with their head scores.
    pub async fn ready_groups(&self, limit: usize) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let stop = limit.max(1) as isize - 1;
        Ok(conn.zrange_withscores(self.keys.ready(), 0, stop).await?)
    }

    pub async fn group_jobs(&self, group_id: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let stop = limit.max(1) as isize - 1;
        Ok(conn
            .zrange_withscores(self.keys.group(group_id), 0, stop)
            .await?)
    }

    pub async fn group_len(&self, group_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(self.keys.group(group_id)).await?)
    }

    pub async fn group_lease_holder(&self, group_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.keys.lock(group_id)).await?)
    }

    /// Leased job ids ordered by lease deadline.
    pub async fn active_job_ids(&self, limit: usize) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let stop = limit.max(1) as isize - 1;
        Ok(conn
            .zrange_withscores(self.keys.processing(), 0, stop)
            .await?)
    }

    /// Dead job ids, most recent first.
    pub async fn dead_job_ids(&self, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let stop = limit.max(1) as isize - 1;
        Ok(conn.zrevrange(self.keys.dead(), 0, stop).await?)
    }

    pub async fn scan_keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Deletes every key of the namespace. Returns the number of keys removed.
    pub async fn delete_namespace(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let keys = self
            .scan_keys_by_pattern(&self.keys.namespace_pattern())
            .await?;
        for chunk in keys.chunks(SCAN_COUNT) {
            let _: i64 = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
        }
        Ok(keys.len())
    }
}

pub async fn open_connection(redis_dsn: &str) -> Result<ConnectionManager> {
    let client =
        redis::Client::open(redis_dsn).with_context(|| "failed to create Redis client")?;
    ConnectionManager::new(client).await.map_err(|err| {
        let context = redis_connect_context(redis_dsn, &err);
        anyhow::Error::new(err).context(context)
    })
}
