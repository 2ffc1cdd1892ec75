use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::constants::DEFAULT_LOCK_PREFIX;

const LOCK_EXTEND_LUA: &str = include_str!("lua/lock_extend.lua");
const LOCK_RELEASE_LUA: &str = include_str!("lua/lock_release.lua");

/// A named, time-bounded mutual exclusion shared between processes.
///
/// Used by cron-style producers so only one process enqueues a recurring job
/// per interval. Every method returns whether this holder owns the lock after
/// the call.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn release(&self, key: &str) -> Result<bool>;
}

/// Redis-backed lock. Each instance carries its own owner token, so two
/// instances in one process contend like two processes would.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    prefix: String,
    token: String,
    extend_script: Script,
    release_script: Script,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_prefix(conn, DEFAULT_LOCK_PREFIX)
    }

    pub fn with_prefix(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            token: Uuid::new_v4().to_string(),
            extend_script: Script::new(LOCK_EXTEND_LUA),
            release_script: Script::new(LOCK_RELEASE_LUA),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lock_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let lock_key = self.lock_key(key);
        let reply: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to acquire lock {lock_key}"))?;
        let acquired = reply.is_some();
        tracing::debug!(lock = %lock_key, acquired, "lock acquire");
        Ok(acquired)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let lock_key = self.lock_key(key);
        let extended: i64 = self
            .extend_script
            .key(&lock_key)
            .arg(&self.token)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to extend lock {lock_key}"))?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let lock_key = self.lock_key(key);
        let released: i64 = self
            .release_script
            .key(&lock_key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to release lock {lock_key}"))?;
        Ok(released == 1)
    }
}
