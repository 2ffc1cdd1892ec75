use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use groupq_config::GroupqSettings;

use crate::queue::{Queue, QueueOptions};
use crate::store::QueueStore;

pub const TEST_REDIS_DSN_ENV: &str = "GROUPQ_TEST_REDIS_DSN";

/// Each context owns a fresh namespace, so tests can share one Redis database
/// and run concurrently.
pub struct RedisTestContext {
    pub settings: GroupqSettings,
    pub store: QueueStore,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let redis_dsn = std::env::var(TEST_REDIS_DSN_ENV)
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        let settings = GroupqSettings {
            redis_dsn,
            namespace: format!("groupq-test-{}", Uuid::new_v4()),
            ..Default::default()
        };
        let store = QueueStore::connect(&settings.redis_dsn, &settings.namespace).await?;
        Ok(Self { settings, store })
    }

    pub fn queue<T>(&self) -> Queue<T> {
        Queue::from_store(self.store.clone(), QueueOptions::from_settings(&self.settings))
    }

    pub fn queue_with_timeout<T>(&self, job_timeout: Duration) -> Queue<T> {
        Queue::from_store(
            self.store.clone(),
            QueueOptions::from_settings(&self.settings).with_job_timeout(job_timeout),
        )
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.store.delete_namespace().await?;
        Ok(())
    }
}
