//! Two-tier idempotency store: a TTL-keyed fast cache in front of a durable
//! processed-events table.
//!
//! The fast tier is a performance optimization only. Correctness rests on
//! the durable tier: cache failures degrade to durable lookups, and the
//! advisory processing lock is crash-safe because it expires on its own.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub mod cache;
pub mod durable;
pub mod memory;

pub use cache::RedisCacheTier;
pub use durable::PostgresProcessedStore;
pub use memory::{InMemoryCacheTier, InMemoryProcessedStore};

pub type Result<T> = std::result::Result<T, IdempotencyError>;

#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error("cache tier error: {0}")]
    Cache(String),

    #[error("durable tier error: {0}")]
    Database(String),
}

/// Fast tier: TTL-keyed existence flags
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn set_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Durable tier: the processed-events table
#[async_trait]
pub trait ProcessedStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Insert-or-ignore: a duplicate primary key is not an error
    async fn insert_ignore(&self, key: &str, event_type: &str, service: &str) -> Result<()>;

    /// Returns the number of rows deleted
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// TTL defaults (seconds)
pub const DEFAULT_PROCESSING_TTL_SECS: u64 = 300;
pub const DEFAULT_PROCESSED_TTL_SECS: u64 = 604_800;

pub struct IdempotencyStore {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn ProcessedStore>,
    processing_ttl_secs: u64,
    processed_ttl_secs: u64,
}

impl IdempotencyStore {
    pub fn new(cache: Arc<dyn CacheTier>, durable: Arc<dyn ProcessedStore>) -> Self {
        Self {
            cache,
            durable,
            processing_ttl_secs: DEFAULT_PROCESSING_TTL_SECS,
            processed_ttl_secs: DEFAULT_PROCESSED_TTL_SECS,
        }
    }

    pub fn with_ttls(mut self, processing_ttl_secs: u64, processed_ttl_secs: u64) -> Self {
        self.processing_ttl_secs = processing_ttl_secs;
        self.processed_ttl_secs = processed_ttl_secs;
        self
    }

    fn processing_key(key: &str) -> String {
        format!("processing:{key}")
    }

    fn processed_key(key: &str) -> String {
        format!("processed:{key}")
    }

    /// True when the key is committed in either tier. A cache failure falls
    /// through to the durable tier.
    pub async fn is_processed(&self, key: &str) -> Result<bool> {
        match self.cache.exists(&Self::processed_key(key)).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Cache tier unavailable, using durable tier only");
            }
        }
        self.durable.exists(key).await
    }

    /// Mark the key in-progress with the processing TTL. Advisory only: a
    /// failure is logged and the message still dispatches, with the durable
    /// tier serializing duplicate commits.
    pub async fn claim(&self, key: &str) {
        if let Err(e) = self
            .cache
            .set_with_ttl(&Self::processing_key(key), self.processing_ttl_secs)
            .await
        {
            warn!(error = %e, "Failed to set processing claim");
        } else {
            debug!(key = %key, "Processing claim set");
        }
    }

    /// Record the key as permanently processed. The durable insert is the
    /// correctness operation and runs first; cache updates are best-effort.
    pub async fn commit(&self, key: &str, event_type: &str, service: &str) -> Result<()> {
        self.durable.insert_ignore(key, event_type, service).await?;

        if let Err(e) = self.cache.delete(&Self::processing_key(key)).await {
            warn!(error = %e, "Failed to clear processing claim");
        }
        if let Err(e) = self
            .cache
            .set_with_ttl(&Self::processed_key(key), self.processed_ttl_secs)
            .await
        {
            warn!(error = %e, "Failed to set processed cache entry");
        }

        debug!(key = %key, event_type = %event_type, "Idempotency key committed");
        Ok(())
    }

    /// Drop the processing claim after a dispatch failure so redelivery is
    /// not blocked by the advisory lock.
    pub async fn release(&self, key: &str) {
        if let Err(e) = self.cache.delete(&Self::processing_key(key)).await {
            warn!(error = %e, "Failed to release processing claim");
        }
    }

    /// Purge durable rows older than the retention window.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let deleted = self.durable.delete_older_than(cutoff).await?;
        debug!(retention_days = retention_days, deleted = deleted, "Processed-events cleanup");
        Ok(deleted)
    }
}
