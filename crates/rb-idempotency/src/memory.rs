//! In-memory tiers for tests and dev mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{CacheTier, ProcessedStore, Result};

pub struct InMemoryCacheTier {
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryCacheTier {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Non-expired key check, for test assertions.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|expires| *expires > Instant::now())
    }
}

impl Default for InMemoryCacheTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheTier for InMemoryCacheTier {
    async fn set_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedRow {
    pub event_type: String,
    pub service: String,
    pub processed_at: DateTime<Utc>,
}

pub struct InMemoryProcessedStore {
    rows: Mutex<HashMap<String, ProcessedRow>>,
}

impl InMemoryProcessedStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, key: &str) -> Option<ProcessedRow> {
        self.rows.lock().get(key).cloned()
    }

    /// Seed a row with an explicit timestamp, for retention tests.
    pub fn insert_backdated(
        &self,
        key: &str,
        event_type: &str,
        service: &str,
        processed_at: DateTime<Utc>,
    ) {
        self.rows.lock().insert(
            key.to_string(),
            ProcessedRow {
                event_type: event_type.to_string(),
                service: service.to_string(),
                processed_at,
            },
        );
    }
}

impl Default for InMemoryProcessedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessedStore for InMemoryProcessedStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.rows.lock().contains_key(key))
    }

    async fn insert_ignore(&self, key: &str, event_type: &str, service: &str) -> Result<()> {
        self.rows
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| ProcessedRow {
                event_type: event_type.to_string(),
                service: service.to_string(),
                processed_at: Utc::now(),
            });
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| row.processed_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}
