//! Redis fast tier.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::{CacheTier, IdempotencyError, Result};

pub struct RedisCacheTier {
    conn: ConnectionManager,
}

impl RedisCacheTier {
    /// Connect with an auto-reconnecting connection manager.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| IdempotencyError::Cache(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| IdempotencyError::Cache(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheTier for RedisCacheTier {
    async fn set_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::Cache(e.to_string()))?;
        Ok(count > 0)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::Cache(e.to_string()))?;
        Ok(())
    }
}
