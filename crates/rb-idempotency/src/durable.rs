//! PostgreSQL durable tier: the `processed_events` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::{IdempotencyError, ProcessedStore, Result};

pub struct PostgresProcessedStore {
    pool: PgPool,
}

impl PostgresProcessedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the processed-events schema.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                idempotency_key CHAR(64) PRIMARY KEY,
                event_type VARCHAR(100) NOT NULL,
                service VARCHAR(50) NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IdempotencyError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_processed_events_processed_at
            ON processed_events (processed_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IdempotencyError::Database(e.to_string()))?;

        info!("Processed-events schema initialized");
        Ok(())
    }
}

#[async_trait]
impl ProcessedStore for PostgresProcessedStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM processed_events WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IdempotencyError::Database(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn insert_ignore(&self, key: &str, event_type: &str, service: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (idempotency_key, event_type, service, processed_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(event_type)
        .bind(service)
        .execute(&self.pool)
        .await
        .map_err(|e| IdempotencyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| IdempotencyError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
