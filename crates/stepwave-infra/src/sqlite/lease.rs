//! SQLite lease store.
//!
//! One row per held lease in `engine_leases`. Acquisition is a single
//! upsert that only overwrites an expired row, so two workers racing for
//! the same key cannot both succeed.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use stepwave_core::workflow::{LeaseError, LeaseStore};
use stepwave_types::lease::LeaseKey;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `LeaseStore`.
pub struct SqliteLeaseStore {
    pool: DatabasePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn store_err(e: sqlx::Error) -> LeaseError {
    LeaseError::Store(e.to_string())
}

impl LeaseStore for SqliteLeaseStore {
    async fn acquire(&self, key: &LeaseKey, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| LeaseError::Store(e.to_string()))?;
        let expires_at = (now + ttl).to_rfc3339_opts(SecondsFormat::Micros, true);

        let result = sqlx::query(
            r#"INSERT INTO engine_leases (lease_key, expires_at) VALUES (?, ?)
               ON CONFLICT(lease_key) DO UPDATE SET expires_at = excluded.expires_at
               WHERE engine_leases.expires_at <= ?"#,
        )
        .bind(key.to_string())
        .bind(&expires_at)
        .bind(now.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool.writer)
        .await
        .map_err(store_err)?;

        let acquired = result.rows_affected() == 1;
        tracing::trace!(lease = %key, acquired, "lease acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &LeaseKey) -> Result<(), LeaseError> {
        sqlx::query("DELETE FROM engine_leases WHERE lease_key = ?")
            .bind(key.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, LeaseError> {
        let result = sqlx::query("DELETE FROM engine_leases WHERE expires_at <= ?")
            .bind(now_text())
            .execute(&self.pool.writer)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}
