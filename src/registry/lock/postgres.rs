use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{Instrument, info_span};

use super::LockManager;
use crate::registry::postgres::classify;
use crate::registry::store::StoreError;

/// Leases stored in the `ticket_locks` table. A row whose `expires_at` has
/// passed is free for the next caller to take over.
#[derive(Clone, Debug)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl PostgresLockManager {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PostgresLockManager {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool, StoreError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let query = r"
            INSERT INTO ticket_locks (lock_key, owner, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 millisecond'))
            ON CONFLICT (lock_key) DO UPDATE
            SET owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE ticket_locks.expires_at <= NOW()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(key)
            .bind(owner)
            .bind(lease_ms)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to acquire ticket lock"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let query = "DELETE FROM ticket_locks WHERE lock_key = $1 AND owner = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to release ticket lock"))?;

        Ok(result.rows_affected() == 1)
    }
}
