//! Lease storage in the shared database.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{Lease, LeaseConfig, LockProvider, LockResult, millis, now_millis};

/// Leases stored in the `locks` table. Replicas sharing the database
/// coordinate through it.
#[derive(Debug, Clone)]
pub struct SqliteLockProvider {
    pool: SqlitePool,
}

impl SqliteLockProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockProvider for SqliteLockProvider {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        config: &LeaseConfig,
    ) -> LockResult<Option<Lease>> {
        let now = now_millis();
        let lock_until = now.saturating_add(millis(config.lock_at_most_for));

        // Inserts a fresh row or takes over an expired one in one statement.
        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, lock_until, locked_at, locked_by)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                lock_until = excluded.lock_until,
                locked_at = excluded.locked_at,
                locked_by = excluded.locked_by
            WHERE locks.lock_until <= ?
            "#,
        )
        .bind(name)
        .bind(lock_until)
        .bind(now)
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Lease {
            name: name.to_string(),
            locked_by: owner.to_string(),
            locked_at: now,
            lock_until,
            lock_at_least_for: config.lock_at_least_for,
        }))
    }

    async fn release(&self, lease: &Lease) -> LockResult<()> {
        sqlx::query(
            r#"
            UPDATE locks SET lock_until = ?
            WHERE name = ? AND locked_by = ? AND locked_at = ?
            "#,
        )
        .bind(lease.release_until(now_millis()))
        .bind(&lease.name)
        .bind(&lease.locked_by)
        .bind(lease.locked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
