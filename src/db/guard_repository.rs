use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;
use tracing::error;

use crate::db::{GuardStore, WindowDecision};
use crate::errors::AppError;

/// Rate windows in `rate_limit_events`, job slots in `job_slots`.
#[derive(Clone)]
pub struct PgGuardRepository {
    pool: PgPool,
}

impl PgGuardRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GuardStore for PgGuardRepository {
    async fn consume_window(
        &self,
        key: &str,
        limit: u32,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::db_query("Failed to open rate limit transaction", e))?;

        // Serializes concurrent hits on the same key for the rest of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::db_query("Failed to lock rate limit key", e))?;

        let used: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limit_events WHERE key = $1 AND created_at > $2",
        )
        .bind(key)
        .bind(now - window)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::db_query("Failed to count rate limit events", e))?;

        let used = u32::try_from(used).unwrap_or(u32::MAX);
        if used >= limit {
            tx.rollback()
                .await
                .map_err(|e| AppError::db_query("Failed to release rate limit lock", e))?;
            return Ok(WindowDecision { allowed: false, remaining: 0 });
        }

        sqlx::query("INSERT INTO rate_limit_events (key, created_at) VALUES ($1, $2)")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::db_query("Failed to record rate limit event", e))?;
        tx.commit()
            .await
            .map_err(|e| AppError::db_query("Failed to commit rate limit event", e))?;

        Ok(WindowDecision { allowed: true, remaining: limit - used - 1 })
    }

    async fn restore_window(&self, key: &str) -> Result<(), AppError> {
        sqlx::query(
            "DELETE FROM rate_limit_events WHERE id = (
                 SELECT id FROM rate_limit_events WHERE key = $1
                 ORDER BY created_at DESC, id DESC LIMIT 1
             )",
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to restore rate limit for {key}: {e}");
            AppError::db_query("Failed to restore rate limit", e)
        })?;
        Ok(())
    }

    async fn try_acquire_job_slot(
        &self,
        user_id: &str,
        max_in_flight: u32,
    ) -> Result<bool, AppError> {
        sqlx::query("INSERT INTO job_slots (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::db_query("Failed to create job slot row", e))?;

        let result = sqlx::query(
            "UPDATE job_slots SET in_flight = in_flight + 1
             WHERE user_id = $1 AND in_flight < $2",
        )
        .bind(user_id)
        .bind(i32::try_from(max_in_flight).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db_query("Failed to acquire job slot", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_job_slot(&self, user_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE job_slots SET in_flight = GREATEST(in_flight - 1, 0) WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to release job slot for {user_id}: {e}");
            AppError::db_query("Failed to release job slot", e)
        })?;
        Ok(())
    }
}
