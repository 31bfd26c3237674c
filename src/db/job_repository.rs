use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::error;

use crate::db::JobStore;
use crate::errors::AppError;
use crate::models::{ImageJobSettings, JobRecord, JobStatus, Reservation};

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    turn_id: String,
    chat_id: String,
    user_id: String,
    status: String,
    cost: i64,
    tokens_from_free: i64,
    tokens_from_purchased: i64,
    settings: Json<ImageJobSettings>,
    artifact_url: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = AppError;
    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::try_from(row.status).map_err(AppError::Unexpected)?;
        Ok(JobRecord {
            id: row.id,
            turn_id: row.turn_id,
            chat_id: row.chat_id,
            user_id: row.user_id,
            status,
            cost: row.cost,
            reservation: Reservation {
                tokens_from_free: row.tokens_from_free,
                tokens_from_purchased: row.tokens_from_purchased,
            },
            settings: row.settings.0,
            artifact_url: row.artifact_url,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_status(
        &self,
        id: &str,
        query: &'static str,
        binds: (&str, Option<&str>, Option<DateTime<Utc>>),
    ) -> Result<(), AppError> {
        let (status, text, at) = binds;
        let result = sqlx::query(query)
            .bind(id)
            .bind(status)
            .bind(text)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to move image job {id} to {status}: {e}");
                AppError::db_query("Failed to update image job", e)
            })?;
        if result.rows_affected() == 0 {
            return Err(AppError::RecordNotFound { entity_type: "image_job".into(), id: id.into() });
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobRepository {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO image_jobs
                 (id, turn_id, chat_id, user_id, status, cost, tokens_from_free,
                  tokens_from_purchased, settings, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&job.id)
        .bind(&job.turn_id)
        .bind(&job.chat_id)
        .bind(&job.user_id)
        .bind(job.status.as_str())
        .bind(job.cost)
        .bind(job.reservation.tokens_from_free)
        .bind(job.reservation.tokens_from_purchased)
        .bind(Json(&job.settings))
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save image job {}: {e}", job.id);
            AppError::db_query("Failed to save image job", e)
        })?;
        Ok(())
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobRecord>, AppError> {
        sqlx::query_as::<_, JobRow>(
            "SELECT id, turn_id, chat_id, user_id, status, cost, tokens_from_free,
                    tokens_from_purchased, settings, artifact_url, error, created_at, completed_at
             FROM image_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::db_query(format!("Failed to find image job {id}"), e))?
        .map(JobRecord::try_from)
        .transpose()
    }

    async fn mark_processing(&self, id: &str) -> Result<(), AppError> {
        self.set_status(
            id,
            "UPDATE image_jobs SET status = $2, error = $3, completed_at = $4
             WHERE id = $1 AND status = 'pending'",
            (JobStatus::Processing.as_str(), None, None),
        )
        .await
    }

    async fn mark_success(
        &self,
        id: &str,
        artifact_url: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.set_status(
            id,
            "UPDATE image_jobs SET status = $2, artifact_url = $3, completed_at = $4
             WHERE id = $1 AND status = 'processing'",
            (JobStatus::Success.as_str(), Some(artifact_url), Some(at)),
        )
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        self.set_status(
            id,
            "UPDATE image_jobs SET status = $2, error = $3, completed_at = $4
             WHERE id = $1 AND status IN ('pending', 'processing')",
            (JobStatus::Fail.as_str(), Some(error), Some(at)),
        )
        .await
    }
}
