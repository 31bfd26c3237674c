use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::error;

use crate::db::ConversationStore;
use crate::errors::AppError;
use crate::models::{Conversation, ConversationMode, ConversationSettings};

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    mode: String,
    settings: Json<ConversationSettings>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = AppError;
    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        let mode = ConversationMode::try_from(row.mode)
            .map_err(|e| AppError::Unexpected(format!("Bad conversation row {}: {e}", row.id)))?;
        Ok(Conversation {
            id: row.id,
            user_id: row.user_id,
            mode,
            settings: row.settings.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationRepository {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO conversations (id, user_id, mode, settings, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(conversation.mode.as_str())
        .bind(Json(&conversation.settings))
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save conversation {}: {e}", conversation.id);
            AppError::db_query("Failed to save conversation", e)
        })?;
        Ok(())
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_id, mode, settings, created_at, updated_at
             FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find conversation {id}: {e}");
            AppError::db_query(format!("Failed to find conversation {id}"), e)
        })?
        .map(Conversation::try_from)
        .transpose()
    }

    async fn find_conversations_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, AppError> {
        sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_id, mode, settings, created_at, updated_at
             FROM conversations WHERE user_id = $1 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch conversations for {user_id}: {e}");
            AppError::db_query("Failed to fetch conversations", e)
        })?
        .into_iter()
        .map(Conversation::try_from)
        .collect()
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update conversation timestamp {id}: {e}");
                AppError::db_query("Failed to update conversation", e)
            })?;
        Ok(())
    }
}
