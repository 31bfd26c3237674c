use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::error;

use crate::db::MessageStore;
use crate::errors::AppError;
use crate::models::{Message, MessageMetadata, MessagePart, MessageRole};

const MESSAGE_COLUMNS: &str = "id, chat_id, parent_id, role, parts, metadata, created_at";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    parent_id: Option<String>,
    role: String,
    parts: Json<Vec<MessagePart>>,
    metadata: Json<MessageMetadata>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = AppError;
    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::try_from(row.role)
            .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
        Ok(Message {
            id: row.id,
            chat_id: row.chat_id,
            parent_id: row.parent_id,
            role,
            parts: row.parts.0,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, AppError> {
    rows.into_iter().map(Message::try_from).collect()
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageRepository {
    async fn insert_message(&self, message: &Message) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO messages (id, chat_id, parent_id, role, parts, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.parent_id)
        .bind(message.role.as_str())
        .bind(Json(&message.parts))
        .bind(Json(&message.metadata))
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save message {}: {e}", message.id);
            AppError::db_query("Failed to save message", e)
        })?;
        Ok(())
    }

    async fn find_message(&self, id: &str) -> Result<Option<Message>, AppError> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find message {id}: {e}");
            AppError::db_query(format!("Failed to find message {id}"), e)
        })?
        .map(Message::try_from)
        .transpose()
    }

    async fn find_messages(&self, chat_id: &str) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = $1
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch messages for conversation {chat_id}: {e}");
            AppError::db_query(format!("Failed to fetch messages for conversation {chat_id}"), e)
        })?;
        into_messages(rows)
    }

    async fn find_children(&self, message_id: &str) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE parent_id = $1
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch children of message {message_id}: {e}");
            AppError::db_query("Failed to fetch message children", e)
        })?;
        into_messages(rows)
    }

    async fn find_latest_message(&self, chat_id: &str) -> Result<Option<Message>, AppError> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = $1
             ORDER BY created_at DESC, seq DESC
             LIMIT 1"
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch latest message for conversation {chat_id}: {e}");
            AppError::db_query("Failed to fetch latest message", e)
        })?
        .map(Message::try_from)
        .transpose()
    }

    async fn has_root(&self, chat_id: &str) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE chat_id = $1 AND parent_id IS NULL)",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to check root for conversation {chat_id}: {e}");
            AppError::db_query("Failed to check conversation root", e)
        })
    }

    async fn find_ancestors(&self, leaf_id: &str, limit: usize) -> Result<Vec<Message>, AppError> {
        // The depth bound keeps a corrupted cycle from recursing forever.
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "WITH RECURSIVE chain AS (
                 SELECT m.*, 1 AS depth FROM messages m WHERE m.id = $1
                 UNION ALL
                 SELECT p.*, c.depth + 1 FROM messages p
                 JOIN chain c ON p.id = c.parent_id
                 WHERE c.depth < $2
             )
             SELECT {MESSAGE_COLUMNS} FROM chain ORDER BY depth ASC"
        ))
        .bind(leaf_id)
        .bind(i32::try_from(limit).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to walk ancestors of message {leaf_id}: {e}");
            AppError::db_query("Failed to walk message ancestors", e)
        })?;
        into_messages(rows)
    }
}
