//! Key-value cache seam and the advisory chat → leaf pointer built on it.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::AppError;

/// Minimal key-value cache contract (`set` with TTL, `get`, `del`).
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn del(&self, key: &str) -> Result<(), AppError>;
}

/// Advisory `chat → current leaf message` pointer.
///
/// Never authoritative: every reader re-validates the id against the message
/// store, and backend failures degrade to a miss.
#[derive(Clone)]
pub struct LeafCache {
    backend: Arc<dyn KeyValueCache>,
    ttl: Duration,
}

impl LeafCache {
    pub fn new(backend: Arc<dyn KeyValueCache>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn key(chat_id: &str) -> String {
        format!("chat:{chat_id}:leaf")
    }

    pub async fn set(&self, chat_id: &str, message_id: &str) {
        if let Err(e) = self.backend.set(&Self::key(chat_id), message_id, self.ttl).await {
            warn!("Leaf cache write failed for chat {chat_id}: {e}");
        }
    }

    pub async fn get(&self, chat_id: &str) -> Option<String> {
        match self.backend.get(&Self::key(chat_id)).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Leaf cache read failed for chat {chat_id}: {e}");
                None
            }
        }
    }

    pub async fn invalidate(&self, chat_id: &str) {
        debug!("Invalidating leaf pointer for chat {chat_id}");
        if let Err(e) = self.backend.del(&Self::key(chat_id)).await {
            warn!("Leaf cache invalidation failed for chat {chat_id}: {e}");
        }
    }
}
