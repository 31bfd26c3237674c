use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cache::LeafCache;
use crate::db::{ConversationStore, MessageStore};
use crate::errors::AppError;
use crate::models::{
    Conversation, ConversationMode, ConversationSettings, Message, MessageMetadata, MessagePart,
    MessageRole,
};

const MAX_SYSTEM_PROMPT_LENGTH: usize = 8000;

/// Branchable message tree of every conversation, plus the advisory leaf pointer.
#[derive(Clone)]
pub struct MessageTree {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    leaf_cache: LeafCache,
}

impl MessageTree {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        leaf_cache: LeafCache,
    ) -> Self {
        Self { conversations, messages, leaf_cache }
    }

    pub async fn create_conversation(
        &self,
        user_id: &str,
        mode: ConversationMode,
        settings: ConversationSettings,
    ) -> Result<Conversation, AppError> {
        if user_id.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "user_id".into() });
        }
        if let Some(prompt) = &settings.system_prompt {
            if prompt.chars().count() > MAX_SYSTEM_PROMPT_LENGTH {
                return Err(AppError::FieldTooLong {
                    field_name: "system_prompt".into(),
                    max_length: MAX_SYSTEM_PROMPT_LENGTH,
                    actual_length: prompt.chars().count(),
                });
            }
        }

        let conversation = Conversation::new(user_id.to_string(), mode, settings);
        self.conversations.insert_conversation(&conversation).await?;
        info!("Created {} conversation {} for {user_id}", mode.as_str(), conversation.id);
        Ok(conversation)
    }

    pub async fn conversation(&self, chat_id: &str) -> Result<Conversation, AppError> {
        self.conversations
            .find_conversation(chat_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound { id: chat_id.to_string() })
    }

    /// Loads a conversation and checks that `user_id` owns it.
    pub async fn owned_conversation(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Conversation, AppError> {
        let conversation = self.conversation(chat_id).await?;
        if conversation.user_id != user_id {
            warn!("User {user_id} attempted to access conversation {chat_id}");
            return Err(AppError::Forbidden { id: chat_id.to_string() });
        }
        Ok(conversation)
    }

    pub async fn conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, AppError> {
        self.conversations.find_conversations_by_user(user_id).await
    }

    /// Every message of the chat, all branches, in creation order.
    pub async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, AppError> {
        self.conversation(chat_id).await?;
        self.messages.find_messages(chat_id).await
    }

    /// Direct replies to `message_id`: the branches hanging off it.
    pub async fn children(&self, chat_id: &str, message_id: &str) -> Result<Vec<Message>, AppError> {
        self.message(chat_id, message_id).await?;
        self.messages.find_children(message_id).await
    }

    pub async fn message(&self, chat_id: &str, message_id: &str) -> Result<Message, AppError> {
        match self.messages.find_message(message_id).await? {
            Some(m) if m.chat_id == chat_id => Ok(m),
            _ => Err(AppError::MessageNotFound {
                id: message_id.to_string(),
                chat_id: chat_id.to_string(),
            }),
        }
    }

    pub async fn append_message(
        &self,
        chat_id: &str,
        parent_id: Option<&str>,
        role: MessageRole,
        parts: Vec<MessagePart>,
        metadata: MessageMetadata,
    ) -> Result<Message, AppError> {
        self.conversation(chat_id).await?;
        match parent_id {
            Some(parent) => {
                self.message(chat_id, parent).await?;
            }
            None => {
                if self.messages.has_root(chat_id).await? {
                    return Err(AppError::integrity(chat_id, "conversation already has a root"));
                }
            }
        }

        let mut message =
            Message::new(chat_id.to_string(), parent_id.map(str::to_string), role, parts);
        message.metadata = metadata;
        self.messages.insert_message(&message).await?;
        debug!("Appended {} message {} to chat {chat_id}", role, message.id);
        Ok(message)
    }

    /// Root-first chain of at most `limit` messages ending at `leaf_id`.
    ///
    /// A repeated id, a node from another chat or a parent that does not exist
    /// are integrity errors.
    pub async fn resolve_ancestor_chain(
        &self,
        chat_id: &str,
        leaf_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut chain = self.messages.find_ancestors(leaf_id, limit).await?;
        if chain.is_empty() {
            return Err(AppError::MessageNotFound {
                id: leaf_id.to_string(),
                chat_id: chat_id.to_string(),
            });
        }

        let mut seen = HashSet::with_capacity(chain.len());
        let mut expected: Option<&str> = Some(leaf_id);
        for message in &chain {
            if message.chat_id != chat_id {
                error!("Message {} in chain of chat {chat_id} belongs to {}", message.id, message.chat_id);
                return Err(AppError::integrity(
                    chat_id,
                    format!("message {} belongs to another conversation", message.id),
                ));
            }
            if !seen.insert(message.id.as_str()) {
                error!("Cycle detected in chat {chat_id} at message {}", message.id);
                return Err(AppError::integrity(
                    chat_id,
                    format!("cycle through message {}", message.id),
                ));
            }
            if expected != Some(message.id.as_str()) {
                return Err(AppError::integrity(
                    chat_id,
                    format!("broken parent link at message {}", message.id),
                ));
            }
            expected = message.parent_id.as_deref();
        }
        if let Some(missing) = expected {
            if chain.len() < limit {
                return Err(AppError::integrity(
                    chat_id,
                    format!("parent {missing} does not exist"),
                ));
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// The message the next turn builds on. The cached pointer is only trusted
    /// after it is found in the store under this chat.
    pub async fn current_leaf(&self, chat_id: &str) -> Result<Option<Message>, AppError> {
        if let Some(hint) = self.leaf_cache.get(chat_id).await {
            match self.messages.find_message(&hint).await? {
                Some(m) if m.chat_id == chat_id => return Ok(Some(m)),
                _ => {
                    warn!("Stale leaf pointer {hint} for chat {chat_id}, falling back to store");
                    self.leaf_cache.invalidate(chat_id).await;
                }
            }
        }

        let latest = self.messages.find_latest_message(chat_id).await?;
        if let Some(leaf) = &latest {
            self.leaf_cache.set(chat_id, &leaf.id).await;
        }
        Ok(latest)
    }

    /// Switches the active branch to the one containing `message_id`, following
    /// the newest child down to a leaf.
    pub async fn select_leaf(&self, chat_id: &str, message_id: &str) -> Result<Message, AppError> {
        let mut leaf = self.message(chat_id, message_id).await?;
        let mut visited = HashSet::new();
        visited.insert(leaf.id.clone());

        loop {
            let children = self.messages.find_children(&leaf.id).await?;
            let Some(newest) = children.into_iter().filter(|c| c.chat_id == chat_id).last() else {
                break;
            };
            if !visited.insert(newest.id.clone()) {
                return Err(AppError::integrity(
                    chat_id,
                    format!("cycle below message {message_id}"),
                ));
            }
            leaf = newest;
        }

        self.leaf_cache.set(chat_id, &leaf.id).await;
        info!("Chat {chat_id} switched to branch ending at {}", leaf.id);
        Ok(leaf)
    }

    pub async fn touch(&self, chat_id: &str) -> Result<(), AppError> {
        self.conversations.touch_conversation(chat_id, Utc::now()).await
    }

    pub async fn invalidate_leaf(&self, chat_id: &str) {
        self.leaf_cache.invalidate(chat_id).await;
    }
}
