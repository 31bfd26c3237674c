//! Model providers.
//!
//! Every backend exposes one capability, [`ModelBackend::stream_completion`].
//! Model ids are mapped to a backend, a per-turn cost and a free-tier flag by
//! the [`ModelRegistry`] lookup table.

pub mod image;
pub mod ollama;
pub mod openai;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{Conversation, ConversationMode, Message, Usage};

pub use image::{GeneratedImage, HttpImageGenerator, ImageGenerator};
pub use ollama::OllamaBackend;
pub use openai::OpenAiCompatibleBackend;

const ROLEPLAY_PREAMBLE: &str = "You are an immersive roleplay partner. Stay in character, \
                                 answer in the persona's voice and keep replies vivid but concise.";
const STORY_PREAMBLE: &str = "You are a collaborative storyteller. Continue the story from the \
                              user's direction, keeping continuity with earlier events.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Upstream model name understood by the backend.
    pub model: String,
    pub system_prompt: String,
    /// Root-first context; the last entry is the user turn being answered.
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Moderation,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StreamFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn into_error(self) -> AppError {
        match self.kind {
            FailureKind::Moderation => AppError::ModerationRejected,
            FailureKind::Transport | FailureKind::Provider => AppError::stream_failed(self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Finish(Usage),
    /// Some providers surface several of these for one logical failure.
    Error(StreamFailure),
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend identifier used in logs (e.g. "ollama", "openai").
    fn name(&self) -> &'static str;

    /// Opens a streaming completion. `cancel` aborts the upstream call; the
    /// stream then simply ends.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancelToken,
    ) -> Result<CompletionStream, AppError>;
}

#[derive(Clone)]
pub struct ModelSpec {
    pub id: String,
    pub upstream_model: String,
    /// Tokens reserved per turn; 0 skips the ledger entirely.
    pub cost: i64,
    /// Free-tier models are additionally gated by the shared rate window.
    pub free_tier: bool,
    pub backend: Arc<dyn ModelBackend>,
}

#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelSpec>,
    default_model: Option<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model; the first one registered becomes the default.
    pub fn register(&mut self, spec: ModelSpec) {
        if self.default_model.is_none() {
            self.default_model = Some(spec.id.clone());
        }
        self.models.insert(spec.id.clone(), spec);
    }

    pub fn with_default(mut self, model_id: &str) -> Self {
        self.default_model = Some(model_id.to_string());
        self
    }

    /// Looks up `model_id`, falling back to the default model when `None`.
    pub fn resolve(&self, model_id: Option<&str>) -> Result<&ModelSpec, AppError> {
        let id = model_id.or(self.default_model.as_deref()).unwrap_or_default();
        self.models
            .get(id)
            .ok_or_else(|| AppError::ModelNotSupported { model_id: id.to_string() })
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.models.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Built-in catalogue: a metered free-tier local model and a paid hosted one.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let mut registry = Self::new();
        registry.register(ModelSpec {
            id: "persona-lite".into(),
            upstream_model: config.ollama_model.clone(),
            cost: config.lite_model_cost,
            free_tier: true,
            backend: Arc::new(OllamaBackend::new(&config.ollama_base_url)?),
        });
        if let Some(base_url) = &config.openai_base_url {
            registry.register(ModelSpec {
                id: "persona-pro".into(),
                upstream_model: config.openai_model.clone(),
                cost: config.pro_model_cost,
                free_tier: false,
                backend: Arc::new(OpenAiCompatibleBackend::new(
                    base_url,
                    config.openai_api_key.clone().unwrap_or_default(),
                )),
            });
        }
        Ok(registry)
    }
}

/// System prompt for a conversation and the identifier recorded in metadata.
pub fn system_prompt_for(conversation: &Conversation) -> (String, String) {
    if let Some(custom) = conversation.settings.system_prompt.as_deref() {
        return ("conversation-custom".into(), custom.to_string());
    }
    let (id, base) = match conversation.mode {
        ConversationMode::Roleplay => ("roleplay-default", ROLEPLAY_PREAMBLE),
        ConversationMode::Story => ("story-default", STORY_PREAMBLE),
    };
    let prompt = match conversation.settings.persona_name.as_deref() {
        Some(name) => format!("{base} Your persona is {name}."),
        None => base.to_string(),
    };
    (id.into(), prompt)
}

/// Maps stored messages to provider chat turns, skipping empty ones.
pub fn to_history(messages: &[Message]) -> Vec<ChatTurn> {
    messages
        .iter()
        .filter_map(|m| {
            let content = m.text();
            if content.trim().is_empty() {
                return None;
            }
            let role = match m.role {
                crate::models::MessageRole::User => ChatRole::User,
                crate::models::MessageRole::Assistant => ChatRole::Assistant,
            };
            Some(ChatTurn { role, content })
        })
        .collect()
}
