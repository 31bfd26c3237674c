use async_trait::async_trait;
use rig::client::Nothing;
use rig::completion::Chat;
use rig::message::Message as RigMessage;
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use tracing::{debug, error};

use super::{
    ChatRole, ChatTurn, CompletionRequest, CompletionStream, ModelBackend, StreamEvent,
};
use crate::cancel::CancelToken;
use crate::errors::AppError;
use crate::models::Usage;

fn to_rig_history(turns: &[ChatTurn]) -> Vec<RigMessage> {
    turns
        .iter()
        .map(|t| match t.role {
            ChatRole::User => RigMessage::user(&t.content),
            ChatRole::Assistant => RigMessage::assistant(&t.content),
        })
        .collect()
}

/// Local models through rig's Ollama client.
///
/// rig's chat call returns the whole reply at once, so the stream carries a
/// single delta followed by the finish event.
#[derive(Clone)]
pub struct OllamaBackend {
    client: ollama::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .map_err(|e| AppError::InvalidConfig {
                key: "OLLAMA_API_BASE_URL".into(),
                message: format!("{e:?}"),
            })?;
        Ok(Self { client, base_url: base_url.to_string() })
    }

    fn classify(&self, model: &str, raw: String) -> AppError {
        if raw.contains("Connection refused") || raw.contains("connect") {
            AppError::ProviderUnavailable { host: self.base_url.clone() }
        } else if raw.contains("model") && raw.contains("not found") {
            AppError::ModelNotSupported { model_id: model.to_string() }
        } else {
            AppError::stream_failed(raw)
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancelToken,
    ) -> Result<CompletionStream, AppError> {
        let Some((prompt, earlier)) = request.history.split_last() else {
            return Err(AppError::EmptyField { field_name: "history".into() });
        };

        let agent = self
            .client
            .agent(&request.model)
            .preamble(&request.system_prompt)
            .build();

        debug!("Ollama chat with {} prior turns on {}", earlier.len(), request.model);
        let reply = tokio::select! {
            reply = agent.chat(prompt.content.as_str(), to_rig_history(earlier)) => reply,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };

        let content = reply.map_err(|e| {
            error!("Ollama inference failed for model {}: {e}", request.model);
            self.classify(&request.model, e.to_string())
        })?;

        let events = vec![StreamEvent::Delta(content), StreamEvent::Finish(Usage::default())];
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}
