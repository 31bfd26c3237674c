use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    CompletionRequest, CompletionStream, FailureKind, ModelBackend, StreamEvent, StreamFailure,
};
use crate::cancel::CancelToken;
use crate::errors::AppError;
use crate::models::Usage;

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Outcome of one SSE `data:` line.
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Events(Vec<StreamEvent>),
    Done,
    Ignored,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(parsed) = serde_json::from_str::<OpenAiStreamResponse>(data) else {
        return SseLine::Ignored;
    };

    let mut events = Vec::new();
    if let Some(choice) = parsed.choices.first() {
        if let Some(content) = choice.delta.content.as_deref().filter(|c| !c.is_empty()) {
            events.push(StreamEvent::Delta(content.to_string()));
        }
        if choice.finish_reason.as_deref() == Some("content_filter") {
            events.push(StreamEvent::Error(StreamFailure::new(
                FailureKind::Moderation,
                "completion stopped by content filter",
            )));
        }
    }
    if let Some(usage) = parsed.usage {
        events.push(StreamEvent::Finish(Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }));
    }
    SseLine::Events(events)
}

/// Splits a byte stream into complete lines. Bytes are held until a `\n`
/// arrives, so a UTF-8 sequence split across network chunks is decoded whole.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }
}

/// Hosted models speaking the OpenAI chat-completions streaming protocol.
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: &str, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn pump(
        response: reqwest::Response,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancelToken,
    ) {
        let mut bytes = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut finished = false;

        loop {
            let chunk = tokio::select! {
                chunk = bytes.next() => chunk,
                _ = cancel.cancelled() => {
                    debug!("Upstream stream aborted by cancel signal");
                    return;
                }
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    let failure = StreamFailure::new(FailureKind::Transport, e.to_string());
                    let _ = tx.send(StreamEvent::Error(failure)).await;
                    return;
                }
                None => break,
            };
            for line in lines.feed(&chunk) {
                match parse_sse_line(&line) {
                    SseLine::Events(events) => {
                        for event in events {
                            finished |= matches!(event, StreamEvent::Finish(_));
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    SseLine::Done => {
                        if !finished {
                            let _ = tx.send(StreamEvent::Finish(Usage::default())).await;
                        }
                        return;
                    }
                    SseLine::Ignored => {}
                }
            }
        }

        if !finished {
            warn!("Upstream stream closed without [DONE]");
            let failure =
                StreamFailure::new(FailureKind::Transport, "stream closed before completion");
            let _ = tx.send(StreamEvent::Error(failure)).await;
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancelToken,
    ) -> Result<CompletionStream, AppError> {
        let mut messages = vec![OpenAiMessage { role: "system", content: &request.system_prompt }];
        messages.extend(
            request
                .history
                .iter()
                .map(|t| OpenAiMessage { role: t.role.as_str(), content: &t.content }),
        );
        let body = OpenAiRequest {
            model: &request.model,
            messages,
            stream: true,
            stream_options: StreamOptions { include_usage: true },
        };

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = tokio::select! {
            response = req.send() => response.map_err(|e| {
                if e.is_connect() {
                    AppError::ProviderUnavailable { host: self.base_url.clone() }
                } else {
                    AppError::stream_failed(e)
                }
            })?,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::stream_failed(format!("provider returned {status}: {text}")));
        }

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        tokio::spawn(Self::pump(response, tx, cancel));

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }
}
