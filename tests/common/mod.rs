#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use futures_util::StreamExt;

use persona_turns::agent::{
    CompletionRequest, CompletionStream, FailureKind, GeneratedImage, ImageGenerator,
    ModelBackend, ModelRegistry, ModelSpec, StreamEvent, StreamFailure,
};
use persona_turns::cache::memory::InMemoryCache;
use persona_turns::cache::LeafCache;
use persona_turns::cancel::CancelToken;
use persona_turns::db::memory::MemoryStore;
use persona_turns::errors::AppError;
use persona_turns::models::{
    ConversationMode, ImageJobSettings, TurnEvent, TurnRequest, TurnResult, Usage,
};
use persona_turns::service::generation::{GenerationOrchestrator, GenerationSettings};
use persona_turns::service::image_jobs::ImageJobRunner;
use persona_turns::service::ledger::Ledger;
use persona_turns::service::message_tree::MessageTree;
use persona_turns::service::rate_guard::{RateGuard, FREE_MODEL_BUCKET, IMAGE_BUCKET};

pub const MODEL_ID: &str = "test-model";

/// One scripted provider response.
#[derive(Clone)]
pub struct Script {
    pub events: Vec<StreamEvent>,
    pub delay: Duration,
    /// Keep the stream open after the scripted events.
    pub hang: bool,
}

impl Script {
    pub fn reply(text: &str) -> Self {
        Self {
            events: vec![
                StreamEvent::Delta(text.to_string()),
                StreamEvent::Finish(Usage { prompt_tokens: 10, completion_tokens: 5 }),
            ],
            delay: Duration::ZERO,
            hang: false,
        }
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        let mut events: Vec<StreamEvent> =
            chunks.iter().map(|c| StreamEvent::Delta(c.to_string())).collect();
        events.push(StreamEvent::Finish(Usage { prompt_tokens: 10, completion_tokens: 5 }));
        Self { events, delay: Duration::ZERO, hang: false }
    }

    pub fn errors(count: usize) -> Self {
        let mut events = vec![StreamEvent::Delta("partial".into())];
        for i in 0..count {
            events.push(StreamEvent::Error(StreamFailure::new(
                FailureKind::Provider,
                format!("upstream exploded #{i}"),
            )));
        }
        Self { events, delay: Duration::ZERO, hang: false }
    }

    pub fn moderated() -> Self {
        Self {
            events: vec![StreamEvent::Error(StreamFailure::new(FailureKind::Moderation, "flagged"))],
            delay: Duration::ZERO,
            hang: false,
        }
    }

    pub fn hanging(first: &str) -> Self {
        Self { events: vec![StreamEvent::Delta(first.to_string())], delay: Duration::ZERO, hang: true }
    }
}

/// Model backend that replays queued scripts, falling back to a fixed reply.
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
    cancels: Mutex<Vec<CancelToken>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Cancel token handed to the most recent stream.
    pub fn last_cancel(&self) -> Option<CancelToken> {
        self.cancels.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancelToken,
    ) -> Result<CompletionStream, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        self.cancels.lock().unwrap().push(cancel);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| Script::reply("ok"));

        let delay = script.delay;
        let events = futures_util::stream::iter(script.events).then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            event
        });
        if script.hang {
            Ok(Box::pin(events.chain(futures_util::stream::pending())))
        } else {
            Ok(Box::pin(events))
        }
    }
}

/// Image generator whose outcome is fixed at construction.
pub struct ScriptedImages {
    pub fail: bool,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedImages {
    pub fn succeeding() -> Self {
        Self { fail: false, delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    pub fn failing() -> Self {
        Self { fail: true, delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { fail: false, delay, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl ImageGenerator for ScriptedImages {
    async fn generate(&self, settings: &ImageJobSettings) -> Result<GeneratedImage, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(AppError::ImageGenerationFailed {
                message: "renderer crashed\nstack trace follows".into(),
            });
        }
        Ok(GeneratedImage { url: format!("https://cdn.test/{}.png", settings.prompt.len()) })
    }
}

#[derive(Clone)]
pub struct Options {
    pub daily_free_tokens: i64,
    pub cost: i64,
    pub free_tier: bool,
    pub free_requests: u32,
    pub image_requests: u32,
    pub image_cost: i64,
    pub stream_timeout: Duration,
    pub max_context_messages: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            daily_free_tokens: 5,
            cost: 3,
            free_tier: true,
            free_requests: 30,
            image_requests: 10,
            image_cost: 10,
            stream_timeout: Duration::from_secs(5),
            max_context_messages: 200,
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub cache: LeafCache,
    pub tree: MessageTree,
    pub ledger: Ledger,
    pub guard: RateGuard,
    pub backend: Arc<ScriptedBackend>,
    pub images: Option<Arc<ScriptedImages>>,
    pub runner: Option<ImageJobRunner>,
    pub turns: GenerationOrchestrator,
}

impl Harness {
    pub fn new(options: Options) -> Self {
        Self::build(options, None)
    }

    pub fn with_images(options: Options, images: ScriptedImages) -> Self {
        Self::build(options, Some(Arc::new(images)))
    }

    fn build(options: Options, images: Option<Arc<ScriptedImages>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let cache = LeafCache::new(Arc::new(InMemoryCache::default()), Duration::from_secs(3600));
        let tree = MessageTree::new(store.clone(), store.clone(), cache.clone());
        let ledger = Ledger::new(store.clone(), options.daily_free_tokens);
        let window = TimeDelta::hours(2);
        let guard = RateGuard::new(store.clone(), 1)
            .with_bucket(FREE_MODEL_BUCKET, options.free_requests, window)
            .with_bucket(IMAGE_BUCKET, options.image_requests, window);

        let backend = Arc::new(ScriptedBackend::new());
        let mut registry = ModelRegistry::new();
        registry.register(ModelSpec {
            id: MODEL_ID.into(),
            upstream_model: "scripted-1".into(),
            cost: options.cost,
            free_tier: options.free_tier,
            backend: backend.clone(),
        });

        let settings = GenerationSettings {
            max_context_messages: options.max_context_messages,
            stream_timeout: options.stream_timeout,
        };
        let mut turns = GenerationOrchestrator::new(
            tree.clone(),
            ledger.clone(),
            guard.clone(),
            Arc::new(registry),
            settings,
        );

        let runner = images.clone().map(|generator| {
            ImageJobRunner::new(
                store.clone(),
                ledger.clone(),
                guard.clone(),
                generator,
                options.image_cost,
                1,
            )
        });
        if let Some(runner) = &runner {
            turns = turns.with_image_jobs(runner.clone());
        }

        Self { store, cache, tree, ledger, guard, backend, images, runner, turns }
    }

    pub async fn chat(&self, user_id: &str) -> String {
        self.tree
            .create_conversation(user_id, ConversationMode::Roleplay, Default::default())
            .await
            .unwrap()
            .id
    }

    pub async fn turn(
        &self,
        user_id: &str,
        chat_id: &str,
        event: TurnEvent,
    ) -> Result<TurnResult, AppError> {
        let request = TurnRequest {
            chat_id: chat_id.to_string(),
            event,
            model_id: None,
            generate_image: false,
        };
        self.turns.run_turn(user_id, request, None, CancelToken::new()).await
    }

    pub async fn send(&self, user_id: &str, chat_id: &str, text: &str) -> Result<TurnResult, AppError> {
        self.turn(user_id, chat_id, TurnEvent::Send { text: text.to_string() }).await
    }

    pub async fn regenerate(&self, user_id: &str, chat_id: &str) -> Result<TurnResult, AppError> {
        self.turn(user_id, chat_id, TurnEvent::Regenerate).await
    }

    pub async fn retry(&self, user_id: &str, chat_id: &str) -> Result<TurnResult, AppError> {
        self.turn(user_id, chat_id, TurnEvent::Retry).await
    }
}
