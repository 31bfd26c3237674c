//! Per-turn generation state machine.
//!
//! ```text
//! VALIDATE → RESOLVE_CONTEXT → RESERVE_COST → STREAM ─┬→ COMMIT → ENQUEUE_SIDE_JOB
//!                                                     └→ ROLLBACK
//! ```
//!
//! Cost is always reserved before the model is called and returned through a
//! single latched rollback path, whatever ends the stream: a provider error,
//! the hard timeout or the caller going away.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::{self, CompletionRequest, ModelRegistry, ModelSpec, StreamEvent};
use crate::cancel::CancelToken;
use crate::errors::AppError;
use crate::models::{
    Conversation, ImageJobSettings, Message, MessageMetadata, MessagePart, MessageRole,
    Reservation, ReserveOutcome, TurnEvent, TurnRequest, TurnResult, Usage,
};
use crate::observability::{record_turn_outcome, TurnOutcome};
use crate::service::image_jobs::ImageJobRunner;
use crate::service::latch::ErrorLatch;
use crate::service::ledger::Ledger;
use crate::service::message_tree::MessageTree;
use crate::service::rate_guard::{RateGuard, FREE_MODEL_BUCKET};

pub const MAX_MESSAGE_LENGTH: usize = 8000;
const IMAGE_PROMPT_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Validate,
    ResolveContext,
    ReserveCost,
    Stream,
    Commit,
    Rollback,
    EnqueueSideJob,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Validate => "validate",
            TurnState::ResolveContext => "resolve_context",
            TurnState::ReserveCost => "reserve_cost",
            TurnState::Stream => "stream",
            TurnState::Commit => "commit",
            TurnState::Rollback => "rollback",
            TurnState::EnqueueSideJob => "enqueue_side_job",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub max_context_messages: usize,
    pub stream_timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self { max_context_messages: 200, stream_timeout: Duration::from_secs(45) }
    }
}

/// Progress pushed to the caller while a turn runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    Started { chat_id: String, user_message_id: Option<String> },
    Delta(String),
}

/// What a validated event turns into.
struct TurnPlan {
    /// New user message to persist once cost is reserved (send/edit).
    staged_text: Option<String>,
    /// Parent of the staged user message.
    user_parent: Option<String>,
    /// Parent of the assistant reply when nothing is staged (regenerate/retry).
    reply_parent: Option<String>,
}

/// Everything the rollback path needs, plus the once-only latch.
struct ActiveTurn<'a> {
    user_id: &'a str,
    chat_id: &'a str,
    reservation: Reservation,
    latch: ErrorLatch,
    /// Refund task started by the rollback. Outlives a dropped stream future.
    compensation: StdMutex<Option<Shared<BoxFuture<'static, ()>>>>,
}

impl ActiveTurn<'_> {
    /// Waits for the refund, then hands back the recorded cause.
    async fn failed(&self, failure: &mut Option<AppError>) -> AppError {
        let pending = self.compensation.lock().ok().and_then(|slot| slot.clone());
        if let Some(pending) = pending {
            pending.await;
        }
        take_failure(failure)
    }
}

#[derive(Clone)]
pub struct GenerationOrchestrator {
    tree: MessageTree,
    ledger: Ledger,
    guard: RateGuard,
    models: Arc<ModelRegistry>,
    image_jobs: Option<ImageJobRunner>,
    settings: GenerationSettings,
}

impl GenerationOrchestrator {
    pub fn new(
        tree: MessageTree,
        ledger: Ledger,
        guard: RateGuard,
        models: Arc<ModelRegistry>,
        settings: GenerationSettings,
    ) -> Self {
        Self { tree, ledger, guard, models, image_jobs: None, settings }
    }

    pub fn with_image_jobs(mut self, runner: ImageJobRunner) -> Self {
        self.image_jobs = Some(runner);
        self
    }

    pub fn tree(&self) -> &MessageTree {
        &self.tree
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn image_jobs(&self) -> Option<&ImageJobRunner> {
        self.image_jobs.as_ref()
    }

    /// Runs one turn to completion. Deltas are pushed to `updates` as they
    /// arrive; cancelling `cancel` aborts the stream and rolls the turn back.
    pub async fn run_turn(
        &self,
        user_id: &str,
        request: TurnRequest,
        updates: Option<mpsc::Sender<TurnUpdate>>,
        cancel: CancelToken,
    ) -> Result<TurnResult, AppError> {
        let chat_id = request.chat_id.clone();
        let mut billed: Option<(String, i64)> = None;
        let result = self.drive(user_id, request, updates, cancel, &mut billed).await;

        let (model_id, cost) = match &billed {
            Some((id, cost)) => (Some(id.as_str()), *cost),
            None => (None, 0),
        };
        let outcome = match &result {
            Ok(_) => TurnOutcome::Success,
            Err(e) => TurnOutcome::from_error(e),
        };
        record_turn_outcome(outcome, user_id, &chat_id, model_id, cost);
        result
    }

    async fn drive(
        &self,
        user_id: &str,
        request: TurnRequest,
        updates: Option<mpsc::Sender<TurnUpdate>>,
        cancel: CancelToken,
        billed: &mut Option<(String, i64)>,
    ) -> Result<TurnResult, AppError> {
        let chat_id = request.chat_id.as_str();

        // ── VALIDATE ────────────────────────────────────────────────────────
        enter(TurnState::Validate, chat_id);
        let conversation = self.tree.owned_conversation(chat_id, user_id).await?;
        let requested = request.model_id.as_deref().or(conversation.settings.model_id.as_deref());
        let model = self.models.resolve(requested)?.clone();
        *billed = Some((model.id.clone(), model.cost));

        let plan = match self.plan(chat_id, &request.event).await {
            Ok(plan) => plan,
            Err(e) => {
                if !e.is_caller_error() {
                    self.tree.invalidate_leaf(chat_id).await;
                }
                return Err(e);
            }
        };

        // ── RESOLVE_CONTEXT ─────────────────────────────────────────────────
        enter(TurnState::ResolveContext, chat_id);
        let context_parent = plan.user_parent.as_deref().or(plan.reply_parent.as_deref());
        let budget = if plan.staged_text.is_some() {
            self.settings.max_context_messages.saturating_sub(1)
        } else {
            self.settings.max_context_messages
        };
        let mut context = match context_parent {
            Some(leaf) => match self.tree.resolve_ancestor_chain(chat_id, leaf, budget).await {
                Ok(chain) => chain,
                Err(e) => {
                    self.tree.invalidate_leaf(chat_id).await;
                    return Err(e);
                }
            },
            None => Vec::new(),
        };

        // ── RESERVE_COST ────────────────────────────────────────────────────
        enter(TurnState::ReserveCost, chat_id);
        if model.free_tier && !self.guard.check_and_consume(user_id, FREE_MODEL_BUCKET).await.allowed
        {
            return Err(AppError::RateLimited { bucket: FREE_MODEL_BUCKET.into() });
        }
        let reason = format!("turn:{chat_id}:{}", model.id);
        let reservation = match self.ledger.reserve(user_id, model.cost, &reason).await? {
            ReserveOutcome::Reserved(r) => r,
            ReserveOutcome::Insufficient { available } => {
                return Err(AppError::InsufficientTokens { required: model.cost, available });
            }
        };

        let turn = ActiveTurn {
            user_id,
            chat_id,
            reservation,
            latch: ErrorLatch::new(),
            compensation: StdMutex::new(None),
        };
        let mut failure: Option<AppError> = None;

        let user_message = match &plan.staged_text {
            Some(text) => {
                let staged = self
                    .tree
                    .append_message(
                        chat_id,
                        plan.user_parent.as_deref(),
                        MessageRole::User,
                        vec![MessagePart::Text { text: text.clone() }],
                        MessageMetadata::default(),
                    )
                    .await;
                match staged {
                    Ok(message) => Some(message),
                    Err(e) => {
                        error!("Failed to persist user message in chat {chat_id}: {e}");
                        self.rollback(&turn, e, &mut failure).await;
                        return Err(turn.failed(&mut failure).await);
                    }
                }
            }
            None => None,
        };
        if let Some(message) = &user_message {
            context.push(message.clone());
        }
        let reply_parent = match (&user_message, &plan.reply_parent) {
            (Some(message), _) => message.id.clone(),
            (None, Some(parent)) => parent.clone(),
            (None, None) => {
                let e = AppError::integrity(chat_id, "turn has nothing to reply to");
                self.rollback(&turn, e, &mut failure).await;
                return Err(turn.failed(&mut failure).await);
            }
        };

        if let Some(tx) = &updates {
            let started = TurnUpdate::Started {
                chat_id: chat_id.to_string(),
                user_message_id: user_message.as_ref().map(|m| m.id.clone()),
            };
            let _ = tx.send(started).await;
        }

        // ── STREAM ──────────────────────────────────────────────────────────
        enter(TurnState::Stream, chat_id);
        let (system_prompt_id, system_prompt) = agent::system_prompt_for(&conversation);
        let completion = CompletionRequest {
            model: model.upstream_model.clone(),
            system_prompt,
            history: agent::to_history(&context),
        };

        let streamed = tokio::time::timeout(
            self.settings.stream_timeout,
            self.stream_reply(&turn, &model, completion, updates.as_ref(), &cancel, &mut failure),
        )
        .await;
        let (text, usage) = match streamed {
            Ok(Some(reply)) => reply,
            Ok(None) => return Err(turn.failed(&mut failure).await),
            Err(_) => {
                cancel.cancel();
                let seconds = self.settings.stream_timeout.as_secs();
                warn!("Turn in chat {chat_id} timed out after {seconds}s");
                self.rollback(&turn, AppError::StreamTimeout { seconds }, &mut failure).await;
                return Err(turn.failed(&mut failure).await);
            }
        };

        // ── COMMIT ──────────────────────────────────────────────────────────
        enter(TurnState::Commit, chat_id);
        let metadata = MessageMetadata {
            model_id: Some(model.id.clone()),
            usage: Some(usage),
            cost: reservation.total(),
            system_prompt_id: Some(system_prompt_id),
            error: None,
        };
        let assistant = match self
            .tree
            .append_message(
                chat_id,
                Some(&reply_parent),
                MessageRole::Assistant,
                vec![MessagePart::Text { text: text.clone() }],
                metadata,
            )
            .await
        {
            Ok(message) => message,
            Err(e) => {
                error!("Assistant reply for chat {chat_id} streamed but could not be saved: {e}");
                self.rollback(&turn, e, &mut failure).await;
                return Err(turn.failed(&mut failure).await);
            }
        };
        if let Err(e) = self.tree.touch(chat_id).await {
            warn!("Failed to touch conversation {chat_id}: {e}");
        }
        self.tree.invalidate_leaf(chat_id).await;
        info!("Turn committed in chat {chat_id}: assistant message {}", assistant.id);

        // ── ENQUEUE_SIDE_JOB ────────────────────────────────────────────────
        let side_job_enqueued =
            self.enqueue_side_job(user_id, &conversation, &request, &assistant);

        Ok(TurnResult {
            chat_id: chat_id.to_string(),
            user_message,
            assistant_message: assistant,
            reservation,
            side_job_enqueued,
        })
    }

    /// Checks the event against the current leaf and decides where the new
    /// messages attach.
    async fn plan(&self, chat_id: &str, event: &TurnEvent) -> Result<TurnPlan, AppError> {
        match event {
            TurnEvent::Send { text } => {
                validate_text(text)?;
                let leaf = self.tree.current_leaf(chat_id).await?;
                if let Some(leaf) = &leaf {
                    if leaf.role != MessageRole::Assistant {
                        return Err(invalid_sequence(event, leaf.role.as_str()));
                    }
                }
                Ok(TurnPlan {
                    staged_text: Some(text.clone()),
                    user_parent: leaf.map(|l| l.id),
                    reply_parent: None,
                })
            }
            TurnEvent::Edit { message_id, text } => {
                validate_text(text)?;
                let target = self.tree.message(chat_id, message_id).await?;
                if target.role != MessageRole::User {
                    return Err(invalid_sequence(event, "an assistant message"));
                }
                let Some(parent) = target.parent_id else {
                    return Err(invalid_sequence(event, "the root message"));
                };
                Ok(TurnPlan {
                    staged_text: Some(text.clone()),
                    user_parent: Some(parent),
                    reply_parent: None,
                })
            }
            TurnEvent::Regenerate => {
                let leaf = self.tree.current_leaf(chat_id).await?;
                let Some(leaf) = leaf.filter(|l| l.role == MessageRole::Assistant) else {
                    return Err(invalid_sequence(event, "not an assistant reply"));
                };
                let Some(parent) = leaf.parent_id else {
                    return Err(AppError::integrity(
                        chat_id,
                        format!("assistant message {} has no parent", leaf.id),
                    ));
                };
                Ok(TurnPlan { staged_text: None, user_parent: None, reply_parent: Some(parent) })
            }
            TurnEvent::Retry => {
                let leaf = self.tree.current_leaf(chat_id).await?;
                let Some(leaf) = leaf.filter(|l| l.role == MessageRole::User) else {
                    return Err(invalid_sequence(event, "not a user message"));
                };
                if !self.tree.children(chat_id, &leaf.id).await?.is_empty() {
                    return Err(invalid_sequence(event, "a user message that already has a reply"));
                }
                Ok(TurnPlan { staged_text: None, user_parent: None, reply_parent: Some(leaf.id) })
            }
        }
    }

    /// Streams the reply, forwarding deltas. Returns `None` once the turn has
    /// been rolled back; the cause is left in `failure`.
    async fn stream_reply(
        &self,
        turn: &ActiveTurn<'_>,
        model: &ModelSpec,
        completion: CompletionRequest,
        updates: Option<&mpsc::Sender<TurnUpdate>>,
        cancel: &CancelToken,
        failure: &mut Option<AppError>,
    ) -> Option<(String, Usage)> {
        if cancel.is_cancelled() {
            self.rollback(turn, AppError::Cancelled, failure).await;
            return None;
        }
        debug!("Opening {} stream for chat {}", model.backend.name(), turn.chat_id);
        let mut stream = match model.backend.stream_completion(completion, cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.rollback(turn, e, failure).await;
                return None;
            }
        };

        let mut text = String::new();
        let mut usage = None;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.rollback(turn, AppError::Cancelled, failure).await;
                    return None;
                }
                event = stream.next() => event,
            };
            match event {
                Some(StreamEvent::Delta(delta)) => {
                    text.push_str(&delta);
                    if let Some(tx) = updates {
                        let _ = tx.send(TurnUpdate::Delta(delta)).await;
                    }
                }
                Some(StreamEvent::Finish(reported)) => {
                    usage = Some(reported);
                    break;
                }
                Some(StreamEvent::Error(stream_failure)) => {
                    self.rollback(turn, stream_failure.into_error(), failure).await;
                    cancel.cancel();
                    return None;
                }
                None => break,
            }
        }

        let Some(usage) = usage else {
            let e = AppError::stream_failed("stream ended before completion");
            self.rollback(turn, e, failure).await;
            return None;
        };
        if text.trim().is_empty() {
            self.rollback(turn, AppError::stream_failed("model returned an empty reply"), failure)
                .await;
            return None;
        }
        Some((text, usage))
    }

    /// Single failure path of a turn. Only the first call does anything. The
    /// compensation runs on its own task so a timeout dropping the stream
    /// future cannot interrupt a refund half way; `ActiveTurn::failed` waits
    /// for it before the error is returned.
    async fn rollback(&self, turn: &ActiveTurn<'_>, cause: AppError, failure: &mut Option<AppError>) {
        if !turn.latch.try_fire() {
            debug!("Turn in chat {} already rolled back, ignoring: {cause}", turn.chat_id);
            return;
        }
        enter(TurnState::Rollback, turn.chat_id);
        warn!("Rolling back turn in chat {}: {cause}", turn.chat_id);
        let reason = format!("turn failed: {}", cause.code());
        *failure = Some(cause);

        let tree = self.tree.clone();
        let ledger = self.ledger.clone();
        let chat_id = turn.chat_id.to_string();
        let user_id = turn.user_id.to_string();
        let reservation = turn.reservation;
        let task = tokio::spawn(async move {
            tree.invalidate_leaf(&chat_id).await;
            if let Err(e) = ledger.refund(&user_id, reservation, &reason).await {
                error!("Refund of {} tokens to {user_id} failed: {e}", reservation.total());
            }
        });
        let chat_id = turn.chat_id.to_string();
        let compensation = task
            .map(move |joined| {
                if let Err(e) = joined {
                    error!("Rollback task for chat {chat_id} did not finish: {e}");
                }
            })
            .boxed()
            .shared();
        if let Ok(mut slot) = turn.compensation.lock() {
            *slot = Some(compensation.clone());
        }
        compensation.await;
    }

    fn enqueue_side_job(
        &self,
        user_id: &str,
        conversation: &Conversation,
        request: &TurnRequest,
        assistant: &Message,
    ) -> bool {
        if !(request.generate_image || conversation.settings.image_generation) {
            return false;
        }
        let Some(runner) = &self.image_jobs else {
            debug!("Image generation requested but no image backend is configured");
            return false;
        };
        enter(TurnState::EnqueueSideJob, &conversation.id);
        let prompt: String = assistant.text().chars().take(IMAGE_PROMPT_CHARS).collect();
        runner.enqueue(
            user_id.to_string(),
            conversation.id.clone(),
            assistant.id.clone(),
            ImageJobSettings { prompt, style: conversation.settings.image_style.clone() },
        );
        true
    }
}

fn enter(state: TurnState, chat_id: &str) {
    debug!(state = state.as_str(), chat_id, "turn state");
}

fn take_failure(failure: &mut Option<AppError>) -> AppError {
    failure
        .take()
        .unwrap_or_else(|| AppError::Unexpected("turn failed without a recorded cause".into()))
}

fn invalid_sequence(event: &TurnEvent, leaf: &str) -> AppError {
    AppError::InvalidEventSequence { event: event.kind().to_string(), leaf: leaf.to_string() }
}

fn validate_text(text: &str) -> Result<(), AppError> {
    if text.trim().is_empty() {
        return Err(AppError::EmptyField { field_name: "text".into() });
    }
    let length = text.chars().count();
    if length > MAX_MESSAGE_LENGTH {
        return Err(AppError::FieldTooLong {
            field_name: "text".into(),
            max_length: MAX_MESSAGE_LENGTH,
            actual_length: length,
        });
    }
    Ok(())
}
