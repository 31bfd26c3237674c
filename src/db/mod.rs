//! Persistence seams. Each trait has a Postgres repository and an in-process
//! implementation in [`memory`] with identical semantics.

pub mod conversation_repository;
pub mod guard_repository;
pub mod job_repository;
pub mod ledger_repository;
pub mod memory;
pub mod message_repository;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::errors::AppError;
use crate::models::{
    Conversation, JobRecord, LedgerAccount, LedgerTransaction, Message, Reservation,
    ReserveOutcome,
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), AppError>;
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError>;
    async fn find_conversations_by_user(&self, user_id: &str)
        -> Result<Vec<Conversation>, AppError>;
    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<(), AppError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &Message) -> Result<(), AppError>;
    async fn find_message(&self, id: &str) -> Result<Option<Message>, AppError>;
    /// Whole tree of a chat in creation order.
    async fn find_messages(&self, chat_id: &str) -> Result<Vec<Message>, AppError>;
    async fn find_children(&self, message_id: &str) -> Result<Vec<Message>, AppError>;
    async fn find_latest_message(&self, chat_id: &str) -> Result<Option<Message>, AppError>;
    async fn has_root(&self, chat_id: &str) -> Result<bool, AppError>;
    /// Upward walk from `leaf_id` following parent pointers, leaf first, at most
    /// `limit` rows. Does not detect cycles; callers validate the result.
    async fn find_ancestors(&self, leaf_id: &str, limit: usize) -> Result<Vec<Message>, AppError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current account, created empty on first touch, with the daily window
    /// lazily reset.
    async fn account(&self, user_id: &str, now: DateTime<Utc>) -> Result<LedgerAccount, AppError>;

    /// Atomic debit: free allowance first, then purchased balance.
    async fn reserve(
        &self,
        user_id: &str,
        amount: i64,
        daily_cap: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, AppError>;

    /// Restores exactly the amounts of `reservation`.
    async fn refund(
        &self,
        user_id: &str,
        reservation: Reservation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, AppError>;

    async fn purchase(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, AppError>;

    /// Audit log, newest first.
    async fn transactions(&self, user_id: &str, limit: usize)
        -> Result<Vec<LedgerTransaction>, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining: u32,
}

#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Records one hit for `key` if fewer than `limit` hits fall inside `window`.
    async fn consume_window(
        &self,
        key: &str,
        limit: u32,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision, AppError>;

    /// Forgets the most recent hit for `key`.
    async fn restore_window(&self, key: &str) -> Result<(), AppError>;

    /// Conditional increment of the user's in-flight job counter.
    async fn try_acquire_job_slot(&self, user_id: &str, max_in_flight: u32)
        -> Result<bool, AppError>;

    async fn release_job_slot(&self, user_id: &str) -> Result<(), AppError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), AppError>;
    async fn find_job(&self, id: &str) -> Result<Option<JobRecord>, AppError>;
    async fn mark_processing(&self, id: &str) -> Result<(), AppError>;
    async fn mark_success(
        &self,
        id: &str,
        artifact_url: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;
    async fn mark_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<(), AppError>;
}
