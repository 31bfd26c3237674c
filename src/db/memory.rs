//! In-process implementation of every store trait.
//!
//! Used when no `DATABASE_URL` is configured and by the test suite. A single
//! mutex guards all state, which gives the same atomicity the Postgres
//! repositories get from conditional updates.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::db::{
    ConversationStore, GuardStore, JobStore, LedgerStore, MessageStore, WindowDecision,
};
use crate::errors::AppError;
use crate::models::{
    Conversation, JobRecord, JobStatus, LedgerAccount, LedgerTransaction, Message, Reservation,
    ReserveOutcome, TransactionKind,
};

/// Areas that can be switched into a failing state to simulate an outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreArea {
    Conversations,
    Messages,
    Ledger,
    Guard,
    Jobs,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    message_index: HashMap<String, usize>,
    accounts: HashMap<String, LedgerAccount>,
    transactions: Vec<LedgerTransaction>,
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    job_slots: HashMap<String, u32>,
    jobs: HashMap<String, JobRecord>,
}

impl Inner {
    fn message(&self, id: &str) -> Option<&Message> {
        self.message_index.get(id).and_then(|&i| self.messages.get(i))
    }

    fn account_mut(&mut self, user_id: &str, now: DateTime<Utc>) -> &mut LedgerAccount {
        let account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| LedgerAccount::new(user_id.to_string(), now));
        account.apply_daily_reset(now);
        account
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing: StdMutex<HashSet<StoreArea>>,
    refund_delay: StdMutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, area: StoreArea, failing: bool) {
        if let Ok(mut set) = self.failing.lock() {
            if failing {
                set.insert(area);
            } else {
                set.remove(&area);
            }
        }
    }

    /// Makes every ledger refund wait `delay` before it is applied.
    pub fn set_refund_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.refund_delay.lock() {
            *slot = delay;
        }
    }

    fn check(&self, area: StoreArea) -> Result<(), AppError> {
        let failing = self.failing.lock().map(|set| set.contains(&area)).unwrap_or(true);
        if failing {
            Err(AppError::StoreUnavailable(format!("{area:?} store is unavailable")))
        } else {
            Ok(())
        }
    }

    fn job_not_found(id: &str) -> AppError {
        AppError::RecordNotFound { entity_type: "image_job".into(), id: id.into() }
    }

    async fn transition_job(
        &self,
        id: &str,
        allowed_from: &[JobStatus],
        apply: impl FnOnce(&mut JobRecord) + Send,
    ) -> Result<(), AppError> {
        self.check(StoreArea::Jobs)?;
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(id).ok_or_else(|| Self::job_not_found(id))?;
        if !allowed_from.contains(&job.status) {
            return Err(Self::job_not_found(id));
        }
        apply(job);
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), AppError> {
        self.check(StoreArea::Conversations)?;
        let mut inner = self.inner.lock().await;
        inner.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        self.check(StoreArea::Conversations)?;
        Ok(self.inner.lock().await.conversations.get(id).cloned())
    }

    async fn find_conversations_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, AppError> {
        self.check(StoreArea::Conversations)?;
        let inner = self.inner.lock().await;
        let mut conversations: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        self.check(StoreArea::Conversations)?;
        let mut inner = self.inner.lock().await;
        if let Some(conversation) = inner.conversations.get_mut(id) {
            conversation.updated_at = at;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<(), AppError> {
        self.check(StoreArea::Messages)?;
        let mut inner = self.inner.lock().await;
        if !inner.conversations.contains_key(&message.chat_id) {
            return Err(AppError::ConversationNotFound { id: message.chat_id.clone() });
        }
        let second_root = message.parent_id.is_none()
            && inner.messages.iter().any(|m| m.chat_id == message.chat_id && m.parent_id.is_none());
        if second_root {
            return Err(AppError::integrity(&message.chat_id, "conversation already has a root"));
        }
        let index = inner.messages.len();
        inner.messages.push(message.clone());
        inner.message_index.insert(message.id.clone(), index);
        Ok(())
    }

    async fn find_message(&self, id: &str) -> Result<Option<Message>, AppError> {
        self.check(StoreArea::Messages)?;
        Ok(self.inner.lock().await.message(id).cloned())
    }

    async fn find_messages(&self, chat_id: &str) -> Result<Vec<Message>, AppError> {
        self.check(StoreArea::Messages)?;
        let inner = self.inner.lock().await;
        Ok(inner.messages.iter().filter(|m| m.chat_id == chat_id).cloned().collect())
    }

    async fn find_children(&self, message_id: &str) -> Result<Vec<Message>, AppError> {
        self.check(StoreArea::Messages)?;
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.parent_id.as_deref() == Some(message_id))
            .cloned()
            .collect())
    }

    async fn find_latest_message(&self, chat_id: &str) -> Result<Option<Message>, AppError> {
        self.check(StoreArea::Messages)?;
        let inner = self.inner.lock().await;
        Ok(inner.messages.iter().rev().find(|m| m.chat_id == chat_id).cloned())
    }

    async fn has_root(&self, chat_id: &str) -> Result<bool, AppError> {
        self.check(StoreArea::Messages)?;
        let inner = self.inner.lock().await;
        Ok(inner.messages.iter().any(|m| m.chat_id == chat_id && m.parent_id.is_none()))
    }

    async fn find_ancestors(&self, leaf_id: &str, limit: usize) -> Result<Vec<Message>, AppError> {
        self.check(StoreArea::Messages)?;
        let inner = self.inner.lock().await;
        let mut chain = Vec::new();
        let mut cursor = Some(leaf_id.to_string());
        while let Some(id) = cursor {
            if chain.len() >= limit {
                break;
            }
            let Some(message) = inner.message(&id) else {
                break;
            };
            cursor = message.parent_id.clone();
            chain.push(message.clone());
        }
        Ok(chain)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn account(&self, user_id: &str, now: DateTime<Utc>) -> Result<LedgerAccount, AppError> {
        self.check(StoreArea::Ledger)?;
        let mut inner = self.inner.lock().await;
        Ok(inner.account_mut(user_id, now).clone())
    }

    async fn reserve(
        &self,
        user_id: &str,
        amount: i64,
        daily_cap: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, AppError> {
        self.check(StoreArea::Ledger)?;
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(user_id, now);

        let from_free = amount.min(account.free_remaining(daily_cap));
        let from_purchased = amount - from_free;
        if account.balance < from_purchased {
            return Ok(ReserveOutcome::Insufficient { available: account.available(daily_cap) });
        }

        account.daily_tokens_used += from_free;
        account.balance -= from_purchased;
        account.total_spent += amount;
        let balance_after = account.balance;

        let reservation =
            Reservation { tokens_from_free: from_free, tokens_from_purchased: from_purchased };
        inner.transactions.push(LedgerTransaction::new(
            user_id,
            TransactionKind::Spend,
            reservation,
            balance_after,
            reason,
            now,
        ));
        Ok(ReserveOutcome::Reserved(reservation))
    }

    async fn refund(
        &self,
        user_id: &str,
        reservation: Reservation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, AppError> {
        self.check(StoreArea::Ledger)?;
        let delay = self.refund_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().await;
        let account = inner.accounts.get_mut(user_id).ok_or_else(|| AppError::RecordNotFound {
            entity_type: "ledger_account".into(),
            id: user_id.into(),
        })?;

        account.daily_tokens_used = (account.daily_tokens_used - reservation.tokens_from_free).max(0);
        account.balance += reservation.tokens_from_purchased;
        account.total_spent -= reservation.total();

        let entry = LedgerTransaction::new(
            user_id,
            TransactionKind::Refund,
            reservation,
            account.balance,
            reason,
            now,
        );
        inner.transactions.push(entry.clone());
        Ok(entry)
    }

    async fn purchase(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, AppError> {
        self.check(StoreArea::Ledger)?;
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(user_id, now);
        account.balance += amount;
        account.total_purchased += amount;

        let entry = LedgerTransaction::new(
            user_id,
            TransactionKind::Purchase,
            Reservation { tokens_from_free: 0, tokens_from_purchased: amount },
            account.balance,
            reason,
            now,
        );
        inner.transactions.push(entry.clone());
        Ok(entry)
    }

    async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        self.check(StoreArea::Ledger)?;
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl GuardStore for MemoryStore {
    async fn consume_window(
        &self,
        key: &str,
        limit: u32,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision, AppError> {
        self.check(StoreArea::Guard)?;
        let mut inner = self.inner.lock().await;
        let hits = inner.windows.entry(key.to_string()).or_default();
        while hits.front().is_some_and(|&t| now - t >= window) {
            hits.pop_front();
        }

        let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        if used >= limit {
            return Ok(WindowDecision { allowed: false, remaining: 0 });
        }
        hits.push_back(now);
        Ok(WindowDecision { allowed: true, remaining: limit - used - 1 })
    }

    async fn restore_window(&self, key: &str) -> Result<(), AppError> {
        self.check(StoreArea::Guard)?;
        let mut inner = self.inner.lock().await;
        if let Some(hits) = inner.windows.get_mut(key) {
            hits.pop_back();
        }
        Ok(())
    }

    async fn try_acquire_job_slot(
        &self,
        user_id: &str,
        max_in_flight: u32,
    ) -> Result<bool, AppError> {
        self.check(StoreArea::Guard)?;
        let mut inner = self.inner.lock().await;
        let in_flight = inner.job_slots.entry(user_id.to_string()).or_insert(0);
        if *in_flight >= max_in_flight {
            return Ok(false);
        }
        *in_flight += 1;
        Ok(true)
    }

    async fn release_job_slot(&self, user_id: &str) -> Result<(), AppError> {
        self.check(StoreArea::Guard)?;
        let mut inner = self.inner.lock().await;
        if let Some(in_flight) = inner.job_slots.get_mut(user_id) {
            *in_flight = in_flight.saturating_sub(1);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), AppError> {
        self.check(StoreArea::Jobs)?;
        self.inner.lock().await.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobRecord>, AppError> {
        self.check(StoreArea::Jobs)?;
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn mark_processing(&self, id: &str) -> Result<(), AppError> {
        self.transition_job(id, &[JobStatus::Pending], |job| {
            job.status = JobStatus::Processing;
        })
        .await
    }

    async fn mark_success(
        &self,
        id: &str,
        artifact_url: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let url = artifact_url.to_string();
        self.transition_job(id, &[JobStatus::Processing], move |job| {
            job.status = JobStatus::Success;
            job.artifact_url = Some(url);
            job.completed_at = Some(at);
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        let error = error.to_string();
        self.transition_job(id, &[JobStatus::Pending, JobStatus::Processing], move |job| {
            job.status = JobStatus::Fail;
            job.error = Some(error);
            job.completed_at = Some(at);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_denies_after_limit_and_restore_gives_one_back() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let window = TimeDelta::hours(2);

        assert!(store.consume_window("k", 2, window, now).await.unwrap().allowed);
        let second = store.consume_window("k", 2, window, now).await.unwrap();
        assert_eq!(second, WindowDecision { allowed: true, remaining: 0 });
        assert!(!store.consume_window("k", 2, window, now).await.unwrap().allowed);

        store.restore_window("k").await.unwrap();
        assert!(store.consume_window("k", 2, window, now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn window_slides_past_old_hits() {
        let store = MemoryStore::new();
        let start = Utc::now();
        let window = TimeDelta::hours(2);

        assert!(store.consume_window("k", 1, window, start).await.unwrap().allowed);
        assert!(!store.consume_window("k", 1, window, start + TimeDelta::minutes(90)).await.unwrap().allowed);
        assert!(store.consume_window("k", 1, window, start + TimeDelta::hours(2)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn job_transitions_reject_terminal_jobs() {
        let store = MemoryStore::new();
        let job = JobRecord::pending(
            "turn".into(),
            "chat".into(),
            "u1".into(),
            10,
            Reservation::default(),
            Default::default(),
        );
        store.insert_job(&job).await.unwrap();
        store.mark_failed(&job.id, "boom", Utc::now()).await.unwrap();

        assert!(store.mark_processing(&job.id).await.is_err());
        let stored = store.find_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Fail);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_root_inserts_keep_a_single_root() {
        use crate::models::{ConversationMode, MessagePart, MessageRole};
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        let chat = Conversation::new("u1".into(), ConversationMode::Roleplay, Default::default());
        store.insert_conversation(&chat).await.unwrap();

        let inserts: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let root = Message::new(
                    chat.id.clone(),
                    None,
                    MessageRole::User,
                    vec![MessagePart::Text { text: format!("hello {i}") }],
                );
                tokio::spawn(async move { store.insert_message(&root).await })
            })
            .collect();

        let mut accepted = 0;
        for insert in inserts {
            match insert.await.unwrap() {
                Ok(()) => accepted += 1,
                Err(e) => assert_eq!(e.code(), "TREE_INTEGRITY"),
            }
        }
        assert_eq!(accepted, 1);
        let roots = store.find_messages(&chat.id).await.unwrap();
        assert_eq!(roots.iter().filter(|m| m.parent_id.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn failing_area_surfaces_store_unavailable() {
        let store = MemoryStore::new();
        store.set_failing(StoreArea::Ledger, true);
        let err = store.account("u1", Utc::now()).await.unwrap_err();
        assert!(err.is_store_failure());

        store.set_failing(StoreArea::Ledger, false);
        assert!(store.account("u1", Utc::now()).await.is_ok());
    }
}
