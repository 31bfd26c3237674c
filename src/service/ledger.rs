use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::db::LedgerStore;
use crate::errors::AppError;
use crate::models::{LedgerAccount, LedgerTransaction, Reservation, ReserveOutcome};

const MAX_TRANSACTIONS_PAGE: usize = 500;

/// Token ledger: free daily allowance first, purchased balance second.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    daily_free_tokens: i64,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, daily_free_tokens: i64) -> Self {
        Self { store, daily_free_tokens }
    }

    pub fn daily_free_tokens(&self) -> i64 {
        self.daily_free_tokens
    }

    /// Atomically debits `amount`. A zero amount succeeds without touching the store.
    pub async fn reserve(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<ReserveOutcome, AppError> {
        if amount < 0 {
            return Err(AppError::InvalidAmount { amount });
        }
        if amount == 0 {
            return Ok(ReserveOutcome::Reserved(Reservation::default()));
        }

        let outcome = self
            .store
            .reserve(user_id, amount, self.daily_free_tokens, reason, Utc::now())
            .await
            .map_err(|e| {
                error!("Ledger reserve failed for user {user_id}: {e}");
                e
            })?;

        match outcome {
            ReserveOutcome::Reserved(r) => debug!(
                "Reserved {amount} for {user_id} ({} free, {} purchased)",
                r.tokens_from_free, r.tokens_from_purchased
            ),
            ReserveOutcome::Insufficient { available } => {
                info!("Reservation of {amount} refused for {user_id}: {available} available")
            }
        }
        Ok(outcome)
    }

    /// Restores exactly the debited split. Empty reservations are a no-op.
    pub async fn refund(
        &self,
        user_id: &str,
        reservation: Reservation,
        reason: &str,
    ) -> Result<Option<LedgerTransaction>, AppError> {
        if reservation.is_empty() {
            return Ok(None);
        }
        let entry = self
            .store
            .refund(user_id, reservation, reason, Utc::now())
            .await
            .map_err(|e| {
                error!(
                    "Ledger refund of {} failed for user {user_id} ({reason}): {e}",
                    reservation.total()
                );
                e
            })?;
        warn!("Refunded {} tokens to {user_id}: {reason}", reservation.total());
        Ok(Some(entry))
    }

    pub async fn purchase(
        &self,
        user_id: &str,
        amount: i64,
        reference: Option<&str>,
    ) -> Result<LedgerTransaction, AppError> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount { amount });
        }
        let reason = match reference {
            Some(r) => format!("purchase:{r}"),
            None => "purchase".to_string(),
        };
        let entry = self.store.purchase(user_id, amount, &reason, Utc::now()).await?;
        info!("User {user_id} purchased {amount} tokens");
        Ok(entry)
    }

    pub async fn account(&self, user_id: &str) -> Result<LedgerAccount, AppError> {
        self.store.account(user_id, Utc::now()).await
    }

    /// Applies the lazy 24h allowance reset and returns the account.
    pub async fn daily_reset(&self, user_id: &str) -> Result<LedgerAccount, AppError> {
        self.account(user_id).await
    }

    pub async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        self.store.transactions(user_id, limit.clamp(1, MAX_TRANSACTIONS_PAGE)).await
    }
}
