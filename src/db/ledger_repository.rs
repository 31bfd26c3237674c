use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::error;

use crate::db::LedgerStore;
use crate::errors::AppError;
use crate::models::{
    LedgerAccount, LedgerTransaction, Reservation, ReserveOutcome, TransactionKind,
};

const ACCOUNT_COLUMNS: &str =
    "user_id, balance, daily_tokens_used, last_daily_reset, total_purchased, total_spent";

#[derive(sqlx::FromRow)]
struct AccountRow {
    user_id: String,
    balance: i64,
    daily_tokens_used: i64,
    last_daily_reset: DateTime<Utc>,
    total_purchased: i64,
    total_spent: i64,
}

impl From<AccountRow> for LedgerAccount {
    fn from(row: AccountRow) -> Self {
        LedgerAccount {
            user_id: row.user_id,
            balance: row.balance,
            daily_tokens_used: row.daily_tokens_used,
            last_daily_reset: row.last_daily_reset,
            total_purchased: row.total_purchased,
            total_spent: row.total_spent,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: String,
    user_id: String,
    kind: String,
    amount: i64,
    tokens_from_free: i64,
    tokens_from_purchased: i64,
    balance_after: i64,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for LedgerTransaction {
    type Error = AppError;
    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let kind = TransactionKind::try_from(row.kind).map_err(AppError::Unexpected)?;
        Ok(LedgerTransaction {
            id: row.id,
            user_id: row.user_id,
            kind,
            amount: row.amount,
            tokens_from_free: row.tokens_from_free,
            tokens_from_purchased: row.tokens_from_purchased,
            balance_after: row.balance_after,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

/// Ledger backed by `ledger_accounts` / `ledger_transactions`.
///
/// Every balance mutation is a single conditional `UPDATE` inside a
/// transaction, so two concurrent reservations for the same user serialize on
/// the account row instead of racing a read-modify-write.
#[derive(Clone)]
pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| AppError::db_query("Failed to open ledger transaction", e))
    }

    /// Creates the account if missing and applies the lazy daily reset.
    async fn prepare_account(
        tx: &mut Transaction<'static, Postgres>,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO ledger_accounts (user_id, last_daily_reset) VALUES ($1, $2)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::db_query("Failed to create ledger account", e))?;

        sqlx::query(
            "UPDATE ledger_accounts SET daily_tokens_used = 0, last_daily_reset = $2
             WHERE user_id = $1 AND $2 - last_daily_reset >= INTERVAL '24 hours'",
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::db_query("Failed to apply daily reset", e))?;
        Ok(())
    }

    async fn load_account(
        tx: &mut Transaction<'static, Postgres>,
        user_id: &str,
    ) -> Result<LedgerAccount, AppError> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map(LedgerAccount::from)
        .map_err(|e| AppError::db_query(format!("Failed to load ledger account {user_id}"), e))
    }

    async fn append_transaction(
        tx: &mut Transaction<'static, Postgres>,
        entry: &LedgerTransaction,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO ledger_transactions
                 (id, user_id, kind, amount, tokens_from_free, tokens_from_purchased,
                  balance_after, reason, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&entry.id)
        .bind(&entry.user_id)
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(entry.tokens_from_free)
        .bind(entry.tokens_from_purchased)
        .bind(entry.balance_after)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::db_query("Failed to append ledger transaction", e))?;
        Ok(())
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), AppError> {
        tx.commit()
            .await
            .map_err(|e| AppError::db_query("Failed to commit ledger transaction", e))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerRepository {
    async fn account(&self, user_id: &str, now: DateTime<Utc>) -> Result<LedgerAccount, AppError> {
        let mut tx = self.begin().await?;
        Self::prepare_account(&mut tx, user_id, now).await?;
        let account = Self::load_account(&mut tx, user_id).await?;
        Self::commit(tx).await?;
        Ok(account)
    }

    async fn reserve(
        &self,
        user_id: &str,
        amount: i64,
        daily_cap: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, AppError> {
        let mut tx = self.begin().await?;
        Self::prepare_account(&mut tx, user_id, now).await?;

        let debited: Option<(i64, i64)> = sqlx::query_as(
            "UPDATE ledger_accounts AS a
             SET daily_tokens_used = a.daily_tokens_used + s.from_free,
                 balance = a.balance - ($2 - s.from_free),
                 total_spent = a.total_spent + $2
             FROM (
                 SELECT user_id, LEAST($2, GREATEST($3 - daily_tokens_used, 0)) AS from_free
                 FROM ledger_accounts WHERE user_id = $1 FOR UPDATE
             ) AS s
             WHERE a.user_id = s.user_id AND a.balance >= $2 - s.from_free
             RETURNING s.from_free, a.balance",
        )
        .bind(user_id)
        .bind(amount)
        .bind(daily_cap)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Ledger reserve failed for {user_id}: {e}");
            AppError::db_query("Failed to reserve tokens", e)
        })?;

        let Some((from_free, balance_after)) = debited else {
            let account = Self::load_account(&mut tx, user_id).await?;
            Self::commit(tx).await?;
            return Ok(ReserveOutcome::Insufficient { available: account.available(daily_cap) });
        };

        let reservation = Reservation {
            tokens_from_free: from_free,
            tokens_from_purchased: amount - from_free,
        };
        let entry = LedgerTransaction::new(
            user_id,
            TransactionKind::Spend,
            reservation,
            balance_after,
            reason,
            now,
        );
        Self::append_transaction(&mut tx, &entry).await?;
        Self::commit(tx).await?;
        Ok(ReserveOutcome::Reserved(reservation))
    }

    async fn refund(
        &self,
        user_id: &str,
        reservation: Reservation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, AppError> {
        let mut tx = self.begin().await?;
        let balance_after: i64 = sqlx::query_scalar(
            "UPDATE ledger_accounts
             SET daily_tokens_used = GREATEST(daily_tokens_used - $2, 0),
                 balance = balance + $3,
                 total_spent = total_spent - ($2 + $3)
             WHERE user_id = $1
             RETURNING balance",
        )
        .bind(user_id)
        .bind(reservation.tokens_from_free)
        .bind(reservation.tokens_from_purchased)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Ledger refund failed for {user_id}: {e}");
            AppError::db_query("Failed to refund tokens", e)
        })?;

        let entry = LedgerTransaction::new(
            user_id,
            TransactionKind::Refund,
            reservation,
            balance_after,
            reason,
            now,
        );
        Self::append_transaction(&mut tx, &entry).await?;
        Self::commit(tx).await?;
        Ok(entry)
    }

    async fn purchase(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, AppError> {
        let mut tx = self.begin().await?;
        Self::prepare_account(&mut tx, user_id, now).await?;
        let balance_after: i64 = sqlx::query_scalar(
            "UPDATE ledger_accounts
             SET balance = balance + $2, total_purchased = total_purchased + $2
             WHERE user_id = $1
             RETURNING balance",
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::db_query("Failed to credit purchase", e))?;

        let entry = LedgerTransaction::new(
            user_id,
            TransactionKind::Purchase,
            Reservation { tokens_from_free: 0, tokens_from_purchased: amount },
            balance_after,
            reason,
            now,
        );
        Self::append_transaction(&mut tx, &entry).await?;
        Self::commit(tx).await?;
        Ok(entry)
    }

    async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT id, user_id, kind, amount, tokens_from_free, tokens_from_purchased,
                    balance_after, reason, created_at
             FROM ledger_transactions
             WHERE user_id = $1
             ORDER BY created_at DESC, seq DESC
             LIMIT $2",
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::db_query("Failed to list ledger transactions", e))?
        .into_iter()
        .map(LedgerTransaction::try_from)
        .collect()
    }
}
