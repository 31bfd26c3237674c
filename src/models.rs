use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Length of the daily free-token window.
pub const DAILY_WINDOW_HOURS: i64 = 24;

// ── Conversations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    Roleplay,
    Story,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Roleplay => "roleplay",
            ConversationMode::Story => "story",
        }
    }
}

impl TryFrom<String> for ConversationMode {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "roleplay" => Ok(ConversationMode::Roleplay),
            "story" => Ok(ConversationMode::Story),
            other => Err(format!("Unknown conversation mode: {other}")),
        }
    }
}

/// Per-conversation persona and generation settings, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSettings {
    #[serde(default)]
    pub persona_name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    /// Queue an image job after every committed turn.
    #[serde(default)]
    pub image_generation: bool,
    #[serde(default)]
    pub image_style: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub mode: ConversationMode,
    pub settings: ConversationSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: String, mode: ConversationMode, settings: ConversationSettings) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            mode,
            settings,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Image { url: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Enrichment recorded on a message at commit time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub parent_id: Option<String>,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        chat_id: String,
        parent_id: Option<String>,
        role: MessageRole,
        parts: Vec<MessagePart>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id,
            parent_id,
            role,
            parts,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        }
    }

    /// Concatenated text parts; image parts are skipped.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub user_id: String,
    /// Purchased tokens still available.
    pub balance: i64,
    pub daily_tokens_used: i64,
    pub last_daily_reset: DateTime<Utc>,
    pub total_purchased: i64,
    pub total_spent: i64,
}

impl LedgerAccount {
    pub fn new(user_id: String, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: 0,
            daily_tokens_used: 0,
            last_daily_reset: now,
            total_purchased: 0,
            total_spent: 0,
        }
    }

    pub fn needs_daily_reset(&self, now: DateTime<Utc>) -> bool {
        now - self.last_daily_reset >= TimeDelta::hours(DAILY_WINDOW_HOURS)
    }

    /// Zeroes the daily counter when the window has elapsed. Returns whether it did.
    pub fn apply_daily_reset(&mut self, now: DateTime<Utc>) -> bool {
        if self.needs_daily_reset(now) {
            self.daily_tokens_used = 0;
            self.last_daily_reset = now;
            true
        } else {
            false
        }
    }

    pub fn free_remaining(&self, daily_cap: i64) -> i64 {
        (daily_cap - self.daily_tokens_used).max(0)
    }

    pub fn available(&self, daily_cap: i64) -> i64 {
        self.free_remaining(daily_cap) + self.balance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Purchase,
    Spend,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Spend => "spend",
            TransactionKind::Refund => "refund",
        }
    }
}

impl TryFrom<String> for TransactionKind {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "purchase" => Ok(TransactionKind::Purchase),
            "spend" => Ok(TransactionKind::Spend),
            "refund" => Ok(TransactionKind::Refund),
            other => Err(format!("Unknown transaction kind: {other}")),
        }
    }
}

/// Append-only audit row. `amount` is signed: spends are negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub tokens_from_free: i64,
    pub tokens_from_purchased: i64,
    pub balance_after: i64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn new(
        user_id: &str,
        kind: TransactionKind,
        reservation: Reservation,
        balance_after: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let total = reservation.total();
        let amount = match kind {
            TransactionKind::Spend => -total,
            TransactionKind::Purchase | TransactionKind::Refund => total,
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            amount,
            tokens_from_free: reservation.tokens_from_free,
            tokens_from_purchased: reservation.tokens_from_purchased,
            balance_after,
            reason: Some(reason.to_string()),
            created_at: now,
        }
    }
}

/// Exact split of a provisional debit; refunds restore these amounts verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub tokens_from_free: i64,
    pub tokens_from_purchased: i64,
}

impl Reservation {
    pub fn total(&self) -> i64 {
        self.tokens_from_free + self.tokens_from_purchased
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    Insufficient { available: i64 },
}

// ── Image jobs ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Success,
    Fail,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Fail)
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "success" => Ok(JobStatus::Success),
            "fail" => Ok(JobStatus::Fail),
            other => Err(format!("Unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageJobSettings {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    /// Assistant message the job illustrates.
    pub turn_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub cost: i64,
    pub reservation: Reservation,
    pub settings: ImageJobSettings,
    pub artifact_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn pending(
        turn_id: String,
        chat_id: String,
        user_id: String,
        cost: i64,
        reservation: Reservation,
        settings: ImageJobSettings,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turn_id,
            chat_id,
            user_id,
            status: JobStatus::Pending,
            cost,
            reservation,
            settings,
            artifact_url: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ── Turn requests ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Send { text: String },
    /// Replace an earlier user message with new text, branching from its parent.
    Edit { message_id: String, text: String },
    Regenerate,
    /// Answer a user message whose turn failed before a reply was saved.
    Retry,
}

impl TurnEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::Send { .. } => "send",
            TurnEvent::Edit { .. } => "edit",
            TurnEvent::Regenerate => "regenerate",
            TurnEvent::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub chat_id: String,
    pub event: TurnEvent,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub generate_image: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub chat_id: String,
    pub user_message: Option<Message>,
    pub assistant_message: Message,
    pub reservation: Reservation,
    pub side_job_enqueued: bool,
}

/// Server → client frames on the turn WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    StreamStart { chat_id: String, user_message_id: Option<String> },
    StreamChunk { content: String },
    StreamEnd { message_id: String, full_content: String },
    Error { code: String, message: String },
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub mode: ConversationMode,
    #[serde(default)]
    pub settings: ConversationSettings,
}

#[derive(Debug, Deserialize)]
pub struct SelectLeafRequest {
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub amount: i64,
    #[serde(default)]
    pub reference: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_reset_applies_only_after_full_window() {
        let start = Utc::now();
        let mut account = LedgerAccount::new("u1".into(), start);
        account.daily_tokens_used = 4;

        assert!(!account.apply_daily_reset(start + TimeDelta::hours(23)));
        assert_eq!(account.daily_tokens_used, 4);

        let later = start + TimeDelta::hours(24);
        assert!(account.apply_daily_reset(later));
        assert_eq!(account.daily_tokens_used, 0);
        assert_eq!(account.last_daily_reset, later);
    }

    #[test]
    fn available_combines_free_and_purchased() {
        let mut account = LedgerAccount::new("u1".into(), Utc::now());
        account.balance = 7;
        account.daily_tokens_used = 8;
        assert_eq!(account.free_remaining(5), 0);
        assert_eq!(account.available(10), 9);
    }

    #[test]
    fn turn_event_uses_tagged_json() {
        let event: TurnEvent =
            serde_json::from_str(r#"{"type":"edit","message_id":"m1","text":"hi"}"#).unwrap();
        assert_eq!(event, TurnEvent::Edit { message_id: "m1".into(), text: "hi".into() });
        assert_eq!(TurnEvent::Regenerate.kind(), "regenerate");
        let retry: TurnEvent = serde_json::from_str(r#"{"type":"retry"}"#).unwrap();
        assert_eq!(retry, TurnEvent::Retry);
    }

    #[test]
    fn spend_transactions_are_negative() {
        let tx = LedgerTransaction::new(
            "u1",
            TransactionKind::Spend,
            Reservation { tokens_from_free: 2, tokens_from_purchased: 3 },
            7,
            "turn",
            Utc::now(),
        );
        assert_eq!(tx.amount, -5);
    }
}
