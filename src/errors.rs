use thiserror::Error;

/// Longest provider error text that is ever logged or surfaced.
const MAX_PROVIDER_ERROR_CHARS: usize = 200;

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Persistence errors ───────────────────────────────────────────────────
    #[error("Database connection failed: {0}")]
    DatabaseConnectionFailed(#[source] sqlx::Error),

    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Record not found: {entity_type} with id '{id}'")]
    RecordNotFound { entity_type: String, id: String },

    // ── Conversation tree errors ─────────────────────────────────────────────
    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error("Message '{id}' not found in conversation '{chat_id}'")]
    MessageNotFound { id: String, chat_id: String },

    #[error("Conversation '{chat_id}' tree integrity violated: {detail}")]
    TreeIntegrity { chat_id: String, detail: String },

    #[error("Caller does not own conversation '{id}'")]
    Forbidden { id: String },

    // ── Turn errors ──────────────────────────────────────────────────────────
    #[error("Event '{event}' is not valid when the current leaf is {leaf}")]
    InvalidEventSequence { event: String, leaf: String },

    #[error("Model '{model_id}' is not supported")]
    ModelNotSupported { model_id: String },

    #[error("Insufficient tokens: {required} required, {available} available")]
    InsufficientTokens { required: i64, available: i64 },

    #[error("Rate limit exceeded for '{bucket}'")]
    RateLimited { bucket: String },

    #[error("An image job is already in flight for this user")]
    JobSlotBusy,

    // ── Model provider errors ────────────────────────────────────────────────
    #[error("Model provider unavailable at {host}")]
    ProviderUnavailable { host: String },

    #[error("Model stream failed: {message}")]
    StreamFailed { message: String },

    #[error("Model stream timed out after {seconds}s")]
    StreamTimeout { seconds: u64 },

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Response rejected by content moderation")]
    ModerationRejected,

    #[error("Image generation failed: {message}")]
    ImageGenerationFailed { message: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    #[error("Token amount must be positive (got {amount})")]
    InvalidAmount { amount: i64 },

    #[error("Invalid configuration for '{key}': {message}")]
    InvalidConfig { key: String, message: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    /// Provider failure with the raw payload trimmed to a single short line.
    pub fn stream_failed(raw: impl std::fmt::Display) -> Self {
        AppError::StreamFailed { message: minimize(&raw.to_string()) }
    }

    pub fn integrity(chat_id: &str, detail: impl Into<String>) -> Self {
        AppError::TreeIntegrity { chat_id: chat_id.to_string(), detail: detail.into() }
    }

    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::DatabaseConnectionFailed(_)
            | AppError::DatabaseQueryFailed { .. }
            | AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AppError::RecordNotFound { .. } => "NOT_FOUND",
            AppError::ConversationNotFound { .. } => "CONVERSATION_NOT_FOUND",
            AppError::MessageNotFound { .. } => "MESSAGE_NOT_FOUND",
            AppError::TreeIntegrity { .. } => "TREE_INTEGRITY",
            AppError::Forbidden { .. } => "FORBIDDEN",
            AppError::InvalidEventSequence { .. } => "INVALID_EVENT_SEQUENCE",
            AppError::ModelNotSupported { .. } => "MODEL_NOT_SUPPORTED",
            AppError::InsufficientTokens { .. } => "INSUFFICIENT_TOKENS",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::JobSlotBusy => "JOB_SLOT_BUSY",
            AppError::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            AppError::StreamFailed { .. } => "STREAM_FAILED",
            AppError::StreamTimeout { .. } => "STREAM_TIMEOUT",
            AppError::Cancelled => "CANCELLED",
            AppError::ModerationRejected => "MODERATION_REJECTED",
            AppError::ImageGenerationFailed { .. } => "IMAGE_GENERATION_FAILED",
            AppError::EmptyField { .. }
            | AppError::FieldTooLong { .. }
            | AppError::InvalidAmount { .. } => "VALIDATION_FAILED",
            AppError::InvalidConfig { .. } => "INVALID_CONFIG",
            AppError::Unexpected(_) => "UNEXPECTED",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::ConversationNotFound { .. }
                | AppError::MessageNotFound { .. }
                | AppError::RecordNotFound { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. }
                | AppError::FieldTooLong { .. }
                | AppError::InvalidAmount { .. }
        )
    }

    /// Errors the caller caused; rejected before any cost is reserved.
    pub fn is_caller_error(&self) -> bool {
        self.is_validation()
            || matches!(
                self,
                AppError::InvalidEventSequence { .. }
                    | AppError::ModelNotSupported { .. }
                    | AppError::Forbidden { .. }
            )
    }

    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            AppError::ProviderUnavailable { .. }
                | AppError::StreamFailed { .. }
                | AppError::StreamTimeout { .. }
                | AppError::Cancelled
                | AppError::ModerationRejected
        )
    }

    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            AppError::DatabaseConnectionFailed(_)
                | AppError::DatabaseQueryFailed { .. }
                | AppError::StoreUnavailable(_)
        )
    }
}

pub(crate) fn minimize(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() > MAX_PROVIDER_ERROR_CHARS {
        format!("{}…", first_line.chars().take(MAX_PROVIDER_ERROR_CHARS).collect::<String>())
    } else {
        first_line.to_string()
    }
}
