//! Turn outcome events.
//!
//! Every finished turn emits exactly one structured event on the
//! `turn_outcome` tracing target, so a subscriber can route them to a metrics
//! or analytics sink without touching the orchestrator.

use tracing::{info, warn};

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Success,
    InsufficientFunds,
    RateLimited,
    ModerationFailure,
    Timeout,
    Cancelled,
    StreamError,
    PersistenceFailure,
    Rejected,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Success => "success",
            TurnOutcome::InsufficientFunds => "insufficient_funds",
            TurnOutcome::RateLimited => "rate_limited",
            TurnOutcome::ModerationFailure => "moderation_failure",
            TurnOutcome::Timeout => "timeout",
            TurnOutcome::Cancelled => "cancelled",
            TurnOutcome::StreamError => "stream_error",
            TurnOutcome::PersistenceFailure => "persistence_failure",
            TurnOutcome::Rejected => "rejected",
        }
    }

    pub fn from_error(err: &AppError) -> Self {
        match err {
            AppError::InsufficientTokens { .. } => TurnOutcome::InsufficientFunds,
            AppError::RateLimited { .. } => TurnOutcome::RateLimited,
            AppError::ModerationRejected => TurnOutcome::ModerationFailure,
            AppError::StreamTimeout { .. } => TurnOutcome::Timeout,
            AppError::Cancelled => TurnOutcome::Cancelled,
            e if e.is_provider_failure() => TurnOutcome::StreamError,
            e if e.is_store_failure() => TurnOutcome::PersistenceFailure,
            _ => TurnOutcome::Rejected,
        }
    }
}

pub fn record_turn_outcome(
    outcome: TurnOutcome,
    user_id: &str,
    chat_id: &str,
    model_id: Option<&str>,
    cost: i64,
) {
    let model_id = model_id.unwrap_or("-");
    match outcome {
        TurnOutcome::Success => info!(
            target: "turn_outcome",
            outcome = outcome.as_str(),
            user_id,
            chat_id,
            model_id,
            cost,
            "turn finished"
        ),
        _ => warn!(
            target: "turn_outcome",
            outcome = outcome.as_str(),
            user_id,
            chat_id,
            model_id,
            cost,
            "turn finished"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_outcomes() {
        let insufficient = AppError::InsufficientTokens { required: 5, available: 1 };
        assert_eq!(TurnOutcome::from_error(&insufficient), TurnOutcome::InsufficientFunds);
        assert_eq!(TurnOutcome::from_error(&AppError::Cancelled), TurnOutcome::Cancelled);
        assert_eq!(
            TurnOutcome::from_error(&AppError::stream_failed("boom")),
            TurnOutcome::StreamError
        );
        assert_eq!(
            TurnOutcome::from_error(&AppError::StoreUnavailable("down".into())),
            TurnOutcome::PersistenceFailure
        );
        assert_eq!(
            TurnOutcome::from_error(&AppError::EmptyField { field_name: "text".into() }),
            TurnOutcome::Rejected
        );
    }
}
