use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::errors::AppError;
use crate::models::{
    CreateConversationRequest, Message, PurchaseRequest, SelectLeafRequest,
};
use crate::routes::auth::CallerIdentity;
use crate::routes::AppState;

const DEFAULT_TRANSACTIONS_PAGE: usize = 50;

#[derive(Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
    /// Message the next turn would build on.
    pub leaf_id: Option<String>,
}

#[derive(Deserialize)]
pub struct TransactionsQuery {
    pub limit: Option<usize>,
}

/// POST `/api/conversations`
pub async fn create_conversation_handler(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(body): Json<CreateConversationRequest>,
) -> Response {
    match state.turns.tree().create_conversation(caller.user_id(), body.mode, body.settings).await
    {
        Ok(conversation) => (StatusCode::CREATED, Json(conversation)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations`: the caller's conversations, most recently active first
pub async fn list_conversations_handler(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Response {
    match state.turns.tree().conversations_for_user(caller.user_id()).await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/messages`: the whole tree plus the active leaf
pub async fn list_messages_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Response {
    let tree = state.turns.tree();
    let result = async {
        tree.owned_conversation(&id, caller.user_id()).await?;
        let messages = tree.messages(&id).await?;
        let leaf_id = tree.current_leaf(&id).await?.map(|m| m.id);
        Ok::<_, AppError>(MessagesResponse { messages, leaf_id })
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/leaf`: switch the active branch
pub async fn select_leaf_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(body): Json<SelectLeafRequest>,
) -> Response {
    let tree = state.turns.tree();
    let result = async {
        tree.owned_conversation(&id, caller.user_id()).await?;
        tree.select_leaf(&id, &body.message_id).await
    }
    .await;

    match result {
        Ok(leaf) => Json(leaf).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/ledger`
pub async fn ledger_handler(State(state): State<AppState>, caller: CallerIdentity) -> Response {
    let ledger = state.turns.ledger();
    match ledger.account(caller.user_id()).await {
        Ok(account) => {
            let free_remaining = account.free_remaining(ledger.daily_free_tokens());
            Json(json!({ "account": account, "free_remaining": free_remaining })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET `/api/ledger/transactions?limit=N`
pub async fn transactions_handler(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(query): Query<TransactionsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_TRANSACTIONS_PAGE);
    match state.turns.ledger().transactions(caller.user_id(), limit).await {
        Ok(transactions) => Json(transactions).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/ledger/purchase`
pub async fn purchase_handler(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(body): Json<PurchaseRequest>,
) -> Response {
    let ledger = state.turns.ledger();
    match ledger.purchase(caller.user_id(), body.amount, body.reference.as_deref()).await {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/jobs/{id}`
pub async fn job_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Response {
    let Some(runner) = state.turns.image_jobs() else {
        return error_response(&AppError::RecordNotFound { entity_type: "image_job".into(), id });
    };
    match runner.job(caller.user_id(), &id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helper ────────────────────────────────────────────────────────────────────

pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::InvalidEventSequence { .. } => StatusCode::CONFLICT,
        AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
        AppError::InsufficientTokens { .. } => StatusCode::PAYMENT_REQUIRED,
        AppError::RateLimited { .. } | AppError::JobSlotBusy => StatusCode::TOO_MANY_REQUESTS,
        AppError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::StreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        AppError::StreamFailed { .. } | AppError::ModerationRejected => StatusCode::BAD_GATEWAY,
        e if e.is_caller_error() => StatusCode::BAD_REQUEST,
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        e if e.is_store_failure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &AppError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    let mut body = json!({ "code": err.code(), "message": err.to_string() });
    if let AppError::InsufficientTokens { available, .. } = err {
        body["available"] = json!(available);
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_taxonomy() {
        let seq = AppError::InvalidEventSequence { event: "send".into(), leaf: "user".into() };
        assert_eq!(status_for(&seq), StatusCode::CONFLICT);
        let funds = AppError::InsufficientTokens { required: 3, available: 1 };
        assert_eq!(status_for(&funds), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(status_for(&AppError::JobSlotBusy), StatusCode::TOO_MANY_REQUESTS);
        let empty = AppError::EmptyField { field_name: "text".into() };
        assert_eq!(status_for(&empty), StatusCode::BAD_REQUEST);
        let missing = AppError::ConversationNotFound { id: "c".into() };
        assert_eq!(status_for(&missing), StatusCode::NOT_FOUND);
        let store = AppError::StoreUnavailable("down".into());
        assert_eq!(status_for(&store), StatusCode::SERVICE_UNAVAILABLE);
    }
}
