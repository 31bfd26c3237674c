pub mod api_routes;
pub mod auth;
pub mod ws_routes;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::generation::GenerationOrchestrator;
use api_routes::{
    create_conversation_handler, job_handler, ledger_handler, list_conversations_handler,
    list_messages_handler, purchase_handler, select_leaf_handler, transactions_handler,
};
use ws_routes::ws_turns_handler;

#[derive(Clone)]
pub struct AppState {
    pub turns: GenerationOrchestrator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/conversations",
            post(create_conversation_handler).get(list_conversations_handler),
        )
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .route("/api/conversations/{id}/leaf", post(select_leaf_handler))
        .route("/api/ledger", get(ledger_handler))
        .route("/api/ledger/transactions", get(transactions_handler))
        .route("/api/ledger/purchase", post(purchase_handler))
        .route("/api/jobs/{id}", get(job_handler))
        .route("/ws/turns", get(ws_turns_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
