use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::models::{TurnRequest, WsEvent};
use crate::routes::auth::CallerIdentity;
use crate::routes::AppState;
use crate::service::generation::TurnUpdate;

/// GET `/ws/turns`: upgrades to a WebSocket that streams turns.
pub async fn ws_turns_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, caller))
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Client sends a JSON `TurnRequest`:
///   `{ "chat_id": "...", "event": { "type": "send", "text": "..." }, "model_id": null }`
///   (event types: `send`, `edit`, `regenerate`, `retry`)
/// - Server streams back:
///   1. `{ "type": "stream_start", "chat_id": "...", "user_message_id": "...|null" }`
///   2. `{ "type": "stream_chunk", "content": "..." }` (repeated)
///   3. `{ "type": "stream_end", "message_id": "...", "full_content": "..." }`
///   or `{ "type": "error", "code": "...", "message": "..." }` on failure.
///
/// Closing the socket mid-turn cancels the turn, which rolls back its cost.
async fn handle_socket(mut socket: WebSocket, state: AppState, caller: CallerIdentity) {
    info!("WebSocket client {} connected", caller.user_id());

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        let text = match &msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let request: TurnRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error {
                    code: "INVALID_REQUEST".into(),
                    message: format!("Invalid request: {e}"),
                })
                .await;
                continue;
            }
        };

        if !run_turn(&mut socket, &state, &caller, request).await {
            break;
        }
    }

    info!("WebSocket client {} disconnected", caller.user_id());
}

/// Drives one turn over the socket. Returns `false` when the client went away.
async fn run_turn(
    socket: &mut WebSocket,
    state: &AppState,
    caller: &CallerIdentity,
    request: TurnRequest,
) -> bool {
    let (tx, mut rx) = mpsc::channel::<TurnUpdate>(64);
    let cancel = CancelToken::new();

    let turns = state.turns.clone();
    let user_id = caller.user_id().to_string();
    let turn_cancel = cancel.clone();
    let handle =
        tokio::spawn(async move { turns.run_turn(&user_id, request, Some(tx), turn_cancel).await });

    let mut connected = true;
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(TurnUpdate::Started { chat_id, user_message_id }) => {
                    send_event(socket, &WsEvent::StreamStart { chat_id, user_message_id }).await;
                }
                Some(TurnUpdate::Delta(content)) => {
                    send_event(socket, &WsEvent::StreamChunk { content }).await;
                }
                None => break,
            },
            incoming = socket.recv(), if connected => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("Client left mid-turn, cancelling");
                    cancel.cancel();
                    connected = false;
                }
                Some(Ok(_)) => warn!("Ignoring client frame while a turn is streaming"),
            },
        }
    }

    let event = match handle.await {
        Ok(Ok(result)) => WsEvent::StreamEnd {
            message_id: result.assistant_message.id.clone(),
            full_content: result.assistant_message.text(),
        },
        Ok(Err(e)) => WsEvent::Error { code: e.code().into(), message: e.to_string() },
        Err(e) => {
            error!("Turn task panicked: {e}");
            WsEvent::Error {
                code: "UNEXPECTED".into(),
                message: "Internal error during streaming".into(),
            }
        }
    };
    if connected {
        send_event(socket, &event).await;
    }
    connected
}

/// Helper: serialize a `WsEvent` and send it over the socket.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}
