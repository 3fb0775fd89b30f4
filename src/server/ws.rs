//! WebSocket bridge from the event bus to live dashboard clients.
//!
//! Each connection gets its own bounded bus subscription; a client that
//! stops reading loses events (counted against it) without affecting
//! sessions or other clients.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;

use crate::events::EventKind;

use super::AppState;

/// Event kinds forwarded to the dashboard stream.
const LIVE_KINDS: &[EventKind] = &[
    EventKind::SessionStarted,
    EventKind::Progress,
    EventKind::SessionCompleted,
    EventKind::SessionFailed,
    EventKind::StatusUpdate,
];

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.bus.subscribe(Some(LIVE_KINDS.to_vec()));
    tracing::info!(
        subscriber = subscription.id,
        total = state.bus.subscriber_count(),
        "ws client connected"
    );

    let hello = json!({
        "type": "connected",
        "ts": Utc::now(),
        "subscriber_id": subscription.id,
    });
    if sender.send(Message::Text(hello.to_string())).await.is_err() {
        state.bus.unsubscribe(subscription.id);
        return;
    }

    loop {
        tokio::select! {
            event = subscription.rx.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("event serialization failed: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    // Inbound frames are ignored; the stream is one-way.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.bus.unsubscribe(subscription.id);
    tracing::info!(subscriber = subscription.id, "ws client disconnected");
}
