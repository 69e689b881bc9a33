//! Subscriber push channel
//!
//! WebSocket endpoint fed by the frontend bridge. Each connection gets its
//! own session queue; every outbound frame is a self-describing JSON message
//! with a `type` discriminator. Push latency is reported back to the bridge
//! to drive the replay cache's adaptive sizing.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use tokio::sync::watch;

use crate::domain::bridge::BridgeState;

#[derive(Clone)]
pub struct WsState {
    pub bridge: Arc<BridgeState>,
    pub shutdown_rx: watch::Receiver<bool>,
}

pub fn routes(bridge: Arc<BridgeState>, shutdown_rx: watch::Receiver<bool>) -> Router<()> {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState { bridge, shutdown_rx })
}

/// Upgrade to the push channel
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsState) {
    let session = state.bridge.attach();
    let session_id = session.id();
    let mut shutdown_rx = state.shutdown_rx.clone();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }

            // Drain client frames so close/ping are processed; inbound
            // payloads are ignored (push-only channel)
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session = %session_id, error = %e, "Subscriber socket error");
                        break;
                    }
                }
            }

            message = session.recv() => {
                let Some(message) = message else {
                    // Session was cut by the bridge (hard limit)
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let frame = match serde_json::to_string(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize push message");
                        continue;
                    }
                };

                let started = Instant::now();
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
                state
                    .bridge
                    .observe_push_latency(started.elapsed().as_millis() as u64);
            }
        }
    }

    state.bridge.detach(session_id);
    tracing::debug!(session = %session_id, dropped = session.dropped(), "Subscriber connection closed");
}
