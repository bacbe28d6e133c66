use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use rumqttc::{AsyncClient, QoS};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::command::{optimistic_echo, parse_command, CommandTopics};
use crate::envelope::{now_ms, Envelope};
use crate::hub::SharedHub;

// ---------------------------------------------------------------------------
// Shared handler state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub hub: SharedHub,
    pub mqtt: AsyncClient,
    pub topics: Arc<CommandTopics>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/last", get(api_last))
        .with_state(state)
}

/// Last-known-state snapshot for plain HTTP consumers.
async fn api_last(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.snapshot(now_ms()).await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

/// One task pair per client: the writer drains the hub's per-client
/// channel (which was seeded with the late-join snapshot at register
/// time), the reader parses command frames. Either side ending tears
/// the client down; other clients are unaffected.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, mut rx) = state.hub.register(now_ms()).await;
    info!(client_id, "ws client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let reader_state = state.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => {
                    handle_command(&reader_state, text.as_str()).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    state.hub.unregister(client_id).await;
    info!(client_id, "ws client disconnected");
}

/// Command channel: publish the requested payload to the broker, then
/// broadcast the optimistic actuator echo (provisional until the device
/// reports back). Malformed frames are logged and dropped; one client's
/// garbage never affects the others.
async fn handle_command(state: &AppState, text: &str) {
    let Some(cmd) = parse_command(text) else {
        warn!(frame = text, "ignoring malformed command frame");
        return;
    };

    if let Err(e) = state
        .mqtt
        .publish(&cmd.topic, QoS::AtMostOnce, false, cmd.payload.clone())
        .await
    {
        warn!(topic = %cmd.topic, "command publish failed: {e}");
    }

    let now = now_ms();
    if let Some((state_topic, act)) = optimistic_echo(&state.topics, &cmd, now) {
        state.hub.record_actuator(state_topic, act.clone()).await;
        state
            .hub
            .broadcast(&Envelope::synthetic(
                state_topic,
                json!({ "value": act.value, "ts": act.ts }),
                now,
            ))
            .await;
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind web port {port}: {e}");
            return;
        }
    };

    info!("relay listening on http://{addr} (ws at /ws)");

    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!("web server error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
