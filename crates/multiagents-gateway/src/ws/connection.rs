//! Per-connection WebSocket loop: rate limiting, validation, dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::ws::{handlers, message};

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
const RATE_LIMIT_MAX: usize = 100;
/// Buffered outbound events per connection before sends start timing out.
const OUTBOUND_BUFFER: usize = 256;

/// Tracks which session this connection is joined to.
pub struct ConnState {
    pub session_id: Option<String>,
    pub conn_id: Option<u64>,
    pub tx: mpsc::Sender<String>,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_label = uuid::Uuid::new_v4().simple().to_string();
    info!(conn = %conn_label, "new WS connection");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    // A dedicated writer drains the outbound queue so handlers (and large
    // event replays) can enqueue without ever blocking the read loop.
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnState {
        session_id: None,
        conn_id: None,
        tx,
    };
    let mut rate_timestamps: Vec<Instant> = Vec::new();

    while let Some(inbound) = stream.next().await {
        let text = match inbound {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn = %conn_label, error = %e, "WS receive error");
                break;
            }
        };

        // Cap control-message rate per connection.
        let now = Instant::now();
        rate_timestamps.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);
        rate_timestamps.push(now);
        if rate_timestamps.len() > RATE_LIMIT_MAX {
            warn!(conn = %conn_label, "rate limit exceeded");
            let _ = conn
                .tx
                .send(json!({"type": "error", "message": "Rate limit exceeded"}).to_string())
                .await;
            continue;
        }

        let msg: Value = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(_) => {
                let _ = conn
                    .tx
                    .send(json!({"type": "error", "message": "Invalid JSON"}).to_string())
                    .await;
                continue;
            }
        };
        if let Some(problem) = message::validate(&msg) {
            let _ = conn
                .tx
                .send(json!({"type": "error", "message": problem}).to_string())
                .await;
            continue;
        }

        handlers::dispatch(&state, &mut conn, &msg).await;
    }

    if let (Some(session_id), Some(conn_id)) = (&conn.session_id, conn.conn_id) {
        state.runner.unsubscribe(session_id, conn_id);
    }
    writer.abort();
    info!(conn = %conn_label, "WS connection closed");
}
