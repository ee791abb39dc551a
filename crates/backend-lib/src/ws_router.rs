// ============================
// live-relay-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use live_relay_common::{Channel, ControlFrame, Envelope};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION, WS_MALFORMED_FRAME};
use crate::relay_actor::{RelayHandle, RelaySnapshot};
use crate::session::SessionId;
use crate::AppState;

/// Create the router: health check, relay status and the WebSocket endpoint
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/status", get(status))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Plain response for process supervisors
async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<RelaySnapshot>, AppError> {
    Ok(Json(state.relay.snapshot().await?))
}

/// Handler for WebSocket connections
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut tx, mut rx) = socket.split();

    // Envelopes queued by the relay for this connection
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Envelope>(state.settings.session.outbound_buffer);

    let session_id = match state.relay.open_session(outbound_tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "relay unavailable, dropping connection");
            let _ = tx.send(Message::Close(None)).await;
            return;
        },
    };

    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);
    debug!(session = %session_id, "websocket connected");

    // Forward queued envelopes to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let frame = match envelope.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to serialize envelope");
                    continue;
                },
            };
            if tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => on_message(&state.relay, session_id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    debug!(session = %session_id, error = %e, "websocket read failed");
                    break;
                },
            },
            // Writer gone: the socket is closing
            _ = &mut send_task => break,
        }
    }

    state.relay.session_closed(session_id);
    send_task.abort();

    gauge!(WS_ACTIVE).decrement(1.0);
    debug!(session = %session_id, "websocket disconnected");
}

/// A control frame whose channel has been validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Connect(Channel),
    Disconnect,
}

/// Decode one inbound text frame
pub fn parse_frame(raw: &str) -> Result<ControlRequest, AppError> {
    match serde_json::from_str::<ControlFrame>(raw)? {
        ControlFrame::Connect { channel } => Ok(ControlRequest::Connect(Channel::parse(&channel)?)),
        ControlFrame::Disconnect => Ok(ControlRequest::Disconnect),
    }
}

/// Parse one inbound text frame and dispatch it to the relay.
///
/// Malformed frames are logged and ignored; the connection stays open.
pub fn on_message(relay: &RelayHandle, session_id: SessionId, raw: &str) {
    let request = match parse_frame(raw) {
        Ok(request) => request,
        Err(e) => {
            counter!(WS_MALFORMED_FRAME).increment(1);
            warn!(session = %session_id, code = e.error_code(), error = %e, "ignoring malformed control frame");
            return;
        },
    };

    let dispatched = match request {
        ControlRequest::Connect(channel) => relay.connect(session_id, channel),
        ControlRequest::Disconnect => relay.disconnect(session_id),
    };

    if let Err(e) = dispatched {
        warn!(session = %session_id, error = %e, "failed to dispatch control frame");
    }
}
