//! Wire envelope for inverted-connection backend adapters — a backend that
//! dials in to the broker's transport hub rather than being spawned by it
//! (§4.10 "Transport Hub"). Mirrors the shape of a forward adapter's NDJSON
//! frames so the router doesn't need to special-case either direction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportMessage {
    /// Backend → Hub: first frame after connecting, identifying which
    /// session/backend instance this socket carries.
    BackendHello {
        backend_id: String,
        backend_name: String,
        session_key: Option<String>,
        capabilities: broker_domain::AdapterCapabilities,
    },

    /// Hub → Backend: handshake accepted, assigns the session this
    /// connection is now bound to.
    HubWelcome {
        session_id: String,
        hub_version: String,
    },

    /// Either direction: a raw backend-native payload, forwarded verbatim
    /// to the translator rather than parsed here.
    Frame { payload: Value },

    /// Hub → Backend: a permission decision or other control response the
    /// backend is waiting on (§4.8).
    ControlResponse {
        request_id: String,
        payload: Value,
    },

    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

/// Maximum size of a single inbound transport frame, matching the
/// consumer broadcaster's soft-drop threshold (§5 "Resource Model").
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::Availability;

    #[test]
    fn backend_hello_round_trips() {
        let hello = TransportMessage::BackendHello {
            backend_id: "b1".into(),
            backend_name: "claude-cli".into(),
            session_key: Some("s1".into()),
            capabilities: broker_domain::AdapterCapabilities {
                streaming: true,
                permissions: true,
                slash_commands: true,
                availability: Availability::Local,
                teams: false,
            },
        };
        let json = serde_json::to_string(&hello).unwrap();
        let back: TransportMessage = serde_json::from_str(&json).unwrap();
        match back {
            TransportMessage::BackendHello { backend_id, .. } => assert_eq!(backend_id, "b1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
