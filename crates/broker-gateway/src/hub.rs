//! Per-session broadcast hub: fans a routed [`OutboundMessage`] out to
//! every consumer socket attached to a session (§5 "Consumer
//! Broadcaster"). One [`tokio::sync::broadcast`] channel per session,
//! created lazily and torn down when the session closes.

use std::collections::HashMap;
use std::sync::Arc;

use broker_protocol::OutboundMessage;
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Bounded so a consumer that stops reading can't grow a channel without
/// limit; a slow consumer instead misses older frames (`RecvError::Lagged`)
/// and is expected to re-sync via `session_init` on reattach.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct ConsumerHub {
    channels: RwLock<HashMap<String, broadcast::Sender<OutboundMessage>>>,
}

impl ConsumerHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, session_key: &str) -> broadcast::Sender<OutboundMessage> {
        if let Some(tx) = self.channels.read().get(session_key) {
            return tx.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(session_key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, session_key: &str) -> broadcast::Receiver<OutboundMessage> {
        self.sender(session_key).subscribe()
    }

    /// Broadcast to all current subscribers. Returns the number reached;
    /// zero is not an error — it just means no consumer is attached right
    /// now (the message was still applied to session state).
    pub fn publish(&self, session_key: &str, message: OutboundMessage) -> usize {
        self.sender(session_key).send(message).unwrap_or(0)
    }

    pub fn remove(&self, session_key: &str) {
        self.channels.write().remove(session_key);
    }
}

pub type SharedHub = Arc<ConsumerHub>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_messages() {
        let hub = ConsumerHub::new();
        let mut rx = hub.subscribe("s1");
        hub.publish("s1", OutboundMessage::StatusChange { status: "idle".into() });
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, OutboundMessage::StatusChange { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_returns_zero() {
        let hub = ConsumerHub::new();
        let reached = hub.publish("s1", OutboundMessage::StatusChange { status: "idle".into() });
        assert_eq!(reached, 0);
    }
}
