//! Backend-native ↔ [`UnifiedMessage`] translation. Each adapter owns a
//! translator implementing this trait; the router never sees backend-native
//! payloads, and adapters never construct [`UnifiedMessage`]s by hand
//! outside of their translator.

pub mod claude_like;
pub mod sse_like;

use broker_domain::{Result, UnifiedMessage};
use serde_json::Value;

pub trait Translator: Send + Sync {
    /// Convert one backend-native payload into zero or more unified
    /// messages. Zero is common — many backend frames (heartbeats,
    /// partial deltas folded into a later frame) carry no user-visible
    /// content on their own.
    fn to_unified(&mut self, raw: &Value) -> Result<Vec<UnifiedMessage>>;

    /// Convert an outbound unified message into the backend's native wire
    /// format, ready to be written to its transport.
    fn from_unified(&self, message: &UnifiedMessage) -> Value;
}
