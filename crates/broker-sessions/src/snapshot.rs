//! Per-session durable snapshots (§3 "History", §6 "Storage interface").
//!
//! Distinct from [`crate::registry::SessionRecord`]: the record is the
//! lightweight, frequently-touched index entry (cwd, adapter, pid, state);
//! a `SessionSnapshot` is the heavier payload — history, buffered
//! pre-connect messages, and still-open permission requests — persisted
//! separately so a restart can restore a conversation's transcript
//! without paying that cost on every registry flush.

use broker_domain::UnifiedMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The durable shape of a [`crate::permission::PermissionInfo`] — no
/// `session_id` (implied by the snapshot it's nested in) and no live
/// `oneshot` waiter, since the consumer connection that would have
/// resolved it does not survive a restart either.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPermission {
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionSnapshot {
    pub history: Vec<UnifiedMessage>,
    #[serde(default)]
    pub pending_messages: Vec<UnifiedMessage>,
    #[serde(default)]
    pub pending_permissions: Vec<(Uuid, PersistedPermission)>,
    #[serde(default)]
    pub adapter_name: Option<String>,
}
