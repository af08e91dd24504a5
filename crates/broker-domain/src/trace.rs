//! Structured trace events emitted across broker crates.
//!
//! Replaces a generic event-bus with a small set of typed signals, per the
//! design notes: `backendEvents`, `consumerEvents`, `sessionEvents` are all
//! represented as variants here rather than as a stringly-typed bus.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    // ── backendEvents ───────────────────────────────────────────────
    BackendSessionId {
        session_id: String,
        backend_session_id: String,
    },
    BackendConnected {
        session_id: String,
        adapter_name: String,
    },
    BackendRelaunchNeeded {
        session_id: String,
    },
    CapabilitiesReady {
        session_id: String,
        commands: usize,
        models: usize,
    },
    CapabilitiesTimeout {
        session_id: String,
    },

    // ── sessionEvents ────────────────────────────────────────────────
    SessionFirstTurnCompleted {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    PermissionRequested {
        session_id: String,
        request_id: String,
        tool_name: String,
    },
    PermissionResolved {
        session_id: String,
        request_id: String,
        outcome: String,
    },
    TeamMemberJoined {
        session_id: String,
        member: String,
    },
    AuthStatus {
        session_id: String,
        authenticated: bool,
    },

    // ── consumerEvents ───────────────────────────────────────────────
    ConsumerAttached {
        session_id: String,
        user_id: String,
        role: String,
    },
    ConsumerRemoved {
        session_id: String,
        user_id: String,
    },
    ConsumerRateLimited {
        session_id: String,
        user_id: String,
    },
    ConsumerAuthorizationDenied {
        session_id: String,
        user_id: String,
        message_type: String,
    },

    // ── process lifecycle ────────────────────────────────────────────
    ProcessExited {
        session_id: String,
        pid: Option<u32>,
        code: Option<i32>,
    },
    ProcessResumeFailed {
        session_id: String,
        reason: String,
    },
}

impl TraceEvent {
    /// Emit as a single structured `tracing` record — callers don't need to
    /// hand-format fields, and the JSON payload is grep-able in log output.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "broker_event");
    }
}
