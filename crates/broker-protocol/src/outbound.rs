//! Messages the gateway sends to a consumer over its session WebSocket
//! (§6 "Gateway → Consumer"). Most variants wrap a [`broker_domain::UnifiedMessage`]
//! or a fragment of [`broker_domain::SessionState`]; a handful are gateway-native
//! (identity, presence, queue acks) and have no backend-side equivalent.

use broker_domain::{Capabilities, SessionState, UnifiedMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Identity {
        user_id: String,
        role: String,
    },
    SessionInit {
        session_id: String,
        protocol_version: u32,
        state: SessionState,
    },
    SessionUpdate {
        session_id: String,
        patch: Value,
    },
    MessageHistory {
        session_id: String,
        messages: Vec<UnifiedMessage>,
    },
    Assistant {
        message: UnifiedMessage,
    },
    UserMessage {
        message: UnifiedMessage,
    },
    Result {
        message: UnifiedMessage,
    },
    StatusChange {
        status: String,
    },
    StreamEvent {
        event: Value,
    },
    ToolProgress {
        tool_use_id: String,
        progress: Value,
    },
    ToolUseSummary {
        tool_use_id: String,
        summary: String,
    },
    AuthStatus {
        authenticated: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    SessionLifecycle {
        state: String,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: Value,
    },
    PermissionCancelled {
        request_id: String,
    },
    CapabilitiesReady {
        capabilities: Capabilities,
    },
    PresenceUpdate {
        participants: Vec<String>,
        observers: Vec<String>,
    },
    SessionNameUpdate {
        name: String,
    },
    ResumeFailed {
        reason: String,
    },
    CliConnected {
        adapter_name: String,
    },
    CliDisconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ProcessOutput {
        stream: String,
        line: String,
    },
    SlashCommandResult {
        command: String,
        output: String,
        /// Which tier resolved this command (§4.6, §6): `"adapter"` for
        /// the adapter's own native executor, `"emulated"` for a
        /// workspace/built-in command, `"cli"` for a native-passthrough
        /// command whose result was recovered from the backend's echo.
        source: String,
    },
    SlashCommandError {
        command: String,
        message: String,
    },
    MessageQueued {
        text: String,
    },
    QueuedMessageSent {
        text: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl OutboundMessage {
    /// True for frames that must reach participants only, never observers
    /// (§6 "participant-only" inbound/outbound split) — permission prompts
    /// carry `canUseTool` decisions an observer has no standing to make.
    pub fn participants_only(&self) -> bool {
        matches!(
            self,
            OutboundMessage::PermissionRequest { .. }
                | OutboundMessage::PermissionCancelled { .. }
                | OutboundMessage::ProcessOutput { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::{MessageType, Role};

    #[test]
    fn assistant_wraps_unified_message_under_type_tag() {
        let msg = UnifiedMessage::new(0, MessageType::Assistant, Role::Assistant, vec![]);
        let outbound = OutboundMessage::Assistant { message: msg };
        let json = serde_json::to_value(&outbound).unwrap();
        assert_eq!(json["type"], "assistant");
        assert!(json["message"].is_object());
    }

    #[test]
    fn error_omits_code_when_absent() {
        let outbound = OutboundMessage::Error {
            message: "boom".into(),
            code: None,
        };
        let json = serde_json::to_value(&outbound).unwrap();
        assert!(json.get("code").is_none());
    }

    #[test]
    fn session_init_carries_protocol_version_and_no_inline_history() {
        let outbound = OutboundMessage::SessionInit {
            session_id: "s1".into(),
            protocol_version: crate::PROTOCOL_VERSION,
            state: SessionState::default(),
        };
        let json = serde_json::to_value(&outbound).unwrap();
        assert_eq!(json["protocol_version"], crate::PROTOCOL_VERSION);
        assert!(json.get("history").is_none());
    }

    #[test]
    fn message_history_wraps_a_message_list() {
        let outbound = OutboundMessage::MessageHistory {
            session_id: "s1".into(),
            messages: vec![UnifiedMessage::new(0, MessageType::Assistant, Role::Assistant, vec![])],
        };
        let json = serde_json::to_value(&outbound).unwrap();
        assert_eq!(json["type"], "message_history");
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
    }
}
