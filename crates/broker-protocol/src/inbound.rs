//! Messages a consumer (browser/editor client) sends to the gateway over
//! its session WebSocket (§6 "Consumer → Gateway").

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    UserMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<Value>>,
    },
    PermissionResponse {
        request_id: String,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        always_allow: bool,
    },
    Interrupt,
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: String,
    },
    PresenceQuery,
    SlashCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    QueueMessage {
        text: String,
    },
    UpdateQueuedMessage {
        text: String,
    },
    CancelQueuedMessage,
    SetAdapter {
        adapter: String,
    },
}

impl InboundMessage {
    /// The wire `type` tag, for log/trace messages that shouldn't need to
    /// re-derive it from the serde representation.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::PermissionResponse { .. } => "permission_response",
            Self::Interrupt => "interrupt",
            Self::SetModel { .. } => "set_model",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::PresenceQuery => "presence_query",
            Self::SlashCommand { .. } => "slash_command",
            Self::QueueMessage { .. } => "queue_message",
            Self::UpdateQueuedMessage { .. } => "update_queued_message",
            Self::CancelQueuedMessage => "cancel_queued_message",
            Self::SetAdapter { .. } => "set_adapter",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_round_trips_through_json() {
        let msg = InboundMessage::UserMessage {
            text: "hi".into(),
            attachments: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"user_message\""));
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        match back {
            InboundMessage::UserMessage { text, .. } => assert_eq!(text, "hi"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn permission_response_defaults_always_allow_to_false() {
        let json = r#"{"type":"permission_response","request_id":"r1","approved":true}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        match msg {
            InboundMessage::PermissionResponse { always_allow, .. } => {
                assert!(!always_allow);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let json = r#"{"type":"not_a_real_type"}"#;
        assert!(serde_json::from_str::<InboundMessage>(json).is_err());
    }
}
