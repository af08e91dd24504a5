//! The canonical in-process message envelope.
//!
//! Every backend adapter translates its native wire format to and from
//! [`UnifiedMessage`]; every other internal boundary (the router, the
//! consumer gateway, persistence) speaks only this type.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A role attached to a [`UnifiedMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// The `type` tag of a [`UnifiedMessage`].
///
/// Drives both router dispatch (§4.3) and outbound framing (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserMessage,
    Assistant,
    Result,
    StatusChange,
    SessionInit,
    SessionLifecycle,
    StreamEvent,
    PermissionRequest,
    PermissionResponse,
    ControlRequest,
    ControlResponse,
    ToolProgress,
    ToolUseSummary,
    AuthStatus,
    ConfigurationChange,
    Interrupt,
    SetModel,
    SetPermissionMode,
    Unknown,
}

/// One piece of message content. `content` on [`UnifiedMessage`] is an
/// ordered sequence of these; translators must never insert gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UnifiedContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image { media_type: String, data: String },
    #[serde(rename = "code")]
    Code { language: String, code: String },
    #[serde(rename = "refusal")]
    Refusal { refusal: String },
}

impl UnifiedContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The first text part's contents, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }
}

/// The canonical message envelope crossing every internal boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    /// Monotonic epoch milliseconds. Callers stamp this; the type itself
    /// does not read the clock (keeps routing logic deterministic/testable).
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub role: Role,
    pub content: Vec<UnifiedContent>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl UnifiedMessage {
    /// Build a fresh message with a newly minted id.
    pub fn new(
        timestamp: i64,
        message_type: MessageType,
        role: Role,
        content: Vec<UnifiedContent>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            message_type,
            role,
            content,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Concatenate all text parts, skipping non-text content — used for
    /// slash-command passthrough interception and transcript previews.
    pub fn all_text(&self) -> String {
        self.content
            .iter()
            .filter_map(UnifiedContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Structural equality ignoring `id`/`timestamp`, used by the router's
    /// assistant-message dedup rule (§4.3, §8).
    pub fn content_eq(&self, other: &Self) -> bool {
        serde_json::to_value(&self.content).ok() == serde_json::to_value(&other.content).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_text_skips_non_text_parts() {
        let msg = UnifiedMessage::new(
            0,
            MessageType::Assistant,
            Role::Assistant,
            vec![
                UnifiedContent::text("hello"),
                UnifiedContent::ToolUse {
                    id: "1".into(),
                    name: "bash".into(),
                    input: Value::Null,
                },
                UnifiedContent::text("world"),
            ],
        );
        assert_eq!(msg.all_text(), "hello\nworld");
    }

    #[test]
    fn content_eq_ignores_id_and_timestamp() {
        let a = UnifiedMessage::new(
            0,
            MessageType::Assistant,
            Role::Assistant,
            vec![UnifiedContent::text("hi")],
        );
        let b = UnifiedMessage::new(
            123,
            MessageType::Assistant,
            Role::Assistant,
            vec![UnifiedContent::text("hi")],
        );
        assert_ne!(a.id, b.id);
        assert!(a.content_eq(&b));
    }

    #[test]
    fn content_eq_detects_difference() {
        let a = UnifiedMessage::new(
            0,
            MessageType::Assistant,
            Role::Assistant,
            vec![UnifiedContent::text("hi")],
        );
        let b = UnifiedMessage::new(
            0,
            MessageType::Assistant,
            Role::Assistant,
            vec![UnifiedContent::text("bye")],
        );
        assert!(!a.content_eq(&b));
    }
}
