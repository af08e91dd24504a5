//! Translator for subprocess CLIs that speak a Claude-Code-style NDJSON
//! protocol on stdout: one JSON object per line, streamed text deltas
//! followed by a terminating `result` frame.

use broker_domain::{MessageType, Result, Role, UnifiedContent, UnifiedMessage};
use serde_json::{json, Value};

/// Accumulates streamed text deltas into a single assistant message,
/// emitted once the backend signals the turn is complete.
#[derive(Default)]
pub struct ClaudeLikeTranslator {
    pending_text: String,
    now: fn() -> i64,
}

impl ClaudeLikeTranslator {
    pub fn new(clock: fn() -> i64) -> Self {
        Self {
            pending_text: String::new(),
            now: clock,
        }
    }

    /// Wrap a raw streamed frame as a `stream_event` carrying the inner
    /// event type plus `parent_tool_use_id` when the frame nests under a
    /// tool call — the router uses both to decide whether this is the
    /// start of a top-level turn (§4.3).
    fn stream_event(&self, inner_event_type: &str, raw: &Value) -> UnifiedMessage {
        let mut event = UnifiedMessage::new(
            (self.now)(),
            MessageType::StreamEvent,
            Role::Assistant,
            vec![],
        )
        .with_metadata("inner_event_type", inner_event_type)
        .with_metadata("raw", raw.clone());
        if let Some(parent) = raw.pointer("/message/parent_tool_use_id").and_then(Value::as_str) {
            event = event.with_metadata("parent_tool_use_id", parent);
        }
        event
    }
}

impl super::Translator for ClaudeLikeTranslator {
    fn to_unified(&mut self, raw: &Value) -> Result<Vec<UnifiedMessage>> {
        let frame_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();

        match frame_type {
            "message_start" => Ok(vec![self.stream_event(frame_type, raw)]),
            "content_block_delta" => {
                if let Some(text) = raw
                    .pointer("/delta/text")
                    .and_then(Value::as_str)
                {
                    self.pending_text.push_str(text);
                }
                Ok(vec![self.stream_event(frame_type, raw)])
            }
            "message_stop" | "result" => {
                let mut out = Vec::new();
                if !self.pending_text.is_empty() {
                    out.push(UnifiedMessage::new(
                        (self.now)(),
                        MessageType::Assistant,
                        Role::Assistant,
                        vec![UnifiedContent::text(std::mem::take(&mut self.pending_text))],
                    ));
                }
                out.push(UnifiedMessage::new(
                    (self.now)(),
                    MessageType::Result,
                    Role::Assistant,
                    vec![],
                ));
                Ok(out)
            }
            "system" if raw.get("subtype").and_then(Value::as_str) == Some("init") => {
                let mut init = UnifiedMessage::new(
                    (self.now)(),
                    MessageType::SessionInit,
                    Role::System,
                    vec![],
                );
                for key in ["session_id", "cwd", "model", "version"] {
                    if let Some(value) = raw.get(key).and_then(Value::as_str) {
                        init = init.with_metadata(key, value);
                    }
                }
                for (raw_key, meta_key) in [
                    ("tools", "tools"),
                    ("mcp_servers", "mcp_servers"),
                    ("slash_commands", "slash_commands"),
                    ("commands", "slash_commands"),
                    ("skills", "skills"),
                ] {
                    if let Some(value) = raw.get(raw_key) {
                        if value.is_array() {
                            init = init.with_metadata(meta_key, value.clone());
                        }
                    }
                }
                Ok(vec![init])
            }
            "tool_use" => {
                let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = raw.get("name").and_then(Value::as_str).unwrap_or_default();
                let input = raw.get("input").cloned().unwrap_or(Value::Null);
                Ok(vec![UnifiedMessage::new(
                    (self.now)(),
                    MessageType::Assistant,
                    Role::Assistant,
                    vec![UnifiedContent::ToolUse {
                        id: id.to_string(),
                        name: name.to_string(),
                        input,
                    }],
                )])
            }
            _ => {
                tracing::trace!(frame_type, "unrecognized claude-like frame, ignoring");
                Ok(Vec::new())
            }
        }
    }

    fn from_unified(&self, message: &UnifiedMessage) -> Value {
        match message.message_type {
            MessageType::ControlRequest => json!({
                "type": "control_request",
                "request_id": message.metadata_str("request_id"),
                "subtype": message.metadata_str("subtype"),
            }),
            MessageType::PermissionResponse => {
                let approved = message
                    .metadata
                    .get("approved")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                json!({
                    "type": "control_response",
                    "response": {
                        "subtype": "can_use_tool",
                        "request_id": message.metadata_str("request_id"),
                        "behavior": if approved { "allow" } else { "deny" },
                        "message": message.metadata_str("reason"),
                    },
                })
            }
            MessageType::Interrupt => json!({
                "type": "control_request",
                "subtype": "interrupt",
            }),
            MessageType::SetModel => json!({
                "type": "control_request",
                "subtype": "set_model",
                "model": message.metadata_str("model"),
            }),
            MessageType::SetPermissionMode => json!({
                "type": "control_request",
                "subtype": "set_permission_mode",
                "mode": message.metadata_str("permission_mode"),
            }),
            _ => json!({
                "type": "user",
                "message": {
                    "role": "user",
                    "content": message
                        .content
                        .iter()
                        .filter_map(UnifiedContent::as_text)
                        .map(|text| json!({ "type": "text", "text": text }))
                        .collect::<Vec<_>>(),
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translators::Translator;
    use serde_json::json;

    fn fixed_clock() -> i64 {
        0
    }

    #[test]
    fn accumulates_deltas_and_flushes_on_message_stop() {
        let mut t = ClaudeLikeTranslator::new(fixed_clock);
        let first = t
            .to_unified(&json!({"type": "content_block_delta", "delta": {"text": "Hel"}}))
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_type, MessageType::StreamEvent);
        assert_eq!(first[0].metadata_str("inner_event_type"), Some("content_block_delta"));

        let second = t
            .to_unified(&json!({"type": "content_block_delta", "delta": {"text": "lo"}}))
            .unwrap();
        assert_eq!(second.len(), 1);

        let out = t.to_unified(&json!({"type": "message_stop"})).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].all_text(), "Hello");
        assert_eq!(out[1].message_type, MessageType::Result);
    }

    #[test]
    fn message_start_produces_a_stream_event_with_no_parent_tool_use_id() {
        let mut t = ClaudeLikeTranslator::new(fixed_clock);
        let out = t.to_unified(&json!({"type": "message_start"})).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_type, MessageType::StreamEvent);
        assert_eq!(out[0].metadata_str("inner_event_type"), Some("message_start"));
        assert!(out[0].metadata_str("parent_tool_use_id").is_none());
    }

    #[test]
    fn message_start_nested_under_a_tool_call_carries_parent_tool_use_id() {
        let mut t = ClaudeLikeTranslator::new(fixed_clock);
        let out = t
            .to_unified(&json!({"type": "message_start", "message": {"parent_tool_use_id": "tool-1"}}))
            .unwrap();
        assert_eq!(out[0].metadata_str("parent_tool_use_id"), Some("tool-1"));
    }

    #[test]
    fn system_init_frame_produces_session_init() {
        let mut t = ClaudeLikeTranslator::new(fixed_clock);
        let out = t
            .to_unified(&json!({"type": "system", "subtype": "init"}))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_type, MessageType::SessionInit);
    }

    #[test]
    fn system_init_frame_carries_session_state_fields_as_metadata() {
        let mut t = ClaudeLikeTranslator::new(fixed_clock);
        let out = t
            .to_unified(&json!({
                "type": "system",
                "subtype": "init",
                "session_id": "backend-123",
                "cwd": "/workspace/app",
                "model": "claude-opus",
                "tools": ["Bash", "Read"],
                "mcp_servers": ["filesystem"],
                "slash_commands": ["review"],
                "skills": ["writer"],
            }))
            .unwrap();
        assert_eq!(out.len(), 1);
        let init = &out[0];
        assert_eq!(init.metadata_str("session_id"), Some("backend-123"));
        assert_eq!(init.metadata_str("cwd"), Some("/workspace/app"));
        assert_eq!(init.metadata_str("model"), Some("claude-opus"));
        assert_eq!(
            init.metadata.get("tools").and_then(|v| v.as_array()).map(Vec::len),
            Some(2)
        );
        assert_eq!(
            init.metadata.get("skills").and_then(|v| v.as_array()).map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn unrecognized_frame_produces_nothing() {
        let mut t = ClaudeLikeTranslator::new(fixed_clock);
        let out = t.to_unified(&json!({"type": "ping"})).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn from_unified_wraps_text_as_user_content() {
        let t = ClaudeLikeTranslator::new(fixed_clock);
        let msg = UnifiedMessage::new(
            0,
            MessageType::UserMessage,
            Role::User,
            vec![UnifiedContent::text("hi")],
        );
        let native = t.from_unified(&msg);
        assert_eq!(native["type"], "user");
        assert_eq!(native["message"]["content"][0]["text"], "hi");
    }

    #[test]
    fn from_unified_dispatches_permission_response_to_control_response() {
        let t = ClaudeLikeTranslator::new(fixed_clock);
        let msg = UnifiedMessage::new(0, MessageType::PermissionResponse, Role::System, vec![])
            .with_metadata("request_id", "req-1")
            .with_metadata("approved", true);
        let native = t.from_unified(&msg);
        assert_eq!(native["type"], "control_response");
        assert_eq!(native["response"]["subtype"], "can_use_tool");
        assert_eq!(native["response"]["behavior"], "allow");
    }

    #[test]
    fn from_unified_dispatches_control_request_initialize() {
        let t = ClaudeLikeTranslator::new(fixed_clock);
        let msg = UnifiedMessage::new(0, MessageType::ControlRequest, Role::System, vec![])
            .with_metadata("subtype", "initialize")
            .with_metadata("request_id", "req-2");
        let native = t.from_unified(&msg);
        assert_eq!(native["type"], "control_request");
        assert_eq!(native["subtype"], "initialize");
    }

    #[test]
    fn from_unified_dispatches_set_model() {
        let t = ClaudeLikeTranslator::new(fixed_clock);
        let msg = UnifiedMessage::new(0, MessageType::SetModel, Role::System, vec![])
            .with_metadata("model", "claude-opus");
        let native = t.from_unified(&msg);
        assert_eq!(native["subtype"], "set_model");
        assert_eq!(native["model"], "claude-opus");
    }
}
