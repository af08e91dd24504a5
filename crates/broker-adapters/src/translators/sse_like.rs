//! Translator for HTTP/SSE-style remote backends: each `data:` payload is
//! a JSON delta or a `[DONE]` sentinel, OpenAI-Responses-API style.

use broker_domain::{MessageType, Result, Role, UnifiedContent, UnifiedMessage};
use serde_json::{json, Value};

#[derive(Default)]
pub struct SseLikeTranslator {
    pending_text: String,
    /// Whether a `message_start` stream event has already been emitted for
    /// the turn in progress — reset on `[DONE]` so the next turn gets its
    /// own start event.
    started: bool,
    now: fn() -> i64,
}

impl SseLikeTranslator {
    pub fn new(clock: fn() -> i64) -> Self {
        Self {
            pending_text: String::new(),
            started: false,
            now: clock,
        }
    }

    fn stream_event(&self, inner_event_type: &str, raw: &Value) -> UnifiedMessage {
        UnifiedMessage::new((self.now)(), MessageType::StreamEvent, Role::Assistant, vec![])
            .with_metadata("inner_event_type", inner_event_type)
            .with_metadata("raw", raw.clone())
    }

    /// Parse a single `data:` payload (already stripped of the `data:`
    /// prefix) into zero or more unified messages.
    pub fn parse_data_line(&mut self, data: &str) -> Result<Vec<UnifiedMessage>> {
        if data == "[DONE]" {
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
            self.started = false;
            return Ok(out);
        }

        let value: Value = serde_json::from_str(data).map_err(broker_domain::Error::Json)?;
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(self.stream_event("message_start", &value));
        }
        if let Some(delta) = value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            self.pending_text.push_str(delta);
            out.push(self.stream_event("content_block_delta", &value));
        }
        Ok(out)
    }
}

impl super::Translator for SseLikeTranslator {
    fn to_unified(&mut self, raw: &Value) -> Result<Vec<UnifiedMessage>> {
        // The HTTP adapter already splits `data:` lines before handing
        // them to the translator; `raw` arrives pre-parsed as a single
        // payload object (or the `"[DONE]"` string wrapped as JSON).
        if let Some(sentinel) = raw.as_str() {
            return self.parse_data_line(sentinel);
        }
        self.parse_data_line(&raw.to_string())
    }

    fn from_unified(&self, message: &UnifiedMessage) -> Value {
        match message.message_type {
            MessageType::ControlRequest => json!({
                "role": "control",
                "subtype": message.metadata_str("subtype"),
                "request_id": message.metadata_str("request_id"),
            }),
            MessageType::PermissionResponse => json!({
                "role": "control",
                "subtype": "can_use_tool",
                "request_id": message.metadata_str("request_id"),
                "approved": message.metadata.get("approved"),
                "reason": message.metadata_str("reason"),
            }),
            MessageType::Interrupt => json!({ "role": "control", "subtype": "interrupt" }),
            MessageType::SetModel => json!({
                "role": "control",
                "subtype": "set_model",
                "model": message.metadata_str("model"),
            }),
            MessageType::SetPermissionMode => json!({
                "role": "control",
                "subtype": "set_permission_mode",
                "mode": message.metadata_str("permission_mode"),
            }),
            _ => json!({
                "role": "user",
                "content": message.all_text(),
            }),
        }
    }
}

/// Drain complete `\n\n`-delimited SSE events out of `buffer`, returning
/// the `data:` payload of each. Mirrors the forward-adapter's streaming
/// read loop; kept standalone so it can be unit tested without a live
/// HTTP response.
pub fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_clock() -> i64 {
        0
    }

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"hello\":\"world\"}\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["{\"hello\":\"world\"}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_partial_event_stays_buffered() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["complete"]);
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn accumulates_delta_text_and_flushes_on_done() {
        let mut t = SseLikeTranslator::new(fixed_clock);
        let out = t
            .parse_data_line(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].metadata_str("inner_event_type"), Some("message_start"));
        assert_eq!(out[1].metadata_str("inner_event_type"), Some("content_block_delta"));

        let out = t
            .parse_data_line(r#"{"choices":[{"delta":{"content":"lo"}}]}"#)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].metadata_str("inner_event_type"), Some("content_block_delta"));

        let out = t.parse_data_line("[DONE]").unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].all_text(), "Hello");
        assert_eq!(out[1].message_type, MessageType::Result);
    }

    #[test]
    fn message_start_is_only_emitted_once_per_turn() {
        let mut t = SseLikeTranslator::new(fixed_clock);
        t.parse_data_line(r#"{"choices":[{"delta":{"content":"a"}}]}"#).unwrap();
        t.parse_data_line("[DONE]").unwrap();
        let out = t
            .parse_data_line(r#"{"choices":[{"delta":{"content":"b"}}]}"#)
            .unwrap();
        assert_eq!(out[0].metadata_str("inner_event_type"), Some("message_start"));
    }

    #[test]
    fn from_unified_dispatches_permission_response_to_control_shape() {
        let t = SseLikeTranslator::new(fixed_clock);
        let msg = UnifiedMessage::new(0, MessageType::PermissionResponse, Role::System, vec![])
            .with_metadata("request_id", "req-1")
            .with_metadata("approved", true);
        let native = t.from_unified(&msg);
        assert_eq!(native["role"], "control");
        assert_eq!(native["subtype"], "can_use_tool");
        assert_eq!(native["approved"], true);
    }

    #[test]
    fn from_unified_wraps_plain_user_messages() {
        let t = SseLikeTranslator::new(fixed_clock);
        let msg = UnifiedMessage::new(0, MessageType::UserMessage, Role::User, vec![UnifiedContent::text("hi")]);
        let native = t.from_unified(&msg);
        assert_eq!(native["role"], "user");
        assert_eq!(native["content"], "hi");
    }
}
