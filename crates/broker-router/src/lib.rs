//! The Unified Message Router (§4.3): the single place that decides what
//! a backend-originated [`UnifiedMessage`] means for a session's state and
//! what, if anything, consumers should be told about it.

use std::sync::Arc;

use broker_domain::{LifecycleSignal, MessageType, UnifiedMessage};
use broker_protocol::OutboundMessage;
use broker_sessions::{PermissionDecision, Session};

/// Route one backend message against `session`, mutating its state/history
/// as needed and returning the outbound frames consumers should receive.
/// Returns an empty vec when the message is fully absorbed (a dedup'd
/// duplicate, an unrecognized frame) with nothing to broadcast.
pub fn route_backend_message(session: &Arc<Session>, message: UnifiedMessage) -> Vec<OutboundMessage> {
    match message.message_type {
        MessageType::SessionInit => {
            session.apply_lifecycle_signal(LifecycleSignal::BackendConnected);

            // §4.3 "session_init": capture the backend-assigned session id
            // for resume, and seed `SessionState` from whatever the
            // adapter's translator attached to this frame's metadata
            // (cwd, model, tools, mcp_servers, slash_commands, skills).
            if let Some(backend_session_id) = message.metadata_str("session_id") {
                session.set_backend_session_id(backend_session_id.to_string());
                broker_domain::TraceEvent::BackendSessionId {
                    session_id: session.session_id.clone(),
                    backend_session_id: backend_session_id.to_string(),
                }
                .emit();
            }

            let mut state = session.state_snapshot();
            if let Some(cwd) = message.metadata_str("cwd") {
                state.cwd = Some(cwd.to_string());
            }
            if let Some(model) = message.metadata_str("model") {
                state.model = Some(model.to_string());
            }
            if let Some(version) = message.metadata_str("version") {
                state.version = Some(version.to_string());
            }
            let string_list = |key: &str| {
                message
                    .metadata
                    .get(key)
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>())
            };
            if let Some(tools) = string_list("tools") {
                state.tools = tools;
            }
            if let Some(mcp_servers) = string_list("mcp_servers") {
                state.mcp_servers = mcp_servers;
            }
            if let Some(slash_commands) = string_list("slash_commands") {
                state.slash_commands = slash_commands;
            }
            if let Some(skills) = string_list("skills") {
                state.skills = skills;
            }
            session.update_state(state.clone());

            // §4.6: the per-session slash registry is rebuilt on every
            // session_init, cleared and repopulated from the fresh state.
            session.slash_commands.set_backend_commands(state.slash_commands.clone());

            vec![OutboundMessage::SessionInit {
                session_id: session.session_id.clone(),
                protocol_version: broker_protocol::PROTOCOL_VERSION,
                state: session.state_snapshot(),
            }]
        }

        MessageType::StatusChange => {
            // §4.3 "status_change": broadcast whatever status the backend
            // reported verbatim; only an actual `idle` drives the lifecycle
            // to Idle and is eligible to release the follow-up queue
            // (`SessionManager::ingest` gates on this exact status string).
            let status = message.metadata_str("status").unwrap_or("idle").to_string();
            if status == "idle" {
                session.apply_lifecycle_signal(LifecycleSignal::StatusIdle);
            }
            let mut out = vec![OutboundMessage::StatusChange { status }];
            if let Some(mode) = message.metadata_str("permission_mode") {
                let mut state = session.state_snapshot();
                state.permission_mode = Some(mode.to_string());
                if let Some(patch) = session.update_state(state) {
                    out.push(OutboundMessage::SessionUpdate {
                        session_id: session.session_id.clone(),
                        patch,
                    });
                }
            }
            out
        }

        MessageType::Assistant => {
            // Dedup rule (§4.3, §8): a structurally identical repeat of the
            // last history entry is dropped rather than re-broadcast; a
            // same-`message_id` entry with different content (a streamed
            // message's final form) replaces the earlier partial in place
            // instead of appending a second entry.
            if session.duplicates_last(&message) {
                tracing::debug!(session_id = %session.session_id, "dropping duplicate assistant message");
                return Vec::new();
            }
            session.push_or_replace_assistant(message.clone());
            vec![OutboundMessage::Assistant { message }]
        }

        MessageType::Result => {
            // Open question (§9): a `result` forces lastStatus=idle
            // unconditionally, even if a stray stream_event raced it.
            session.apply_lifecycle_signal(LifecycleSignal::StatusIdle);

            // §4.3 "result": num_turns==1 && !is_error marks the first
            // completed turn — emitted once, before this result is pushed
            // into history, so "first" still means the first user message.
            let num_turns = message.metadata.get("num_turns").and_then(serde_json::Value::as_i64);
            let is_error = message
                .metadata
                .get("is_error")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if num_turns == Some(1) && !is_error {
                broker_domain::TraceEvent::SessionFirstTurnCompleted {
                    session_id: session.session_id.clone(),
                }
                .emit();
            }

            session.push_history(message.clone());
            session.drain_team_buffer();
            vec![
                OutboundMessage::Result { message },
                OutboundMessage::StatusChange { status: "idle".to_string() },
            ]
        }

        MessageType::StreamEvent => {
            // §4.3 "stream_event": the lifecycle only jumps back to Active
            // on the inner event that actually starts a top-level assistant
            // turn — a `message_start` nested inside a tool call
            // (`parent_tool_use_id` present) doesn't count. The raw event is
            // always broadcast regardless.
            let is_turn_start = message.metadata_str("inner_event_type") == Some("message_start")
                && !message.metadata.contains_key("parent_tool_use_id");
            if is_turn_start {
                session.apply_lifecycle_signal(LifecycleSignal::StreamActive);
            }
            vec![OutboundMessage::StreamEvent {
                event: serde_json::to_value(&message).unwrap_or(serde_json::Value::Null),
            }]
        }

        MessageType::PermissionRequest => {
            // §4.3: only a `can_use_tool` control request is a permission
            // prompt — other subtypes under this message type are reserved
            // and otherwise ignored.
            if message.metadata_str("subtype") != Some("can_use_tool") {
                return Vec::new();
            }
            let tool_name = message
                .metadata_str("tool_name")
                .unwrap_or_default()
                .to_string();
            let input = message
                .metadata
                .get("input")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let (request_id, rx, info) =
                session
                    .permissions
                    .request(session.session_id.clone(), tool_name.clone(), input.clone());
            // Stashed here so the session manager can await it and relay
            // the eventual decision back to the backend's `canUseTool` call
            // (§4.8 step 3) once this frame reaches `ingest`.
            session.stash_permission_waiter(request_id, rx);
            broker_domain::TraceEvent::PermissionRequested {
                session_id: session.session_id.clone(),
                request_id: request_id.to_string(),
                tool_name,
            }
            .emit();
            vec![OutboundMessage::PermissionRequest {
                request_id: info.request_id.to_string(),
                tool_name: info.tool_name,
                input: info.input,
            }]
        }

        MessageType::ToolProgress => {
            let tool_use_id = message.metadata_str("tool_use_id").unwrap_or_default().to_string();
            vec![OutboundMessage::ToolProgress {
                tool_use_id,
                progress: serde_json::to_value(&message.content).unwrap_or(serde_json::Value::Null),
            }]
        }

        MessageType::ToolUseSummary => {
            let tool_use_id = message.metadata_str("tool_use_id").unwrap_or_default().to_string();
            // §4.3: dedup by tool_use_id in addition to the generic
            // assistant-message dedup — a backend that redelivers the same
            // summary (e.g. after a reconnect) must not double-broadcast it.
            if !tool_use_id.is_empty() && !session.note_tool_summary_seen(&tool_use_id) {
                tracing::debug!(session_id = %session.session_id, tool_use_id, "dropping duplicate tool_use_summary");
                return Vec::new();
            }
            vec![OutboundMessage::ToolUseSummary {
                tool_use_id,
                summary: message.all_text(),
            }]
        }

        MessageType::AuthStatus => {
            let authenticated = message
                .metadata
                .get("authenticated")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            broker_domain::TraceEvent::AuthStatus {
                session_id: session.session_id.clone(),
                authenticated,
            }
            .emit();
            vec![OutboundMessage::AuthStatus {
                authenticated,
                detail: (!message.all_text().is_empty()).then(|| message.all_text()),
            }]
        }

        MessageType::ControlResponse => {
            // §4.7: the reply to the initialize handshake dispatched by
            // the gateway on session_init. A `request_id` that doesn't
            // match the session's pending handshake is a late or
            // duplicate reply and is dropped.
            let request_id = message.metadata_str("request_id").and_then(|s| uuid::Uuid::parse_str(s).ok());
            let Some(request_id) = request_id else {
                return Vec::new();
            };
            if !session.clear_pending_initialize_if(request_id) {
                return Vec::new();
            }
            let commands = message
                .metadata
                .get("commands")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let models = message
                .metadata
                .get("models")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let account = message.metadata_str("account").map(str::to_string);
            let caps = broker_domain::Capabilities { commands: commands.clone(), models, account };
            session.resolve_capabilities(caps.clone());
            session.slash_commands.set_backend_commands(commands);

            let mut state = session.state_snapshot();
            state.capabilities = Some(caps.clone());
            let patch = session.update_state(state);

            let mut out = vec![OutboundMessage::CapabilitiesReady { capabilities: caps }];
            if let Some(patch) = patch {
                out.push(OutboundMessage::SessionUpdate {
                    session_id: session.session_id.clone(),
                    patch,
                });
            }
            out
        }

        MessageType::UserMessage => {
            // §4.6 tier 3: a backend-echoed user_message completes the
            // oldest pending native-passthrough slash command, if any.
            // Anything else (an actual user message bouncing back through
            // a backend that echoes its input) is absorbed silently —
            // the consumer gateway already broadcast the outgoing copy.
            match session.pop_passthrough() {
                Some(descriptor) => {
                    let raw = message.all_text();
                    let output = broker_sessions::strip_local_command_stdout(&raw);
                    vec![OutboundMessage::SlashCommandResult {
                        command: descriptor.command,
                        output,
                        source: "cli".to_string(),
                    }]
                }
                None => Vec::new(),
            }
        }

        MessageType::SessionLifecycle => {
            vec![OutboundMessage::SessionLifecycle {
                state: format!("{:?}", session.lifecycle()),
            }]
        }

        MessageType::ConfigurationChange => {
            let mut state = session.state_snapshot();
            if let Some(model) = message.metadata_str("model") {
                state.model = Some(model.to_string());
            }
            if let Some(mode) = message.metadata_str("permission_mode") {
                state.permission_mode = Some(mode.to_string());
            }
            match session.update_state(state) {
                Some(patch) => vec![OutboundMessage::SessionUpdate {
                    session_id: session.session_id.clone(),
                    patch,
                }],
                None => Vec::new(),
            }
        }

        _ => {
            tracing::trace!(
                session_id = %session.session_id,
                message_type = ?message.message_type,
                "no routing rule for message type, dropping"
            );
            Vec::new()
        }
    }
}

/// Resolve a consumer's `permission_response` against the session's
/// pending request. Returns `false` if the request was already resolved
/// or never existed (late/duplicate response).
pub fn resolve_permission_response(
    session: &Arc<Session>,
    request_id: uuid::Uuid,
    approved: bool,
    reason: Option<String>,
    always_allow: bool,
) -> bool {
    let decision = if approved {
        PermissionDecision::Approved { always_allow }
    } else {
        PermissionDecision::Denied { reason: reason.clone() }
    };
    let resolved = session.permissions.resolve(&request_id, decision);
    if resolved {
        broker_domain::TraceEvent::PermissionResolved {
            session_id: session.session_id.clone(),
            request_id: request_id.to_string(),
            outcome: if approved { "approved".into() } else { "denied".into() },
        }
        .emit();
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::{Role, UnifiedContent};

    fn session() -> Arc<Session> {
        Arc::new(Session::new("sid".into(), "skey".into(), 50))
    }

    fn assistant_msg(text: &str) -> UnifiedMessage {
        UnifiedMessage::new(
            0,
            MessageType::Assistant,
            Role::Assistant,
            vec![UnifiedContent::text(text)],
        )
    }

    #[test]
    fn session_init_transitions_lifecycle_to_active() {
        let session = session();
        let init = UnifiedMessage::new(0, MessageType::SessionInit, Role::System, vec![]);
        let out = route_backend_message(&session, init);
        assert_eq!(out.len(), 1);
        assert_eq!(session.lifecycle(), broker_domain::LifecycleState::Active);
    }

    #[test]
    fn session_init_seeds_state_and_slash_registry_from_metadata() {
        let session = session();
        let mut init = UnifiedMessage::new(0, MessageType::SessionInit, Role::System, vec![]);
        init.metadata.insert("session_id".into(), "backend-42".into());
        init.metadata.insert("cwd".into(), "/workspace/app".into());
        init.metadata.insert("model".into(), "claude-opus".into());
        init.metadata.insert("slash_commands".into(), serde_json::json!(["review"]));
        route_backend_message(&session, init);

        assert_eq!(session.backend_session_id().as_deref(), Some("backend-42"));
        let state = session.state_snapshot();
        assert_eq!(state.cwd.as_deref(), Some("/workspace/app"));
        assert_eq!(state.model.as_deref(), Some("claude-opus"));
        assert_eq!(
            session.slash_commands.resolve("review"),
            broker_sessions::SlashCommandSource::Backend
        );
    }

    #[test]
    fn duplicate_assistant_message_is_dropped() {
        let session = session();
        let first = route_backend_message(&session, assistant_msg("hi"));
        assert_eq!(first.len(), 1);
        let second = route_backend_message(&session, assistant_msg("hi"));
        assert!(second.is_empty());
    }

    #[test]
    fn assistant_message_with_same_message_id_replaces_in_place() {
        let session = session();
        let mut first = assistant_msg("partial");
        first.metadata.insert("message_id".into(), "m1".into());
        route_backend_message(&session, first);

        let mut second = assistant_msg("final answer");
        second.metadata.insert("message_id".into(), "m1".into());
        route_backend_message(&session, second);

        let history = session.history_snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].all_text(), "final answer");
    }

    #[test]
    fn result_message_forces_idle_and_emits_status_change() {
        let session = session();
        route_backend_message(&session, UnifiedMessage::new(0, MessageType::SessionInit, Role::System, vec![]));
        let result_msg = UnifiedMessage::new(0, MessageType::Result, Role::Assistant, vec![]);
        let out = route_backend_message(&session, result_msg);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], OutboundMessage::StatusChange { ref status } if status == "idle"));
    }

    #[test]
    fn result_with_multiple_turns_does_not_emit_first_turn_completed() {
        // Nothing to assert on the trace event directly (it only reaches
        // `tracing`), but a `num_turns:2` result must still route and
        // force idle like any other result — regression guard for the
        // num_turns==1 guard not swallowing other results.
        let session = session();
        let mut result_msg = UnifiedMessage::new(0, MessageType::Result, Role::Assistant, vec![]);
        result_msg.metadata.insert("num_turns".into(), 2.into());
        let out = route_backend_message(&session, result_msg);
        assert_eq!(out.len(), 2);
    }

    fn can_use_tool_request() -> UnifiedMessage {
        let mut request = UnifiedMessage::new(0, MessageType::PermissionRequest, Role::Assistant, vec![]);
        request.metadata.insert("subtype".into(), "can_use_tool".into());
        request.metadata.insert("tool_name".into(), "bash".into());
        request
    }

    #[test]
    fn permission_request_registers_with_the_bridge() {
        let session = session();
        let out = route_backend_message(&session, can_use_tool_request());
        assert_eq!(out.len(), 1);
        assert_eq!(session.permissions.list_pending().len(), 1);
    }

    #[test]
    fn permission_request_with_other_subtype_is_ignored() {
        let session = session();
        let mut request = UnifiedMessage::new(0, MessageType::PermissionRequest, Role::Assistant, vec![]);
        request.metadata.insert("tool_name".into(), "bash".into());
        let out = route_backend_message(&session, request);
        assert!(out.is_empty());
        assert!(session.permissions.list_pending().is_empty());
    }

    #[test]
    fn resolve_permission_response_resolves_the_bridge_entry() {
        let session = session();
        route_backend_message(&session, can_use_tool_request());
        let info = &session.permissions.list_pending()[0];
        let resolved = resolve_permission_response(&session, info.request_id, true, None, false);
        assert!(resolved);
        assert!(session.permissions.list_pending().is_empty());
    }

    #[test]
    fn control_response_resolves_pending_handshake_and_seeds_slash_commands() {
        let session = session();
        let request_id = session.begin_capabilities_handshake().expect("handshake claimed");
        let (waiter, announcer) = broker_sessions::capabilities_pair();
        session.set_capabilities_announcer(announcer);

        let mut response = UnifiedMessage::new(0, MessageType::ControlResponse, Role::System, vec![]);
        response.metadata.insert("request_id".into(), request_id.to_string().into());
        response.metadata.insert("commands".into(), serde_json::json!(["review"]));
        response.metadata.insert("account".into(), "me@example.com".into());

        let out = route_backend_message(&session, response);
        assert!(matches!(out[0], OutboundMessage::CapabilitiesReady { .. }));
        assert_eq!(session.slash_commands.resolve("review"), broker_sessions::SlashCommandSource::Backend);
        drop(waiter);
    }

    #[test]
    fn user_message_completes_pending_passthrough() {
        let session = session();
        session.push_passthrough(broker_sessions::PassthroughDescriptor {
            command: "status".into(),
            request_id: None,
            slash_request_id: "r1".into(),
            started_at_ms: 0,
        });
        let echo = UnifiedMessage::new(
            0,
            MessageType::UserMessage,
            Role::User,
            vec![UnifiedContent::text("<local-command-stdout>all clear</local-command-stdout>")],
        );
        let out = route_backend_message(&session, echo);
        assert_eq!(out.len(), 1);
        match &out[0] {
            OutboundMessage::SlashCommandResult { command, output, source } => {
                assert_eq!(command, "status");
                assert_eq!(output, "all clear");
                assert_eq!(source, "cli");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_use_summary_dedups_by_id() {
        let session = session();
        let mut summary = UnifiedMessage::new(0, MessageType::ToolUseSummary, Role::Assistant, vec![UnifiedContent::text("done")]);
        summary.metadata.insert("tool_use_id".into(), "t1".into());
        let first = route_backend_message(&session, summary.clone());
        assert_eq!(first.len(), 1);
        let second = route_backend_message(&session, summary);
        assert!(second.is_empty());
    }
}
