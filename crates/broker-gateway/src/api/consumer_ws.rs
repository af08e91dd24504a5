//! Consumer Gateway (§4.4): the WebSocket a browser/editor client
//! connects to for one session. Grounded on the node transport's upgrade
//! handler, generalized from "one socket per node" to "N consumer
//! sockets fanned out from one session's broadcast hub".

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use broker_domain::{LifecycleSignal, LifecycleState, MessageType, Role, UnifiedContent, UnifiedMessage};
use broker_protocol::{InboundMessage, OutboundMessage};
use broker_sessions::Session;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::authenticate_with_timeout;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConsumerQuery {
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub participant: bool,
    pub adapter: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Oversized-inbound-frame threshold (§6 close code `1009`), distinct from
/// the inverted-transport's frame ceiling in `broker_protocol::transport` —
/// this one guards consumer input specifically.
const MAX_INBOUND_FRAME_BYTES: usize = 256 * 1024;

/// A frame destined for exactly one consumer socket, bypassing the
/// per-session broadcast — an offender-only error, or a coded close.
enum ConsumerFrame {
    Outbound(OutboundMessage),
    Close { code: u16, reason: String },
}

/// GET /v1/sessions/:session_key/ws — upgrade to the consumer WebSocket.
pub async fn consumer_ws(
    ws: WebSocketUpgrade,
    Path(session_key): Path<String>,
    Query(query): Query<ConsumerQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !state.token_matches(query.token.as_deref().unwrap_or("")) {
        return (axum::http::StatusCode::UNAUTHORIZED, "invalid or missing API token").into_response();
    }

    let adapter_name = query
        .adapter
        .unwrap_or_else(|| state.default_adapter.to_string());

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, session_key, query.token, query.participant, adapter_name)
    })
    .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_key: String,
    token: Option<String>,
    participant: bool,
    adapter_name: String,
) {
    let (mut sink, mut stream) = socket.split();

    // §4.4/§5: authenticateAsync races a timeout, cancelled early if the
    // socket closes before either resolves. A default-configured broker's
    // `AnonymousAuthenticator` never actually loses the race, but every
    // connection still goes through the same timeout/cancel plumbing a real
    // identity provider would.
    let auth_timeout_ms = state.config.auth_timeout_ms;
    let identity = authenticate_with_timeout(
        state.authenticator.as_ref(),
        token.as_deref(),
        auth_timeout_ms,
        async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
        },
    )
    .await;
    let Some(identity) = identity else {
        let _ = send(&mut sink, &OutboundMessage::Error {
            message: "authentication failed or timed out".into(),
            code: Some("auth_failed".into()),
        })
        .await;
        let _ = sink
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 4401,
                reason: "authentication failed or timed out".into(),
            })))
            .await;
        return;
    };
    let user_id = identity.user_id;

    let (session, _is_new) = state.sessions.resolve_or_create(&session_key);

    if session.adapter_binding().is_none() {
        if let Err(e) = state
            .manager
            .ensure_forward_adapter(&session, &adapter_name, None)
            .await
        {
            tracing::warn!(session_key = %session_key, error = %e, "failed to start backend adapter");
            let _ = send(&mut sink, &OutboundMessage::ResumeFailed { reason: e.to_string() }).await;
            return;
        }
    }

    let rate_limit = &state.config.consumer_message_rate_limit;
    let consumer_handle = session.add_consumer(
        user_id.clone(),
        participant,
        rate_limit.tokens_per_second,
        rate_limit.burst_size,
    );
    state.sessions.touch(&session_key);

    let mut broadcasts = state.manager.hub().subscribe(&session_key);

    if send(&mut sink, &OutboundMessage::Identity {
        user_id: user_id.clone(),
        role: if participant { "participant".into() } else { "observer".into() },
    })
    .await
    .is_err()
    {
        session.remove_consumer(consumer_handle);
        return;
    }

    let state_snapshot = session.state_snapshot();
    let _ = send(&mut sink, &OutboundMessage::SessionInit {
        session_id: session.session_id.clone(),
        protocol_version: broker_protocol::PROTOCOL_VERSION,
        state: state_snapshot.clone(),
    })
    .await;
    // §4.4 replay order: `session_init` carries no inline history any more —
    // the backlog rides its own `message_history` frame immediately after.
    let _ = send(&mut sink, &OutboundMessage::MessageHistory {
        session_id: session.session_id.clone(),
        messages: session.history_snapshot(),
    })
    .await;

    // Replay (§4.4): capabilities (if already known), pending permission
    // requests (participants only), the current queued message, presence,
    // then the live backend-connection state — in that exact order, to
    // this socket alone.
    if let Some(capabilities) = state_snapshot.capabilities.clone() {
        let _ = send(&mut sink, &OutboundMessage::CapabilitiesReady { capabilities }).await;
    }
    if participant {
        for pending in session.permissions.list_pending() {
            let _ = send(&mut sink, &OutboundMessage::PermissionRequest {
                request_id: pending.request_id.to_string(),
                tool_name: pending.tool_name,
                input: pending.input,
            })
            .await;
        }
    }
    if let Some(queued) = session.queue.peek() {
        let _ = send(&mut sink, &OutboundMessage::MessageQueued { text: queued.text }).await;
    }
    let _ = send(&mut sink, &OutboundMessage::PresenceUpdate {
        participants: session.participant_ids(),
        observers: session.observer_ids(),
    })
    .await;
    if let Some(binding) = session.adapter_binding() {
        let _ = send(&mut sink, &OutboundMessage::CliConnected { adapter_name: binding.adapter_name }).await;
    } else {
        let _ = send(&mut sink, &OutboundMessage::CliDisconnected { reason: None }).await;
        // §4.4: replaying `cli_disconnected` additionally raises a
        // relaunch-needed signal — there is no backend dialed into this
        // session yet for the reconnect watchdog/launcher to act on.
        broker_domain::TraceEvent::BackendRelaunchNeeded {
            session_id: session.session_id.clone(),
        }
        .emit();
    }

    broker_domain::TraceEvent::ConsumerAttached {
        session_id: session.session_id.clone(),
        user_id: user_id.clone(),
        role: if participant { "participant".into() } else { "observer".into() },
    }
    .emit();
    tracing::info!(session_id = %session.session_id, user_id = %user_id, participant, "consumer attached");

    // A small unicast channel alongside the broadcast subscription, for
    // frames meant for this socket alone (authorization/rate-limit errors,
    // a coded close) that must not go out to every other attached consumer.
    let (unicast_tx, mut unicast_rx) = mpsc::channel::<ConsumerFrame>(8);

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                received = broadcasts.recv() => {
                    match received {
                        Ok(frame) => {
                            if frame.participants_only() && !participant {
                                continue;
                            }
                            if send(&mut sink, &frame).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "consumer socket lagged behind the session broadcast");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                frame = unicast_rx.recv() => {
                    match frame {
                        Some(ConsumerFrame::Outbound(frame)) => {
                            if send(&mut sink, &frame).await.is_err() {
                                break;
                            }
                        }
                        Some(ConsumerFrame::Close { code, reason }) => {
                            let _ = sink
                                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        None => {}
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                if text.len() > MAX_INBOUND_FRAME_BYTES {
                    tracing::warn!(session_id = %session.session_id, user_id = %user_id, len = text.len(), "oversized consumer frame, closing");
                    let _ = unicast_tx
                        .send(ConsumerFrame::Close { code: 1009, reason: "frame too large".into() })
                        .await;
                    break;
                }
                match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(inbound) => {
                        // Every inbound type is participant-only except
                        // `presence_query` (§6 "all participant-only except
                        // where noted"); an observer sending anything else
                        // gets an `error` frame to itself, not a broadcast.
                        if !participant && !matches!(inbound, InboundMessage::PresenceQuery) {
                            broker_domain::TraceEvent::ConsumerAuthorizationDenied {
                                session_id: session.session_id.clone(),
                                user_id: user_id.clone(),
                                message_type: inbound.type_name().to_string(),
                            }
                            .emit();
                            let _ = unicast_tx
                                .send(ConsumerFrame::Outbound(OutboundMessage::Error {
                                    message: "observers cannot send this message type".into(),
                                    code: Some("authorization_denied".into()),
                                }))
                                .await;
                        } else {
                            handle_inbound(&state, &session, &user_id, consumer_handle, inbound, &unicast_tx).await;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring unparseable consumer frame");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
        state.sessions.touch(&session_key);
    }

    writer.abort();
    session.remove_consumer(consumer_handle);
    broker_domain::TraceEvent::ConsumerRemoved {
        session_id: session.session_id.clone(),
        user_id: user_id.clone(),
    }
    .emit();
    tracing::info!(session_id = %session.session_id, user_id = %user_id, "consumer detached");
}

async fn handle_inbound(
    state: &AppState,
    session: &Arc<Session>,
    user_id: &str,
    consumer_handle: broker_sessions::ConsumerHandle,
    inbound: InboundMessage,
    unicast: &mpsc::Sender<ConsumerFrame>,
) {
    match inbound {
        InboundMessage::UserMessage { text, attachments } => {
            if !session.try_consume_rate_limit(consumer_handle) {
                // Rate-limit errors go to the offender only (§7
                // "RateLimited"), never broadcast to every consumer.
                broker_domain::TraceEvent::ConsumerRateLimited {
                    session_id: session.session_id.clone(),
                    user_id: user_id.to_string(),
                }
                .emit();
                let _ = unicast
                    .send(ConsumerFrame::Outbound(OutboundMessage::Error {
                        message: "rate limit exceeded".into(),
                        code: Some("rate_limited".into()),
                    }))
                    .await;
                return;
            }

            let mut message = UnifiedMessage::new(
                Utc::now().timestamp_millis(),
                MessageType::UserMessage,
                Role::User,
                vec![UnifiedContent::text(text)],
            );
            if let Some(attachments) = attachments {
                message = message.with_metadata("attachments", serde_json::json!(attachments));
            }
            message = message.with_metadata("user_id", user_id.to_string());

            session.push_history(message.clone());
            // Optimistic marking (§4.5): flip to "running" immediately so a
            // `queue_message` arriving before the backend's first
            // `message_start` still sees a non-idle session.
            session.apply_lifecycle_signal(LifecycleSignal::StreamActive);
            state.manager.hub().publish(
                &session.session_key,
                OutboundMessage::UserMessage { message: message.clone() },
            );

            // Buffer rather than error when no backend connection exists
            // yet (§3 "Pending" `pendingMessages`) — an inverted adapter
            // that hasn't dialed back in still gets this message once it
            // does, via `attachBackendConnection`'s FIFO flush.
            state.manager.send_or_buffer(session, message).await;
        }

        InboundMessage::PermissionResponse { request_id, approved, reason, always_allow } => {
            let Ok(request_id) = Uuid::parse_str(&request_id) else {
                return;
            };
            let resolved = broker_router::resolve_permission_response(session, request_id, approved, reason, always_allow);
            if resolved {
                state.manager.hub().publish(
                    &session.session_key,
                    OutboundMessage::PermissionCancelled { request_id: request_id.to_string() },
                );
            }
        }

        InboundMessage::Interrupt => {
            let message = UnifiedMessage::new(Utc::now().timestamp_millis(), MessageType::Interrupt, Role::User, vec![]);
            state.manager.send_to_backend(&session.session_key, message).await;
        }

        InboundMessage::SetModel { model } => {
            let message = UnifiedMessage::new(Utc::now().timestamp_millis(), MessageType::SetModel, Role::User, vec![])
                .with_metadata("model", model);
            state.manager.send_to_backend(&session.session_key, message).await;
        }

        InboundMessage::SetPermissionMode { mode } => {
            let message = UnifiedMessage::new(Utc::now().timestamp_millis(), MessageType::SetPermissionMode, Role::User, vec![])
                .with_metadata("permission_mode", mode);
            state.manager.send_to_backend(&session.session_key, message).await;
        }

        InboundMessage::PresenceQuery => {
            state.manager.hub().publish(
                &session.session_key,
                OutboundMessage::PresenceUpdate {
                    participants: session.participant_ids(),
                    observers: session.observer_ids(),
                },
            );
        }

        InboundMessage::SlashCommand { command, args } => {
            handle_slash_command(state, session, &command, args).await;
        }

        InboundMessage::QueueMessage { text } => {
            // Only stage behind the single-slot queue while a turn is in
            // flight (§4.5); an idle session sends immediately instead of
            // waiting for a release that will never come.
            if session.lifecycle() == LifecycleState::Idle {
                let message = UnifiedMessage::new(
                    Utc::now().timestamp_millis(),
                    MessageType::UserMessage,
                    Role::User,
                    vec![UnifiedContent::text(text)],
                )
                .with_metadata("user_id", user_id.to_string());
                session.push_history(message.clone());
                session.apply_lifecycle_signal(LifecycleSignal::StreamActive);
                state.manager.hub().publish(
                    &session.session_key,
                    OutboundMessage::UserMessage { message: message.clone() },
                );
                state.manager.send_to_backend(&session.session_key, message).await;
            } else {
                session.queue.queue(user_id.to_string(), text.clone());
                state.manager.hub().publish(&session.session_key, OutboundMessage::MessageQueued { text });
            }
        }

        InboundMessage::UpdateQueuedMessage { text } => {
            match session.queue.update(user_id, text.clone()) {
                Ok(()) => {
                    state.manager.hub().publish(&session.session_key, OutboundMessage::MessageQueued { text });
                }
                Err(broker_sessions::QueueMutationError::Empty) => {
                    let _ = unicast
                        .send(ConsumerFrame::Outbound(OutboundMessage::Error {
                            message: "no message queued to update".into(),
                            code: None,
                        }))
                        .await;
                }
                Err(broker_sessions::QueueMutationError::NotOwner) => {
                    let _ = unicast
                        .send(ConsumerFrame::Outbound(OutboundMessage::Error {
                            message: "only the consumer who queued this message may update it".into(),
                            code: Some("not_owner".into()),
                        }))
                        .await;
                }
            }
        }

        InboundMessage::CancelQueuedMessage => {
            if let Err(broker_sessions::QueueMutationError::NotOwner) = session.queue.cancel(user_id) {
                let _ = unicast
                    .send(ConsumerFrame::Outbound(OutboundMessage::Error {
                        message: "only the consumer who queued this message may cancel it".into(),
                        code: Some("not_owner".into()),
                    }))
                    .await;
            }
        }

        InboundMessage::SetAdapter { adapter: _ } => {
            // §6: `set_adapter` always responds with an error — the
            // adapter is chosen once, at connect time, and is
            // session-scoped thereafter; it cannot be switched mid-session.
            let _ = unicast
                .send(ConsumerFrame::Outbound(OutboundMessage::Error {
                    message: "adapter is session-scoped and cannot be changed".into(),
                    code: Some("adapter_session_scoped".into()),
                }))
                .await;
        }
    }
}

async fn handle_slash_command(state: &AppState, session: &Arc<Session>, command: &str, args: Vec<String>) {
    use broker_sessions::SlashCommandSource;

    let adapter_supports_passthrough = session
        .adapter_binding()
        .and_then(|binding| state.adapter(&binding.adapter_name))
        .is_some_and(|adapter| adapter.capabilities().slash_commands);

    match session.slash_commands.resolve_with_passthrough(command, adapter_supports_passthrough) {
        SlashCommandSource::Backend => {
            let text = std::iter::once(format!("/{command}")).chain(args).collect::<Vec<_>>().join(" ");
            let message = UnifiedMessage::new(Utc::now().timestamp_millis(), MessageType::UserMessage, Role::User, vec![UnifiedContent::text(text)]);
            if state.manager.send_to_backend(&session.session_key, message).await {
                state.manager.hub().publish(
                    &session.session_key,
                    OutboundMessage::SlashCommandResult {
                        command: command.to_string(),
                        output: String::new(),
                        source: "adapter".into(),
                    },
                );
            } else {
                state.manager.hub().publish(
                    &session.session_key,
                    OutboundMessage::SlashCommandError { command: command.to_string(), message: "no backend connected".into() },
                );
            }
        }
        SlashCommandSource::Workspace { body } => {
            let message = UnifiedMessage::new(Utc::now().timestamp_millis(), MessageType::UserMessage, Role::User, vec![UnifiedContent::text(body.clone())]);
            state.manager.send_to_backend(&session.session_key, message).await;
            state.manager.hub().publish(
                &session.session_key,
                OutboundMessage::SlashCommandResult { command: command.to_string(), output: body, source: "emulated".into() },
            );
        }
        SlashCommandSource::BuiltIn { name } => {
            let description = session.slash_commands.built_in_description(&name).unwrap_or_default();
            state.manager.hub().publish(
                &session.session_key,
                OutboundMessage::SlashCommandResult {
                    command: command.to_string(),
                    output: description.to_string(),
                    source: "emulated".into(),
                },
            );
        }
        SlashCommandSource::Passthrough => {
            // Tier 3 (§4.6): send the raw text through as a user_message
            // and queue a descriptor; the next backend-echoed user_message
            // is intercepted by the router and turned into the result.
            let text = std::iter::once(format!("/{command}")).chain(args).collect::<Vec<_>>().join(" ");
            session.push_passthrough(broker_sessions::PassthroughDescriptor {
                command: command.to_string(),
                request_id: None,
                slash_request_id: Uuid::new_v4().to_string(),
                started_at_ms: Utc::now().timestamp_millis(),
            });
            let message = UnifiedMessage::new(Utc::now().timestamp_millis(), MessageType::UserMessage, Role::User, vec![UnifiedContent::text(text)]);
            state.manager.send_or_buffer(session, message).await;
        }
        SlashCommandSource::Unknown => {
            state.manager.hub().publish(
                &session.session_key,
                OutboundMessage::SlashCommandError { command: command.to_string(), message: "unknown command".into() },
            );
        }
    }
}

async fn send(
    sink: &mut (impl SinkExt<Message> + Unpin),
    msg: &OutboundMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}
