//! Session manager: the facade binding adapters, the router, and the
//! session registry together (§4 "Session Lifecycle"). Mirrors the
//! shape of the transport layer's node registry, but keyed by session
//! rather than by connected device, and pushing routed frames onto the
//! consumer hub instead of a tool-call sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use broker_adapters::{BackendAdapter, GitInfoResolver, NoopGitInfoResolver};
use broker_domain::{Error, Result, UnifiedMessage};
use broker_protocol::OutboundMessage;
use broker_sessions::{AdapterBinding, Session, SessionRegistry};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};

use crate::hub::SharedHub;

/// A live backend connection: the sink the gateway pushes consumer
/// messages into, plus a notifier an idle reaper can use to ask the
/// reader loop to wind down.
struct BackendConnection {
    outbound: mpsc::Sender<UnifiedMessage>,
    shutdown: Arc<Notify>,
}

pub struct SessionManager {
    sessions: Arc<SessionRegistry>,
    adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>>,
    hub: SharedHub,
    connections: RwLock<HashMap<String, BackendConnection>>,
    recent_launches: RwLock<HashMap<String, Instant>>,
    relaunch_dedup_ms: u64,
    git_info: Arc<dyn GitInfoResolver>,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>>,
        hub: SharedHub,
        relaunch_dedup_ms: u64,
    ) -> Arc<Self> {
        Self::with_git_resolver(sessions, adapters, hub, relaunch_dedup_ms, Arc::new(NoopGitInfoResolver))
    }

    /// Same as [`new`](Self::new) but with an explicit git-info port —
    /// production wiring passes a [`broker_adapters::CliGitInfoResolver`];
    /// tests default to the no-op via `new`.
    pub fn with_git_resolver(
        sessions: Arc<SessionRegistry>,
        adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>>,
        hub: SharedHub,
        relaunch_dedup_ms: u64,
        git_info: Arc<dyn GitInfoResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            adapters,
            hub,
            connections: RwLock::new(HashMap::new()),
            recent_launches: RwLock::new(HashMap::new()),
            relaunch_dedup_ms,
            git_info,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn hub(&self) -> &SharedHub {
        &self.hub
    }

    pub fn has_connection(&self, session_key: &str) -> bool {
        self.connections.read().contains_key(session_key)
    }

    /// Start (or confirm already-started) a forward adapter for `session`.
    /// A second call while the first is still live is a no-op; a call
    /// within `relaunch_dedup_ms` of a failed/finished attempt is refused
    /// rather than hammering a crash-looping backend (§4.9 "Relaunch
    /// Dedup").
    pub async fn ensure_forward_adapter(
        self: &Arc<Self>,
        session: &Arc<Session>,
        adapter_name: &str,
        cwd: Option<&str>,
    ) -> Result<()> {
        if self.connections.read().contains_key(&session.session_key) {
            return Ok(());
        }

        if let Some(last) = self.recent_launches.read().get(&session.session_key) {
            if last.elapsed() < Duration::from_millis(self.relaunch_dedup_ms) {
                return Err(Error::BackendUnavailable(format!(
                    "relaunch suppressed for {}: retried within dedup window",
                    session.session_key
                )));
            }
        }
        self.recent_launches
            .write()
            .insert(session.session_key.clone(), Instant::now());

        let adapter = self
            .adapters
            .get(adapter_name)
            .cloned()
            .ok_or_else(|| Error::BackendUnavailable(format!("unknown adapter: {adapter_name}")))?;

        let mut handle = adapter.start(&session.session_key, cwd).await?;
        session.bind_adapter(AdapterBinding {
            adapter_name: adapter_name.to_string(),
            inverted: false,
        });
        self.sessions.set_adapter_name(&session.session_key, adapter_name);
        self.sessions.mark_connected(&session.session_key, None, None);

        let shutdown = Arc::new(Notify::new());
        self.connections.write().insert(
            session.session_key.clone(),
            BackendConnection {
                outbound: handle.outbound.clone(),
                shutdown: shutdown.clone(),
            },
        );

        self.hub.publish(
            &session.session_key,
            OutboundMessage::CliConnected {
                adapter_name: adapter_name.to_string(),
            },
        );
        broker_domain::TraceEvent::BackendConnected {
            session_id: session.session_id.clone(),
            adapter_name: adapter_name.to_string(),
        }
        .emit();
        self.flush_pending_messages(session).await;

        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = handle.inbound.recv() => {
                        match received {
                            Some(Ok(message)) => {
                                manager.ingest(&session, message).await;
                            }
                            Some(Err(e)) => {
                                // §7 BackendTransient: surface it to
                                // consumers as a failed result and degrade
                                // the lifecycle rather than silently
                                // looping — a backend stuck mid-turn must
                                // not leave consumers waiting forever.
                                tracing::warn!(session_id = %session.session_id, error = %e, "backend adapter error");
                                session.apply_lifecycle_signal(broker_domain::LifecycleSignal::BackendDisconnected);
                                let error_message = UnifiedMessage::new(
                                    Utc::now().timestamp_millis(),
                                    broker_domain::MessageType::Result,
                                    broker_domain::Role::System,
                                    vec![broker_domain::UnifiedContent::text(e.to_string())],
                                )
                                .with_metadata("is_error", true);
                                manager.hub.publish(
                                    &session.session_key,
                                    OutboundMessage::Result { message: error_message },
                                );
                                manager.sessions.persist_snapshot(&session);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.notified() => {
                        handle.shutdown();
                        break;
                    }
                }
            }
            manager.connections.write().remove(&session.session_key);
            manager.sessions.mark_exited(&session.session_key);
            manager.deny_all_pending_permissions(&session, "Session closed");
            manager.hub.publish(
                &session.session_key,
                OutboundMessage::CliDisconnected { reason: None },
            );
            tracing::info!(session_id = %session.session_id, "backend adapter disconnected");
        });

        Ok(())
    }

    /// Bind an inverted (dialed-in) backend connection to `session`,
    /// returning the receiver half the transport socket's writer task
    /// should drain to forward messages out to the backend.
    pub fn register_inverted(&self, session: &Session, adapter_name: &str) -> mpsc::Receiver<UnifiedMessage> {
        session.bind_adapter(AdapterBinding {
            adapter_name: adapter_name.to_string(),
            inverted: true,
        });
        self.sessions.set_adapter_name(&session.session_key, adapter_name);
        self.sessions.mark_connected(&session.session_key, None, None);
        let (tx, rx) = mpsc::channel(64);
        self.connections.write().insert(
            session.session_key.clone(),
            BackendConnection {
                outbound: tx.clone(),
                shutdown: Arc::new(Notify::new()),
            },
        );
        self.hub.publish(
            &session.session_key,
            OutboundMessage::CliConnected {
                adapter_name: adapter_name.to_string(),
            },
        );
        broker_domain::TraceEvent::BackendConnected {
            session_id: session.session_id.clone(),
            adapter_name: adapter_name.to_string(),
        }
        .emit();
        for message in session.drain_pending_messages() {
            if tx.try_send(message).is_err() {
                break;
            }
        }
        rx
    }

    /// Route one backend-originated message through the unified router
    /// and fan the resulting frames out to attached consumers. When the
    /// routed frames carry the session back to `idle`, release any queued
    /// follow-up message (§4.5 "Queue & release") before returning. A
    /// `session_init` additionally kicks off the §4.7 capabilities
    /// handshake, and any `permission_request` frame starts its 120s
    /// timeout-to-deny (§4.8).
    pub async fn ingest(self: &Arc<Self>, session: &Arc<Session>, message: UnifiedMessage) -> Vec<OutboundMessage> {
        let is_session_init = message.message_type == broker_domain::MessageType::SessionInit;
        let is_result = message.message_type == broker_domain::MessageType::Result;
        let outbound = broker_router::route_backend_message(session, message);
        for frame in &outbound {
            self.hub.publish(&session.session_key, frame.clone());
        }

        if is_session_init {
            self.dispatch_capabilities_handshake(session).await;
        }
        if is_session_init || is_result {
            self.refresh_git_info(session).await;
        }

        for frame in &outbound {
            if let OutboundMessage::PermissionRequest { request_id, .. } = frame {
                self.spawn_permission_timeout(session, request_id.clone());
                self.spawn_permission_backend_notify(session, request_id.clone());
            }
        }

        let went_idle = outbound
            .iter()
            .any(|frame| matches!(frame, OutboundMessage::StatusChange { status } if status == "idle"));
        if went_idle {
            self.release_queued_message(session).await;
        }
        if !outbound.is_empty() {
            self.sessions.persist_snapshot(session);
        }
        outbound
    }

    /// §4.3 "session_init: ... resolve git info and merge" / "result: ...
    /// request a git-info refresh — if changed, broadcast a
    /// `session_update` patch". A `cwd`-less session (or a resolver that
    /// can't find a repo) is a silent no-op, not an error.
    async fn refresh_git_info(self: &Arc<Self>, session: &Arc<Session>) {
        let Some(cwd) = session.state_snapshot().cwd else {
            return;
        };
        let Some(git) = self.git_info.resolve(&cwd).await else {
            return;
        };
        let mut state = session.state_snapshot();
        if state.git == git {
            return;
        }
        state.git = git;
        if let Some(patch) = session.update_state(state) {
            self.hub.publish(
                &session.session_key,
                OutboundMessage::SessionUpdate {
                    session_id: session.session_id.clone(),
                    patch,
                },
            );
        }
    }

    /// Dispatch the §4.7 `control_request{initialize}` handshake once per
    /// connected backend lifetime (`Session::begin_capabilities_handshake`
    /// guards against a reconnect re-firing it). Spawns a background task
    /// that only exists to observe the 5s timeout and clear the pending
    /// slot if nothing answered — the success path is handled synchronously
    /// by the router's `control_response` branch.
    async fn dispatch_capabilities_handshake(self: &Arc<Self>, session: &Arc<Session>) {
        let Some(request_id) = session.begin_capabilities_handshake() else {
            return;
        };
        let (waiter, announcer) = broker_sessions::capabilities_pair();
        session.set_capabilities_announcer(announcer);

        let control_request = UnifiedMessage::new(
            Utc::now().timestamp_millis(),
            broker_domain::MessageType::ControlRequest,
            broker_domain::Role::System,
            vec![],
        )
        .with_metadata("subtype", "initialize")
        .with_metadata("request_id", request_id.to_string());
        self.send_to_backend(&session.session_key, control_request).await;

        let session = Arc::clone(session);
        tokio::spawn(async move {
            if waiter.wait(&session.session_id).await.is_none() {
                session.clear_pending_initialize_if(request_id);
            }
        });
    }

    /// Start the §4.8 120s timeout-to-deny for one `permission_request`.
    /// A no-op if the request was already resolved by the time the timer
    /// fires — `PermissionBridge::resolve` returns `false` in that case.
    fn spawn_permission_timeout(self: &Arc<Self>, session: &Arc<Session>, request_id: String) {
        let Ok(request_id) = request_id.parse::<uuid::Uuid>() else {
            return;
        };
        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(session.permissions.timeout()).await;
            let resolved = session.permissions.resolve(
                &request_id,
                broker_sessions::PermissionDecision::Denied {
                    reason: Some("Permission request timed out".to_string()),
                },
            );
            if resolved {
                broker_domain::TraceEvent::PermissionResolved {
                    session_id: session.session_id.clone(),
                    request_id: request_id.to_string(),
                    outcome: "timed_out".into(),
                }
                .emit();
                manager.hub.publish(
                    &session.session_key,
                    OutboundMessage::PermissionCancelled { request_id: request_id.to_string() },
                );
            }
        });
    }

    /// Carry the eventual allow/deny for one `permission_request` back to
    /// the backend's `canUseTool` call (§4.8 step 3). Awaits the same
    /// oneshot the router stashed on `Session` when it issued the request,
    /// so this resolves uniformly whichever way the decision lands — an
    /// explicit `permission_response`, a timeout-to-deny, or a deny-all on
    /// session close.
    fn spawn_permission_backend_notify(self: &Arc<Self>, session: &Arc<Session>, request_id: String) {
        let Ok(parsed) = request_id.parse::<uuid::Uuid>() else {
            return;
        };
        let Some(rx) = session.take_permission_waiter(parsed) else {
            return;
        };
        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let Ok(decision) = rx.await else {
                return;
            };
            let mut response = UnifiedMessage::new(
                Utc::now().timestamp_millis(),
                broker_domain::MessageType::PermissionResponse,
                broker_domain::Role::System,
                vec![],
            )
            .with_metadata("request_id", request_id.clone());
            response = match decision {
                broker_sessions::PermissionDecision::Approved { always_allow } => response
                    .with_metadata("approved", true)
                    .with_metadata("always_allow", always_allow),
                broker_sessions::PermissionDecision::Denied { reason } => {
                    let response = response.with_metadata("approved", false);
                    match reason {
                        Some(reason) => response.with_metadata("reason", reason),
                        None => response,
                    }
                }
            };
            manager.send_to_backend(&session.session_key, response).await;
        });
    }

    /// Take the session's queued follow-up, if any, announce it, and
    /// forward it to the backend as a fresh `user_message` — the automatic
    /// release half of the single-slot queue (§4.5, §8 "queued message is
    /// sent before any further user input is accepted").
    async fn release_queued_message(&self, session: &Arc<Session>) {
        let Some(queued) = session.queue.take() else {
            return;
        };
        self.hub.publish(
            &session.session_key,
            OutboundMessage::QueuedMessageSent { text: queued.text.clone() },
        );
        let message = UnifiedMessage::new(
            Utc::now().timestamp_millis(),
            broker_domain::MessageType::UserMessage,
            broker_domain::Role::User,
            vec![broker_domain::UnifiedContent::text(queued.text.clone())],
        );
        session.push_history(message.clone());
        self.hub.publish(
            &session.session_key,
            OutboundMessage::UserMessage { message: message.clone() },
        );
        self.send_to_backend(&session.session_key, message).await;
    }

    /// Forward a consumer-originated message to the backend bound to
    /// `session_key`. `false` means there is no live backend connection —
    /// callers should surface this as an `error` frame to the consumer.
    pub async fn send_to_backend(&self, session_key: &str, message: UnifiedMessage) -> bool {
        let sender = self
            .connections
            .read()
            .get(session_key)
            .map(|c| c.outbound.clone());
        match sender {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Like [`send_to_backend`](Self::send_to_backend), but buffers the
    /// message on the session (§3 "Pending" `pendingMessages`) instead of
    /// dropping it when no backend connection exists yet — used for
    /// consumer traffic that arrives before an inverted adapter has dialed
    /// back in.
    pub async fn send_or_buffer(&self, session: &Arc<Session>, message: UnifiedMessage) {
        if !self.send_to_backend(&session.session_key, message.clone()).await {
            session.buffer_pending_message(message);
        }
    }

    /// Flush every buffered pending message into the now-live backend
    /// connection, FIFO (§4.2 "On attachBackendConnection: flush
    /// pendingMessages in FIFO order into BackendSession.send").
    async fn flush_pending_messages(&self, session: &Arc<Session>) {
        for message in session.drain_pending_messages() {
            self.send_to_backend(&session.session_key, message).await;
        }
    }

    /// Drop an inverted connection immediately, without the reconnect
    /// grace window — used for explicit session close.
    pub fn detach(&self, session_key: &str) {
        if self.connections.write().remove(session_key).is_some() {
            self.sessions.mark_exited(session_key);
            self.hub
                .publish(session_key, OutboundMessage::CliDisconnected { reason: None });
        }
    }

    /// A transport socket closed. Rather than telling consumers the
    /// backend is gone right away, give it `grace_ms` to reconnect — a
    /// fresh `BackendHello` for the same session key re-populates the
    /// connection before the grace window elapses (§4.10 "Reconnect
    /// Grace Period").
    pub fn schedule_detach(self: &Arc<Self>, session_key: String, grace_ms: u64) {
        self.connections.write().remove(&session_key);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(grace_ms)).await;
            if !manager.connections.read().contains_key(&session_key) {
                manager.sessions.mark_exited(&session_key);
                manager.hub.publish(
                    &session_key,
                    OutboundMessage::CliDisconnected {
                        reason: Some("reconnect grace period expired".to_string()),
                    },
                );
            }
        });
    }

    /// Fully close a session: detach any backend connection, resolve every
    /// outstanding permission request with a "Session closed" deny (§4.8
    /// step 5), drop the broadcast hub channel, and remove it from the
    /// live registry.
    pub fn close_session(&self, session_key: &str) {
        self.detach(session_key);
        if let Some(session) = self.sessions.get(session_key) {
            self.deny_all_pending_permissions(&session, "Session closed");
        }
        self.hub.remove(session_key);
        self.sessions.remove_live(session_key);
    }

    /// Resolve every permission request still pending on `session` with a
    /// deny, broadcasting `permission_cancelled` for each (§4.8 step 5).
    fn deny_all_pending_permissions(&self, session: &Arc<Session>, reason: &str) {
        let cancelled = session.permissions.resolve_all_for_session(
            &session.session_id,
            broker_sessions::PermissionDecision::Denied { reason: Some(reason.to_string()) },
        );
        for info in cancelled {
            self.hub.publish(
                &session.session_key,
                OutboundMessage::PermissionCancelled { request_id: info.request_id.to_string() },
            );
        }
    }

    /// Relaunch any record stuck `Starting` for longer than `grace_ms` —
    /// an inverted adapter that was spawned but never dialed back in
    /// (§4.9 "Reconnect Watchdog"). A record with no known adapter name
    /// can't be relaunched and is archived instead.
    pub async fn relaunch_stuck(self: &Arc<Self>, grace_ms: u64) {
        for record in self.sessions.stuck_starting(grace_ms) {
            let Some(session) = self.sessions.get(&record.session_key) else {
                continue;
            };
            let Some(adapter_name) = record.adapter_name.clone() else {
                tracing::warn!(session_key = %record.session_key, "stuck session has no adapter name, archiving");
                self.sessions.archive(&record.session_key);
                continue;
            };
            tracing::info!(session_key = %record.session_key, adapter_name = %adapter_name, "reconnect watchdog relaunching stuck session");
            if let Err(e) = self
                .ensure_forward_adapter(&session, &adapter_name, record.cwd.as_deref())
                .await
            {
                tracing::warn!(session_key = %record.session_key, error = %e, "reconnect watchdog relaunch failed");
            }
        }
    }

    /// Close sessions with no attached consumers whose record hasn't
    /// been touched in `idle_timeout_ms` (§5 "Resource Model").
    pub fn reap_idle(&self, idle_timeout_ms: u64) {
        if idle_timeout_ms == 0 {
            return;
        }
        let now = Utc::now();
        for record in self.sessions.list_records() {
            let Some(session) = self.sessions.get(&record.session_key) else {
                continue;
            };
            if session.consumer_count() > 0 || self.has_connection(&record.session_key) {
                continue;
            }
            let age_ms = now
                .signed_duration_since(record.updated_at)
                .num_milliseconds()
                .max(0) as u64;
            if age_ms > idle_timeout_ms {
                tracing::info!(session_key = %record.session_key, age_ms, "reaping idle session");
                self.close_session(&record.session_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::MessageType;

    fn manager() -> (Arc<SessionManager>, Arc<SessionRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionRegistry::open(dir.path(), 100).unwrap());
        let hub = Arc::new(crate::hub::ConsumerHub::new());
        let adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>> = Arc::new(HashMap::new());
        (SessionManager::new(sessions.clone(), adapters, hub, 1_000), sessions)
    }

    #[test]
    fn send_to_backend_without_connection_returns_false() {
        let (manager, sessions) = manager();
        let (session, _) = sessions.resolve_or_create("sk1");
        let _ = session;
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(manager.send_to_backend("sk1", UnifiedMessage::new(0, MessageType::UserMessage, broker_domain::Role::User, vec![])));
        assert!(!result);
    }

    #[test]
    fn register_inverted_allows_send_to_backend() {
        let (manager, sessions) = manager();
        let (session, _) = sessions.resolve_or_create("sk1");
        let mut rx = manager.register_inverted(&session, "inverted-backend");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let sent = rt.block_on(manager.send_to_backend(
            "sk1",
            UnifiedMessage::new(0, MessageType::UserMessage, broker_domain::Role::User, vec![]),
        ));
        assert!(sent);
        let received = rt.block_on(rx.recv());
        assert!(received.is_some());
    }

    #[test]
    fn ensure_forward_adapter_rejects_unknown_adapter_name() {
        let (manager, sessions) = manager();
        let (session, _) = sessions.resolve_or_create("sk1");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(manager.ensure_forward_adapter(&session, "does-not-exist", None));
        assert!(result.is_err());
    }

    struct FixedGitInfoResolver(broker_domain::GitInfo);

    #[async_trait::async_trait]
    impl broker_adapters::GitInfoResolver for FixedGitInfoResolver {
        async fn resolve(&self, _cwd: &str) -> Option<broker_domain::GitInfo> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn ingest_of_session_init_refreshes_git_info_when_cwd_known() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionRegistry::open(dir.path(), 100).unwrap());
        let hub = Arc::new(crate::hub::ConsumerHub::new());
        let adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>> = Arc::new(HashMap::new());
        let git = broker_domain::GitInfo {
            branch: Some("main".into()),
            commit: Some("abc123".into()),
            dirty: Some(false),
        };
        let manager = SessionManager::with_git_resolver(
            sessions.clone(),
            adapters,
            hub,
            1_000,
            Arc::new(FixedGitInfoResolver(git.clone())),
        );
        let (session, _) = sessions.resolve_or_create("sk1");

        let mut init = UnifiedMessage::new(0, MessageType::SessionInit, broker_domain::Role::System, vec![]);
        init.metadata.insert("cwd".into(), "/workspace/app".into());
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(manager.ingest(&session, init));

        assert_eq!(session.state_snapshot().git, git);
    }

    #[test]
    fn ingest_skips_git_refresh_without_a_known_cwd() {
        let (manager, sessions) = manager();
        let (session, _) = sessions.resolve_or_create("sk1");
        let init = UnifiedMessage::new(0, MessageType::SessionInit, broker_domain::Role::System, vec![]);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(manager.ingest(&session, init));
        assert_eq!(session.state_snapshot().git, broker_domain::GitInfo::default());
    }

    #[test]
    fn ingest_of_permission_request_notifies_the_backend_once_resolved() {
        let (manager, sessions) = manager();
        let (session, _) = sessions.resolve_or_create("sk1");
        let mut rx = manager.register_inverted(&session, "inverted-backend");

        let request = UnifiedMessage::new(0, MessageType::PermissionRequest, broker_domain::Role::System, vec![])
            .with_metadata("subtype", "can_use_tool")
            .with_metadata("tool_name", "bash")
            .with_metadata("input", serde_json::json!({}));
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(manager.ingest(&session, request));

        let pending = session.permissions.list_pending();
        assert_eq!(pending.len(), 1);
        let request_id = pending[0].request_id;
        assert!(session.permissions.resolve(
            &request_id,
            broker_sessions::PermissionDecision::Approved { always_allow: true },
        ));

        let forwarded = rt.block_on(rx.recv()).unwrap();
        assert_eq!(forwarded.message_type, MessageType::PermissionResponse);
        assert_eq!(forwarded.metadata_str("request_id"), Some(request_id.to_string().as_str()));
        assert_eq!(forwarded.metadata.get("approved"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(forwarded.metadata.get("always_allow"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn backend_read_error_degrades_lifecycle_and_broadcasts_a_failed_result() {
        struct FailingAdapter;

        #[async_trait::async_trait]
        impl BackendAdapter for FailingAdapter {
            fn name(&self) -> &str {
                "failing"
            }

            fn capabilities(&self) -> broker_domain::AdapterCapabilities {
                broker_domain::AdapterCapabilities {
                    streaming: false,
                    permissions: false,
                    slash_commands: false,
                    availability: broker_domain::Availability::Local,
                    teams: false,
                }
            }

            async fn start(
                &self,
                _session_key: &str,
                _cwd: Option<&str>,
            ) -> Result<broker_adapters::BackendHandle> {
                let (outbound_tx, _outbound_rx) = mpsc::channel(4);
                let (inbound_tx, inbound_rx) = mpsc::channel(4);
                let _ = inbound_tx.send(Err(Error::BackendUnavailable("broken pipe".into()))).await;
                let (shutdown_tx, _shutdown_rx) = tokio::sync::oneshot::channel();
                Ok(broker_adapters::BackendHandle::new(outbound_tx, inbound_rx, shutdown_tx))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionRegistry::open(dir.path(), 100).unwrap());
        let hub = Arc::new(crate::hub::ConsumerHub::new());
        let mut adapter_map: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
        adapter_map.insert("failing".into(), Arc::new(FailingAdapter));
        let manager = SessionManager::new(sessions.clone(), Arc::new(adapter_map), hub.clone(), 1_000);
        let (session, _) = sessions.resolve_or_create("sk1");
        session.apply_lifecycle_signal(broker_domain::LifecycleSignal::BackendConnected);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut rx = hub.subscribe("sk1");
        rt.block_on(manager.ensure_forward_adapter(&session, "failing", None)).unwrap();

        rt.block_on(async {
            loop {
                match rx.recv().await.unwrap() {
                    OutboundMessage::Result { message } => {
                        assert_eq!(message.metadata.get("is_error"), Some(&serde_json::Value::Bool(true)));
                        break;
                    }
                    _ => continue,
                }
            }
        });
        assert_eq!(session.lifecycle(), broker_domain::LifecycleState::Degraded);
    }

    #[test]
    fn reap_idle_spares_a_session_with_a_live_backend_connection_and_no_consumers() {
        let (manager, sessions) = manager();
        let (session, _) = sessions.resolve_or_create("sk1");
        let _rx = manager.register_inverted(&session, "inverted-backend");
        sessions.touch("sk1");
        std::thread::sleep(Duration::from_millis(5));

        manager.reap_idle(1);
        assert!(sessions.get("sk1").is_some());
        assert!(manager.has_connection("sk1"));
    }
}
