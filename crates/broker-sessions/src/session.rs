//! The in-memory `Session` aggregate (§3 "Session"): everything the broker
//! holds for one backend conversation, shared behind an `Arc` by every
//! component that touches it (router, gateway, transport hub).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use broker_domain::{LifecycleSignal, LifecycleState, SessionState, UnifiedMessage};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::capabilities::CapabilitiesAnnouncer;
use crate::permission::{PermissionBridge, PermissionDecision};
use crate::queue::FollowUpQueue;
use crate::ratelimit::TokenBucket;
use crate::slash::{PassthroughDescriptor, SlashCommandRegistry};

/// Identifies one attached consumer transport (socket), not a user — the
/// same `user_id` may hold several of these at once (§3 "Session":
/// consumers are keyed by transport handle).
pub type ConsumerHandle = u64;

/// A single attached consumer connection. `participant` consumers can send
/// messages; `observer` consumers only receive broadcasts (§5 "Consumer
/// Broadcaster").
pub struct Consumer {
    pub user_id: String,
    pub participant: bool,
    pub rate_limiter: TokenBucket,
}

/// Which kind of backend this session is bound to, and whether it dialed
/// in (inverted) or was spawned by the broker (forward).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterBinding {
    pub adapter_name: String,
    pub inverted: bool,
}

pub struct Session {
    pub session_id: String,
    pub session_key: String,
    pub created_at: DateTime<Utc>,

    lifecycle: RwLock<LifecycleState>,
    state: RwLock<SessionState>,
    history: RwLock<Vec<UnifiedMessage>>,
    max_history: usize,

    pub queue: FollowUpQueue,
    pub permissions: PermissionBridge,
    pub slash_commands: SlashCommandRegistry,

    consumers: RwLock<HashMap<ConsumerHandle, Consumer>>,
    next_consumer_handle: AtomicU64,
    adapter: RwLock<Option<AdapterBinding>>,

    /// Backend `permission_request` waiters stashed by the router until the
    /// session manager picks them up to notify the backend of the eventual
    /// decision (§4.8 step 3 "... relay the decision back to the adapter's
    /// canUseTool call").
    permission_waiters: RwLock<HashMap<Uuid, oneshot::Receiver<PermissionDecision>>>,

    /// Backend-native turn ids seen in this session, for the team
    /// correlation buffer (§4.3 step 2) — cleared on each `result`.
    team_buffer: RwLock<Vec<String>>,

    /// Set once the §4.7 initialize handshake has been dispatched (or
    /// capabilities arrived embedded in `session_init`), so a reconnect
    /// doesn't fire a second `control_request`.
    capabilities_requested: AtomicBool,
    capabilities_announcer: RwLock<Option<CapabilitiesAnnouncer>>,
    /// The `request_id` of the in-flight `control_request{initialize}`, if
    /// any — cleared on a matching `control_response` or on timeout so a
    /// stale response can't resolve a later handshake.
    pending_initialize: RwLock<Option<Uuid>>,

    /// Backend-assigned session id, set on the first `session_init` and
    /// used for resume (§3 "Session" identity).
    backend_session_id: RwLock<Option<String>>,

    /// Consumer messages that arrived before a backend connection was
    /// attached, flushed in FIFO order by `attach_backend_connection`
    /// (§3 "Pending", §4.2 "On attachBackendConnection").
    pending_messages: RwLock<VecDeque<UnifiedMessage>>,
    pending_messages_cap: usize,

    /// `tool_use_id`s already broadcast as `tool_use_summary`, for the
    /// router's dedup rule (§4.3 "tool_use_summary ... deduplicate by
    /// tool_use_id").
    seen_tool_summaries: RwLock<HashSet<String>>,

    /// FIFO of native-passthrough slash commands awaiting interception of
    /// the backend's echoed `user_message` (§4.6 tier 3).
    pending_passthroughs: RwLock<VecDeque<PassthroughDescriptor>>,
}

impl Session {
    pub fn new(session_id: String, session_key: String, max_history: usize) -> Self {
        Self::with_pending_cap(session_id, session_key, max_history, 256)
    }

    pub fn with_pending_cap(session_id: String, session_key: String, max_history: usize, pending_cap: usize) -> Self {
        Self {
            session_id,
            session_key,
            created_at: Utc::now(),
            lifecycle: RwLock::new(LifecycleState::default()),
            state: RwLock::new(SessionState::default()),
            history: RwLock::new(Vec::new()),
            max_history,
            queue: FollowUpQueue::new(),
            permissions: PermissionBridge::with_default_timeout(),
            slash_commands: SlashCommandRegistry::new(),
            consumers: RwLock::new(HashMap::new()),
            next_consumer_handle: AtomicU64::new(1),
            adapter: RwLock::new(None),
            permission_waiters: RwLock::new(HashMap::new()),
            team_buffer: RwLock::new(Vec::new()),
            capabilities_requested: AtomicBool::new(false),
            capabilities_announcer: RwLock::new(None),
            pending_initialize: RwLock::new(None),
            backend_session_id: RwLock::new(None),
            pending_messages: RwLock::new(VecDeque::new()),
            pending_messages_cap: pending_cap,
            seen_tool_summaries: RwLock::new(HashSet::new()),
            pending_passthroughs: RwLock::new(VecDeque::new()),
        }
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.read()
    }

    pub fn apply_lifecycle_signal(&self, signal: LifecycleSignal) {
        self.lifecycle.write().apply(signal);
    }

    /// Replace the state bag, returning a JSON patch of what changed for
    /// the `session_update` broadcast (empty patch means "don't broadcast").
    pub fn update_state(&self, new_state: SessionState) -> Option<serde_json::Value> {
        let mut guard = self.state.write();
        let patch = new_state.diff_patch(&guard);
        *guard = new_state;
        patch
    }

    pub fn state_snapshot(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Append to history, trimming the oldest entries once `max_history`
    /// is exceeded (§5 "Resource Model" bounded-memory rule).
    pub fn push_history(&self, message: UnifiedMessage) {
        let mut history = self.history.write();
        history.push(message);
        if self.max_history > 0 && history.len() > self.max_history {
            let overflow = history.len() - self.max_history;
            history.drain(0..overflow);
        }
    }

    pub fn history_snapshot(&self) -> Vec<UnifiedMessage> {
        self.history.read().clone()
    }

    /// True when `message` structurally duplicates the most recent history
    /// entry — the assistant-message dedup rule (§4.3, §8).
    pub fn duplicates_last(&self, message: &UnifiedMessage) -> bool {
        self.history
            .read()
            .last()
            .is_some_and(|last| last.content_eq(message))
    }

    /// Push an assistant message, but if an existing entry shares its
    /// `metadata.message_id` (a streamed message whose final content
    /// differs from an earlier partial), replace that entry in place
    /// instead of appending a second one — the §8 invariant that exactly
    /// one history entry survives per `message_id`. Returns `true` when
    /// an existing entry was replaced, `false` when freshly appended.
    pub fn push_or_replace_assistant(&self, message: UnifiedMessage) -> bool {
        let message_id = message.metadata_str("message_id").map(str::to_string);
        let mut history = self.history.write();
        if let Some(id) = message_id.as_deref() {
            if let Some(existing) = history
                .iter_mut()
                .rev()
                .find(|m| m.metadata_str("message_id") == Some(id))
            {
                *existing = message;
                return true;
            }
        }
        history.push(message);
        if self.max_history > 0 && history.len() > self.max_history {
            let overflow = history.len() - self.max_history;
            history.drain(0..overflow);
        }
        false
    }

    /// Attach a consumer socket, returning the handle it's keyed by. One
    /// `user_id` may hold several handles at once (multiple tabs/devices);
    /// each gets its own rate limiter and presence entry.
    pub fn add_consumer(&self, user_id: String, participant: bool, tokens_per_second: f64, burst: u32) -> ConsumerHandle {
        let handle = self.next_consumer_handle.fetch_add(1, Ordering::SeqCst);
        self.consumers.write().insert(
            handle,
            Consumer {
                user_id,
                participant,
                rate_limiter: TokenBucket::new(tokens_per_second, burst),
            },
        );
        handle
    }

    pub fn remove_consumer(&self, handle: ConsumerHandle) {
        self.consumers.write().remove(&handle);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.consumers
            .read()
            .values()
            .filter(|c| c.participant)
            .map(|c| c.user_id.clone())
            .collect()
    }

    pub fn observer_ids(&self) -> Vec<String> {
        self.consumers
            .read()
            .values()
            .filter(|c| !c.participant)
            .map(|c| c.user_id.clone())
            .collect()
    }

    /// Try to consume one rate-limit token for the consumer at `handle`. A
    /// handle not present in the map (already detached) is treated as
    /// rate-limited.
    pub fn try_consume_rate_limit(&self, handle: ConsumerHandle) -> bool {
        self.consumers
            .write()
            .get_mut(&handle)
            .map(|c| c.rate_limiter.try_consume())
            .unwrap_or(false)
    }

    pub fn bind_adapter(&self, binding: AdapterBinding) {
        *self.adapter.write() = Some(binding);
    }

    pub fn adapter_binding(&self) -> Option<AdapterBinding> {
        self.adapter.read().clone()
    }

    pub fn note_team_turn(&self, backend_turn_id: String) {
        self.team_buffer.write().push(backend_turn_id);
    }

    /// Drain the team correlation buffer — called when a `result` message
    /// closes out the turn.
    pub fn drain_team_buffer(&self) -> Vec<String> {
        std::mem::take(&mut self.team_buffer.write())
    }

    /// Claim the one-shot right to dispatch the initialize handshake.
    /// Returns `true` only for the caller that flips this from unclaimed
    /// to claimed — a reconnect racing a pending handshake must not fire
    /// a second `control_request`.
    pub fn mark_capabilities_requested(&self) -> bool {
        self.capabilities_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Stash the announcer half of a capabilities handshake so a later
    /// `control_response` can resolve it.
    pub fn set_capabilities_announcer(&self, announcer: CapabilitiesAnnouncer) {
        *self.capabilities_announcer.write() = Some(announcer);
    }

    /// Resolve a pending capabilities handshake. `false` means there was
    /// no announcer waiting (a late or duplicate `control_response`).
    pub fn resolve_capabilities(&self, capabilities: broker_domain::Capabilities) -> bool {
        match self.capabilities_announcer.write().take() {
            Some(announcer) => {
                announcer.announce(capabilities);
                true
            }
            None => false,
        }
    }

    /// Claim the one-shot right to dispatch the §4.7 initialize handshake
    /// and mint the `request_id` to tag it with. `None` means a handshake
    /// was already claimed (a reconnect racing a pending one).
    pub fn begin_capabilities_handshake(&self) -> Option<Uuid> {
        if !self.mark_capabilities_requested() {
            return None;
        }
        let id = Uuid::new_v4();
        *self.pending_initialize.write() = Some(id);
        Some(id)
    }

    /// Clear the pending initialize request if `request_id` still matches
    /// it, returning whether it did. Used both by a matching
    /// `control_response` (clears cleanly) and by the 5s timeout (clears
    /// and reports `true` only if nothing answered first).
    pub fn clear_pending_initialize_if(&self, request_id: Uuid) -> bool {
        let mut guard = self.pending_initialize.write();
        if *guard == Some(request_id) {
            *guard = None;
            true
        } else {
            false
        }
    }

    pub fn set_backend_session_id(&self, id: String) {
        *self.backend_session_id.write() = Some(id);
    }

    pub fn backend_session_id(&self) -> Option<String> {
        self.backend_session_id.read().clone()
    }

    /// Buffer a consumer message that arrived before a backend connection
    /// was attached (§3 "Pending" — `pendingMessages`). Oldest entries are
    /// dropped with a warning once `pending_messages_cap` is exceeded (§5
    /// "Backpressure").
    pub fn buffer_pending_message(&self, message: UnifiedMessage) {
        let mut pending = self.pending_messages.write();
        if pending.len() >= self.pending_messages_cap {
            pending.pop_front();
            tracing::warn!(session_id = %self.session_id, "pending message queue full, dropping oldest");
        }
        pending.push_back(message);
    }

    /// Drain every buffered pending message in FIFO order — called by
    /// `attachBackendConnection` once a backend is live (§4.2).
    pub fn drain_pending_messages(&self) -> Vec<UnifiedMessage> {
        self.pending_messages.write().drain(..).collect()
    }

    /// Read-only copy of the buffered pending messages, for persistence
    /// snapshots — unlike `drain_pending_messages` this does not consume
    /// them.
    pub fn pending_messages_snapshot(&self) -> Vec<UnifiedMessage> {
        self.pending_messages.read().iter().cloned().collect()
    }

    /// First-seen check for a `tool_use_summary`'s `tool_use_id` — returns
    /// `true` the first time a given id is seen, `false` on any repeat
    /// (§4.3 "tool_use_summary ... deduplicate by tool_use_id").
    pub fn note_tool_summary_seen(&self, tool_use_id: &str) -> bool {
        self.seen_tool_summaries.write().insert(tool_use_id.to_string())
    }

    /// Enqueue a tier-3 passthrough command awaiting the backend's echo.
    pub fn push_passthrough(&self, descriptor: PassthroughDescriptor) {
        self.pending_passthroughs.write().push_back(descriptor);
    }

    /// Pop the oldest pending passthrough — called when a `user_message`
    /// arrives from the backend, on the assumption it is that command's
    /// echo (§4.6 tier 3).
    pub fn pop_passthrough(&self) -> Option<PassthroughDescriptor> {
        self.pending_passthroughs.write().pop_front()
    }

    /// Stash the receiver half of a freshly registered `permission_request`
    /// so the session manager can later await it and relay the eventual
    /// decision back to the backend (§4.8 step 3).
    pub fn stash_permission_waiter(&self, request_id: Uuid, rx: oneshot::Receiver<PermissionDecision>) {
        self.permission_waiters.write().insert(request_id, rx);
    }

    /// Take the stashed waiter for `request_id`, if any — each is consumed
    /// exactly once, by whichever task notices the `permission_request`
    /// frame first.
    pub fn take_permission_waiter(&self, request_id: Uuid) -> Option<oneshot::Receiver<PermissionDecision>> {
        self.permission_waiters.write().remove(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::{MessageType, Role};

    fn msg(text: &str) -> UnifiedMessage {
        UnifiedMessage::new(
            0,
            MessageType::Assistant,
            Role::Assistant,
            vec![broker_domain::UnifiedContent::text(text)],
        )
    }

    #[test]
    fn history_is_trimmed_to_max_length() {
        let session = Session::new("sid".into(), "skey".into(), 2);
        session.push_history(msg("a"));
        session.push_history(msg("b"));
        session.push_history(msg("c"));
        let history = session.history_snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].all_text(), "b");
        assert_eq!(history[1].all_text(), "c");
    }

    #[test]
    fn duplicates_last_detects_identical_content() {
        let session = Session::new("sid".into(), "skey".into(), 10);
        session.push_history(msg("hello"));
        assert!(session.duplicates_last(&msg("hello")));
        assert!(!session.duplicates_last(&msg("world")));
    }

    #[test]
    fn rate_limit_rejects_unknown_consumer() {
        let session = Session::new("sid".into(), "skey".into(), 10);
        assert!(!session.try_consume_rate_limit(999));
    }

    #[test]
    fn rate_limit_allows_then_blocks_known_consumer() {
        let session = Session::new("sid".into(), "skey".into(), 10);
        let handle = session.add_consumer("u1".into(), true, 1.0, 1);
        assert!(session.try_consume_rate_limit(handle));
        assert!(!session.try_consume_rate_limit(handle));
    }

    #[test]
    fn participant_and_observer_ids_are_partitioned() {
        let session = Session::new("sid".into(), "skey".into(), 10);
        session.add_consumer("p1".into(), true, 50.0, 20);
        session.add_consumer("o1".into(), false, 50.0, 20);
        assert_eq!(session.participant_ids(), vec!["p1".to_string()]);
        assert_eq!(session.observer_ids(), vec!["o1".to_string()]);
    }

    #[test]
    fn two_handles_from_the_same_user_id_both_count_toward_presence() {
        let session = Session::new("sid".into(), "skey".into(), 10);
        let h1 = session.add_consumer("u1".into(), true, 50.0, 20);
        let h2 = session.add_consumer("u1".into(), true, 50.0, 20);
        assert_ne!(h1, h2);
        assert_eq!(session.consumer_count(), 2);
        session.remove_consumer(h1);
        assert_eq!(session.consumer_count(), 1);
    }

    #[test]
    fn permission_waiter_round_trips_through_stash_and_take() {
        let session = Session::new("sid".into(), "skey".into(), 10);
        let (id, rx, _info) = session.permissions.request("sid".into(), "bash".into(), serde_json::Value::Null);
        session.stash_permission_waiter(id, rx);
        assert!(session.take_permission_waiter(id).is_some());
        assert!(session.take_permission_waiter(id).is_none());
    }
}
