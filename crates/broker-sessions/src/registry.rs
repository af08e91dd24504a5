//! Session registry: the in-memory map of live [`Session`]s plus the
//! persisted record each one is backed by, mirroring the gateway's session
//! store (`resolve_or_create` / `reset_session` / periodic flush).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use broker_domain::{Error, Result, TraceEvent};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::session::Session;
use crate::snapshot::{PersistedPermission, SessionSnapshot};
use crate::storage::{JsonFileStorage, Storage};

/// A registry entry's coarse connection state (§3 "Registry entry").
/// `Starting` covers a spawned-but-not-yet-connected inverted adapter —
/// the reconnect watchdog only ever relaunches entries in this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Starting,
    Connected,
    Exited,
}

/// The durable record persisted for a session — small and serializable,
/// unlike [`Session`] itself which holds live channels and locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_key: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub adapter_name: Option<String>,
    #[serde(default = "d_record_state")]
    pub state: RecordState,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Set once the reconnect watchdog gives up on a non-archived entry
    /// that never connected — archived entries are skipped by the
    /// watchdog and the idle reaper both (§4.9 "Relaunch Deduplication").
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub backend_session_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

fn d_record_state() -> RecordState {
    RecordState::Connected
}

pub struct SessionRegistry {
    live: RwLock<HashMap<String, Arc<Session>>>,
    records: RwLock<HashMap<String, SessionRecord>>,
    storage: JsonFileStorage,
    snapshots: RwLock<HashMap<String, SessionSnapshot>>,
    snapshot_storage: JsonFileStorage,
    max_history: usize,
}

impl SessionRegistry {
    pub fn open(state_dir: &Path, max_history: usize) -> Result<Self> {
        let storage = JsonFileStorage::new(state_dir, "sessions.json")?;
        let records = storage.load_all()?;
        tracing::info!(count = records.len(), "session registry loaded");
        let snapshot_storage = JsonFileStorage::new(state_dir, "session_snapshots.json")?;
        let snapshots = snapshot_storage.load_all()?;
        Ok(Self {
            live: RwLock::new(HashMap::new()),
            records: RwLock::new(records),
            storage,
            snapshots: RwLock::new(snapshots),
            snapshot_storage,
            max_history,
        })
    }

    /// Resolve an existing live session for `session_key`, or mint a new
    /// one (and a fresh record) if none exists. Returns `(session, is_new)`.
    pub fn resolve_or_create(&self, session_key: &str) -> (Arc<Session>, bool) {
        self.resolve_or_create_with_state(session_key, RecordState::Connected)
    }

    /// Same as [`resolve_or_create`](Self::resolve_or_create) but lets the
    /// caller mark a freshly minted record `Starting` — used when the
    /// session manager spawns an inverted adapter and must wait for the
    /// backend to dial back in before the entry counts as connected.
    pub fn resolve_or_create_with_state(&self, session_key: &str, state: RecordState) -> (Arc<Session>, bool) {
        {
            let live = self.live.read();
            if let Some(session) = live.get(session_key) {
                return (session.clone(), false);
            }
        }

        let now = Utc::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(
            session_id.clone(),
            session_key.to_string(),
            self.max_history,
        ));

        self.live
            .write()
            .insert(session_key.to_string(), session.clone());
        self.records.write().insert(
            session_key.to_string(),
            SessionRecord {
                session_key: session_key.to_string(),
                session_id: session_id.clone(),
                created_at: now,
                updated_at: now,
                adapter_name: None,
                state,
                pid: None,
                archived: false,
                backend_session_id: None,
                name: None,
                model: None,
                cwd: None,
            },
        );

        TraceEvent::BackendSessionId {
            session_id,
            backend_session_id: session_key.to_string(),
        }
        .emit();

        (session, true)
    }

    /// Records still `Starting` for longer than `grace_ms`, not yet
    /// archived — the set the reconnect watchdog relaunches (§4.9).
    pub fn stuck_starting(&self, grace_ms: u64) -> Vec<SessionRecord> {
        let now = Utc::now();
        self.records
            .read()
            .values()
            .filter(|r| {
                r.state == RecordState::Starting
                    && !r.archived
                    && now
                        .signed_duration_since(r.created_at)
                        .num_milliseconds()
                        .max(0) as u64
                        >= grace_ms
            })
            .cloned()
            .collect()
    }

    pub fn mark_connected(&self, session_key: &str, backend_session_id: Option<String>, pid: Option<u32>) {
        if let Some(record) = self.records.write().get_mut(session_key) {
            record.state = RecordState::Connected;
            record.updated_at = Utc::now();
            if backend_session_id.is_some() {
                record.backend_session_id = backend_session_id;
            }
            if pid.is_some() {
                record.pid = pid;
            }
        }
    }

    pub fn mark_exited(&self, session_key: &str) {
        if let Some(record) = self.records.write().get_mut(session_key) {
            record.state = RecordState::Exited;
            record.updated_at = Utc::now();
        }
    }

    pub fn set_adapter_name(&self, session_key: &str, adapter_name: &str) {
        if let Some(record) = self.records.write().get_mut(session_key) {
            record.adapter_name = Some(adapter_name.to_string());
        }
    }

    pub fn set_name(&self, session_key: &str, name: String) {
        if let Some(record) = self.records.write().get_mut(session_key) {
            record.name = Some(name);
        }
    }

    pub fn set_model(&self, session_key: &str, model: String) {
        if let Some(record) = self.records.write().get_mut(session_key) {
            record.model = Some(model);
        }
    }

    pub fn archive(&self, session_key: &str) {
        if let Some(record) = self.records.write().get_mut(session_key) {
            record.archived = true;
        }
    }

    pub fn get(&self, session_key: &str) -> Option<Arc<Session>> {
        self.live.read().get(session_key).cloned()
    }

    /// Drop a session from the live map (does not remove its durable
    /// record — a closed session is still visible in history until its
    /// record is explicitly pruned) and delete its persisted snapshot, if
    /// any (§4.2 Repository "remove ... also deletes persisted snapshot").
    pub fn remove_live(&self, session_key: &str) -> Option<Arc<Session>> {
        TraceEvent::SessionClosed {
            session_id: session_key.to_string(),
        }
        .emit();
        self.snapshots.write().remove(session_key);
        self.live.write().remove(session_key)
    }

    /// Build a [`SessionSnapshot`] from `session`'s current in-memory state
    /// and stash it for the next [`flush`](Self::flush) (§4.2 Repository
    /// "persist(session) — writes state+history+pending to durable
    /// store"). Cheap enough to call after every state-affecting mutation;
    /// the disk write itself happens on the periodic flush tick.
    pub fn persist_snapshot(&self, session: &Session) {
        let pending_permissions = session
            .permissions
            .list_pending()
            .into_iter()
            .map(|p| {
                (
                    p.request_id,
                    PersistedPermission {
                        tool_name: p.tool_name,
                        input: p.input,
                    },
                )
            })
            .collect();
        let snapshot = SessionSnapshot {
            history: session.history_snapshot(),
            pending_messages: session.pending_messages_snapshot(),
            pending_permissions,
            adapter_name: session.adapter_binding().map(|b| b.adapter_name),
        };
        self.snapshots
            .write()
            .insert(session.session_key.clone(), snapshot);
    }

    /// Load every persisted snapshot into memory as a live [`Session`],
    /// paired to its [`SessionRecord`] (§4.2 Repository "restoreAll() —
    /// loads all persisted snapshots into memory, returning count; never
    /// overwrites live sessions"). A snapshot with no matching record (the
    /// record file was pruned, or never flushed) is skipped — there is no
    /// `cwd`/`adapterName` to resume it with.
    pub fn restore_all(&self) -> usize {
        let snapshots: Vec<(String, SessionSnapshot)> = self
            .snapshots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut restored = 0;
        for (session_key, snapshot) in snapshots {
            if self.live.read().contains_key(&session_key) {
                continue;
            }
            let Some(record) = self.records.read().get(&session_key).cloned() else {
                tracing::warn!(session_key, "snapshot has no matching registry record, skipping restore");
                continue;
            };
            let session = Arc::new(Session::new(
                record.session_id.clone(),
                session_key.clone(),
                self.max_history,
            ));
            for message in snapshot.history {
                session.push_history(message);
            }
            for message in snapshot.pending_messages {
                session.buffer_pending_message(message);
            }
            for (_, permission) in snapshot.pending_permissions {
                let _ = session
                    .permissions
                    .request(session_key.clone(), permission.tool_name, permission.input);
            }
            if let Some(adapter_name) = snapshot.adapter_name.or(record.adapter_name.clone()) {
                session.bind_adapter(crate::session::AdapterBinding {
                    adapter_name,
                    inverted: false,
                });
            }
            self.live.write().insert(session_key, session);
            restored += 1;
        }
        restored
    }

    pub fn touch(&self, session_key: &str) {
        if let Some(record) = self.records.write().get_mut(session_key) {
            record.updated_at = Utc::now();
        }
    }

    pub fn list_records(&self) -> Vec<SessionRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Persist all known session records and session snapshots to disk.
    /// Called on the periodic flush tick and on graceful shutdown.
    pub fn flush(&self) -> Result<()> {
        {
            let records = self.records.read();
            self.storage
                .save_all(&records)
                .map_err(|e| Error::Other(format!("flushing session registry: {e}")))?;
        }
        let snapshots = self.snapshots.read();
        self.snapshot_storage
            .save_all(&snapshots)
            .map_err(|e| Error::Other(format!("flushing session snapshots: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_or_create_returns_the_same_session_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::open(dir.path(), 100).unwrap();

        let (first, is_new) = registry.resolve_or_create("sk1");
        assert!(is_new);
        let (second, is_new_again) = registry.resolve_or_create("sk1");
        assert!(!is_new_again);
        assert_eq!(first.session_id, second.session_id);
    }

    #[test]
    fn flush_then_reload_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = SessionRegistry::open(dir.path(), 100).unwrap();
            registry.resolve_or_create("sk1");
            registry.flush().unwrap();
        }
        let reopened = SessionRegistry::open(dir.path(), 100).unwrap();
        assert_eq!(reopened.list_records().len(), 1);
    }

    #[test]
    fn remove_live_drops_from_the_live_map_but_keeps_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::open(dir.path(), 100).unwrap();
        registry.resolve_or_create("sk1");
        assert!(registry.remove_live("sk1").is_some());
        assert!(registry.get("sk1").is_none());
        assert_eq!(registry.list_records().len(), 1);
    }

    fn history_msg(text: &str) -> broker_domain::UnifiedMessage {
        broker_domain::UnifiedMessage::new(
            0,
            broker_domain::MessageType::Assistant,
            broker_domain::Role::Assistant,
            vec![broker_domain::UnifiedContent::text(text)],
        )
    }

    #[test]
    fn persisted_snapshot_survives_a_restart_and_restores_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = SessionRegistry::open(dir.path(), 100).unwrap();
            let (session, _) = registry.resolve_or_create("sk1");
            session.push_history(history_msg("hello"));
            registry.persist_snapshot(&session);
            registry.flush().unwrap();
        }

        let reopened = SessionRegistry::open(dir.path(), 100).unwrap();
        assert!(reopened.get("sk1").is_none());
        let restored = reopened.restore_all();
        assert_eq!(restored, 1);
        let session = reopened.get("sk1").expect("restored session should be live");
        assert_eq!(session.history_snapshot().len(), 1);
        assert_eq!(session.history_snapshot()[0].all_text(), "hello");
    }

    #[test]
    fn restore_all_never_overwrites_an_already_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::open(dir.path(), 100).unwrap();
        let (session, _) = registry.resolve_or_create("sk1");
        session.push_history(history_msg("live"));
        registry.persist_snapshot(&session);

        let restored = registry.restore_all();
        assert_eq!(restored, 0);
        assert_eq!(registry.get("sk1").unwrap().history_snapshot().len(), 1);
    }

    #[test]
    fn remove_live_deletes_the_persisted_snapshot_too() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::open(dir.path(), 100).unwrap();
        let (session, _) = registry.resolve_or_create("sk1");
        registry.persist_snapshot(&session);
        registry.remove_live("sk1");
        registry.flush().unwrap();

        let reopened = SessionRegistry::open(dir.path(), 100).unwrap();
        assert_eq!(reopened.restore_all(), 0);
    }
}
