//! Permission bridge (§4.8): correlates a backend's `permission_request`
//! with the consumer's eventual `permission_response`, with a timeout that
//! resolves to denial so a stuck consumer never wedges the backend turn.

use std::collections::HashMap;
use std::time::Duration;

use broker_domain::config::timeouts;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum PermissionDecision {
    Approved { always_allow: bool },
    Denied { reason: Option<String> },
}

pub struct PendingPermission {
    pub request_id: Uuid,
    pub session_id: String,
    pub tool_name: String,
    pub input: Value,
    respond: oneshot::Sender<PermissionDecision>,
}

#[derive(Debug, Clone)]
pub struct PermissionInfo {
    pub request_id: Uuid,
    pub session_id: String,
    pub tool_name: String,
    pub input: Value,
}

impl From<&PendingPermission> for PermissionInfo {
    fn from(p: &PendingPermission) -> Self {
        Self {
            request_id: p.request_id,
            session_id: p.session_id.clone(),
            tool_name: p.tool_name.clone(),
            input: p.input.clone(),
        }
    }
}

/// Tracks permission requests awaiting a consumer decision.
pub struct PermissionBridge {
    pending: RwLock<HashMap<Uuid, PendingPermission>>,
    timeout: Duration,
}

impl PermissionBridge {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Default timeout per §5: two minutes, after which the request is
    /// auto-denied and the backend turn resumes rather than stalling.
    pub fn with_default_timeout() -> Self {
        Self::new(Duration::from_millis(timeouts::PERMISSION_MS))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new pending request, returning its receiver and a
    /// serializable snapshot to broadcast to consumers.
    pub fn request(
        &self,
        session_id: String,
        tool_name: String,
        input: Value,
    ) -> (Uuid, oneshot::Receiver<PermissionDecision>, PermissionInfo) {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let pending = PendingPermission {
            request_id,
            session_id,
            tool_name,
            input,
            respond: tx,
        };
        let info = PermissionInfo::from(&pending);
        self.pending.write().insert(request_id, pending);
        (request_id, rx, info)
    }

    /// Resolve a pending request with the consumer's decision. Returns
    /// `false` if the request is unknown — already resolved, timed out, or
    /// cancelled.
    pub fn resolve(&self, request_id: &Uuid, decision: PermissionDecision) -> bool {
        if let Some(pending) = self.pending.write().remove(request_id) {
            let _ = pending.respond.send(decision);
            true
        } else {
            false
        }
    }

    /// Cancel a pending request without resolving its waiter — used when
    /// the session closes or the backend itself withdraws the request.
    pub fn cancel(&self, request_id: &Uuid) -> Option<PermissionInfo> {
        self.pending
            .write()
            .remove(request_id)
            .as_ref()
            .map(PermissionInfo::from)
    }

    /// Resolve every pending request for `session_id` with `decision`,
    /// waking each waiter rather than merely dropping it — used on session
    /// close and adapter disconnect (§4.8 step 5 "resolve every outstanding
    /// request with deny"). Returns the infos so the caller can broadcast a
    /// `permission_cancelled` per entry.
    pub fn resolve_all_for_session(&self, session_id: &str, decision: PermissionDecision) -> Vec<PermissionInfo> {
        let mut pending = self.pending.write();
        let ids: Vec<Uuid> = pending
            .values()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.request_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id))
            .map(|p| {
                let info = PermissionInfo::from(&p);
                let _ = p.respond.send(decision.clone());
                info
            })
            .collect()
    }

    pub fn cancel_all_for_session(&self, session_id: &str) -> Vec<PermissionInfo> {
        let mut pending = self.pending.write();
        let ids: Vec<Uuid> = pending
            .values()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.request_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id))
            .map(|p| PermissionInfo::from(&p))
            .collect()
    }

    pub fn list_pending(&self) -> Vec<PermissionInfo> {
        self.pending.read().values().map(PermissionInfo::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> PermissionBridge {
        PermissionBridge::new(Duration::from_secs(120))
    }

    #[tokio::test]
    async fn approve_resolves_the_waiter() {
        let b = bridge();
        let (id, rx, _info) = b.request("s1".into(), "bash".into(), Value::Null);
        assert!(b.resolve(&id, PermissionDecision::Approved { always_allow: false }));
        let decision = rx.await.unwrap();
        assert!(matches!(decision, PermissionDecision::Approved { .. }));
        assert!(b.list_pending().is_empty());
    }

    #[tokio::test]
    async fn deny_resolves_the_waiter_with_reason() {
        let b = bridge();
        let (id, rx, _info) = b.request("s1".into(), "bash".into(), Value::Null);
        b.resolve(&id, PermissionDecision::Denied { reason: Some("nope".into()) });
        match rx.await.unwrap() {
            PermissionDecision::Denied { reason } => assert_eq!(reason.as_deref(), Some("nope")),
            _ => panic!("expected denial"),
        }
    }

    #[test]
    fn resolve_unknown_request_returns_false() {
        let b = bridge();
        assert!(!b.resolve(&Uuid::new_v4(), PermissionDecision::Approved { always_allow: false }));
    }

    #[test]
    fn cancel_all_for_session_only_touches_that_session() {
        let b = bridge();
        let (_id1, _rx1, _i1) = b.request("s1".into(), "bash".into(), Value::Null);
        let (_id2, _rx2, _i2) = b.request("s2".into(), "bash".into(), Value::Null);
        let cancelled = b.cancel_all_for_session("s1");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(b.list_pending().len(), 1);
        assert_eq!(b.list_pending()[0].session_id, "s2");
    }
}
