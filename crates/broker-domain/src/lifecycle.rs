//! Per-session lifecycle state machine (§3 "LifecycleState").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    AwaitingBackend,
    Active,
    Idle,
    Degraded,
    Closing,
    Closed,
}

/// A signal that may trigger a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    BackendConnected,
    BackendDisconnected,
    SessionClosed,
    /// `status_change status=idle`, or inferred from a `result` message.
    StatusIdle,
    /// `stream_event message_start` without `parent_tool_use_id`.
    StreamActive,
}

impl LifecycleState {
    /// Attempt a transition for the given signal. Returns `None` for a
    /// transition the state machine does not define; callers must log and
    /// keep the current state rather than panic (§3: "Invalid transitions
    /// are logged (never throw)").
    pub fn transition(self, signal: LifecycleSignal) -> Option<Self> {
        use LifecycleSignal::*;
        use LifecycleState::*;

        match (self, signal) {
            (_, SessionClosed) => Some(Closed),
            (Closed, _) => None,
            (Closing, _) => None,

            (AwaitingBackend, BackendConnected) => Some(Active),
            (AwaitingBackend, BackendDisconnected) => None,

            (_, BackendDisconnected) => Some(Degraded),
            (Degraded, BackendConnected) => Some(Active),

            (Active, StatusIdle) => Some(Idle),
            (Idle, StreamActive) => Some(Active),
            (Active, StreamActive) => Some(Active),
            (Degraded, StreamActive) => Some(Active),
            (Degraded, StatusIdle) => Some(Idle),

            (Idle, BackendConnected) => Some(Active),
            (Active, BackendConnected) => Some(Active),

            _ => None,
        }
    }

    /// Apply `signal`, logging and no-op'ing on an invalid transition
    /// instead of surfacing an error — mirrors the spec's "never throw".
    pub fn apply(&mut self, signal: LifecycleSignal) {
        match self.transition(signal) {
            Some(next) => {
                if next != *self {
                    tracing::debug!(from = ?*self, to = ?next, ?signal, "lifecycle transition");
                }
                *self = next;
            }
            None => {
                tracing::debug!(state = ?*self, ?signal, "ignored invalid lifecycle transition");
            }
        }
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::AwaitingBackend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleSignal::*;
    use LifecycleState::*;

    #[test]
    fn awaiting_to_active_on_connect() {
        let mut s = AwaitingBackend;
        s.apply(BackendConnected);
        assert_eq!(s, Active);
    }

    #[test]
    fn active_idle_active_roundtrip() {
        let mut s = Active;
        s.apply(StatusIdle);
        assert_eq!(s, Idle);
        s.apply(StreamActive);
        assert_eq!(s, Active);
    }

    #[test]
    fn disconnect_degrades_from_any_live_state() {
        for start in [Active, Idle] {
            let mut s = start;
            s.apply(BackendDisconnected);
            assert_eq!(s, Degraded);
        }
    }

    #[test]
    fn closed_is_terminal() {
        let mut s = Closed;
        s.apply(BackendConnected);
        assert_eq!(s, Closed);
        s.apply(StatusIdle);
        assert_eq!(s, Closed);
    }

    #[test]
    fn session_closed_always_wins() {
        for start in [AwaitingBackend, Active, Idle, Degraded, Closing] {
            let mut s = start;
            s.apply(SessionClosed);
            assert_eq!(s, Closed);
        }
    }

    #[test]
    fn invalid_transition_is_noop_not_panic() {
        let mut s = AwaitingBackend;
        s.apply(StreamActive);
        // No rule for AwaitingBackend + StreamActive: state holds.
        assert_eq!(s, AwaitingBackend);
    }
}
