//! Background controllers the Session Manager owns: the idle reaper and
//! the reconnect watchdog (§4.9). Both are periodic `tokio::spawn` loops,
//! grounded on the teacher's `main.rs` pattern of one `tokio::time::interval`
//! per concern rather than a single shared scheduler.

use std::sync::Arc;
use std::time::Duration;

use crate::session_manager::SessionManager;

/// Tick at `max(1s, idle_timeout_ms / 10)`, per §4.9 — frequent enough
/// that a session isn't kept alive much past its timeout, but not so
/// frequent it dominates the registry lock. A `0` timeout disables the
/// reaper entirely (the task still spawns but every tick is a no-op).
pub fn spawn_idle_reaper(manager: Arc<SessionManager>, idle_timeout_ms: u64) {
    let period = if idle_timeout_ms == 0 {
        Duration::from_secs(30)
    } else {
        Duration::from_millis(idle_timeout_ms / 10).max(Duration::from_secs(1))
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            manager.reap_idle(idle_timeout_ms);
        }
    });
}

/// Scan every 5s for registry entries stuck `Starting` past
/// `reconnect_grace_period_ms` and attempt to relaunch them. A failure
/// on one entry must not stop the scan from reaching the rest.
pub fn spawn_reconnect_watchdog(manager: Arc<SessionManager>, grace_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            manager.relaunch_stuck(grace_ms).await;
        }
    });
}
