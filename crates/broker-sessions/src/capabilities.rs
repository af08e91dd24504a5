//! Capabilities handshake policy (§4.7): a freshly connected backend has
//! five seconds to report its `{commands, models, account}` tuple before the
//! broker gives up waiting and marks capabilities unknown rather than
//! blocking the session indefinitely.

use std::time::Duration;

use broker_domain::{config::timeouts, Capabilities, TraceEvent};
use tokio::sync::oneshot;
use tokio::time::timeout;

pub struct CapabilitiesWaiter {
    rx: oneshot::Receiver<Capabilities>,
    deadline: Duration,
}

pub struct CapabilitiesAnnouncer {
    tx: oneshot::Sender<Capabilities>,
}

/// Build a linked waiter/announcer pair for one session's handshake.
pub fn pair() -> (CapabilitiesWaiter, CapabilitiesAnnouncer) {
    let (tx, rx) = oneshot::channel();
    (
        CapabilitiesWaiter {
            rx,
            deadline: Duration::from_millis(timeouts::INITIALIZE_MS),
        },
        CapabilitiesAnnouncer { tx },
    )
}

impl CapabilitiesAnnouncer {
    /// The backend reported its capabilities; send them to whoever is
    /// waiting. A dropped receiver (session already closed) is not an
    /// error.
    pub fn announce(self, capabilities: Capabilities) {
        let _ = self.tx.send(capabilities);
    }
}

impl CapabilitiesWaiter {
    /// Wait up to the handshake deadline for capabilities. `None` means the
    /// backend never reported in time, per §4.7 and §7 `CapabilitiesTimeout`.
    pub async fn wait(self, session_id: &str) -> Option<Capabilities> {
        match timeout(self.deadline, self.rx).await {
            Ok(Ok(caps)) => {
                TraceEvent::CapabilitiesReady {
                    session_id: session_id.to_string(),
                    commands: caps.commands.len(),
                    models: caps.models.len(),
                }
                .emit();
                Some(caps)
            }
            Ok(Err(_)) | Err(_) => {
                TraceEvent::CapabilitiesTimeout {
                    session_id: session_id.to_string(),
                }
                .emit();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn announce_before_wait_resolves_immediately() {
        let (waiter, announcer) = pair();
        announcer.announce(Capabilities {
            commands: vec!["/help".into()],
            models: vec!["gpt-5".into()],
            account: None,
        });
        let caps = waiter.wait("s1").await.unwrap();
        assert_eq!(caps.commands, vec!["/help".to_string()]);
    }

    #[tokio::test]
    async fn dropped_announcer_resolves_to_none() {
        let (waiter, announcer) = pair();
        drop(announcer);
        assert!(waiter.wait("s1").await.is_none());
    }
}
