//! The adapter seam (§4.1 "Backend Adapter"): every concrete backend —
//! subprocess CLI, HTTP/SSE service, or spawn-and-listen process — is
//! reached only through [`BackendAdapter`] and the [`BackendHandle`] it
//! hands back. The router and session manager never know which kind of
//! backend they're talking to.

use async_trait::async_trait;
use broker_domain::{AdapterCapabilities, Error, Result, UnifiedMessage};
use tokio::sync::mpsc;

/// A running connection to one backend instance, scoped to a single
/// session. Dropping the last clone of the send half does not tear down
/// the backend — callers must call [`BackendHandle::shutdown`] explicitly
/// so adapters can do orderly cleanup (closing stdin before killing, etc).
pub struct BackendHandle {
    /// Normalized messages to deliver to the backend.
    pub outbound: mpsc::Sender<UnifiedMessage>,
    /// Normalized messages the backend produced, translated from its
    /// native wire format by the adapter itself.
    pub inbound: mpsc::Receiver<Result<UnifiedMessage>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl BackendHandle {
    pub fn new(
        outbound: mpsc::Sender<UnifiedMessage>,
        inbound: mpsc::Receiver<Result<UnifiedMessage>>,
        shutdown_tx: tokio::sync::oneshot::Sender<()>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Signal the adapter's background task to wind down. Safe to call
    /// more than once; later calls are no-ops.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A concrete backend integration. One adapter instance is shared across
/// every session that uses it; [`start`](BackendAdapter::start) is called
/// once per session.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// A stable, human-readable identifier (e.g. `"claude-cli"`,
    /// `"codex-remote"`), used in trace events and `cli_connected`.
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Start (or attach to, for inverted adapters) a backend instance for
    /// `session_key`, returning the duplex handle the session manager
    /// drives. `cwd` is the working directory the backend should operate
    /// in, when the adapter supports one.
    async fn start(&self, session_key: &str, cwd: Option<&str>) -> Result<BackendHandle>;
}

/// Shared helper: translate a backend-adapter-layer I/O failure into the
/// domain error the router expects, without leaking raw secrets the
/// underlying error might carry (API keys in a reqwest error, etc).
pub fn adapter_io_error(context: &str, detail: impl std::fmt::Display) -> Error {
    Error::BackendUnavailable(format!("{context}: {}", mask_secrets(&detail.to_string())))
}

/// Mask substrings that look like API keys or tokens before they reach a
/// log line or an error surfaced to a consumer.
pub fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = if trimmed.len() > 8 {
                format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..])
            } else {
                "***masked***".to_string()
            };
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_secrets_redacts_long_token_like_substrings() {
        let msg = "request failed: Authorization sk-proj-abcdefghijklmnopqrstuvwxyz rejected";
        let masked = mask_secrets(msg);
        assert!(!masked.contains("abcdefghijklmnopqrstuvwxyz"));
        assert!(masked.contains("sk-p"));
    }

    #[test]
    fn mask_secrets_leaves_short_words_alone() {
        let msg = "connection refused on port 8787";
        assert_eq!(mask_secrets(msg), msg);
    }
}
