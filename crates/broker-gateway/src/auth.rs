//! API authentication middleware, plus the per-consumer identity provider
//! (§4.4 "authenticateAsync").
//!
//! Reads `AGENT_BROKER_API_TOKEN` once at startup and caches its SHA-256
//! digest in [`AppState`]. When the env var is unset, protected routes are
//! left open — useful for local development, never for a public deployment.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// The identity a [`ConsumerAuthenticator`] resolves a connection to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity {
    pub user_id: String,
}

/// Resolves the identity of a consumer socket from whatever credential the
/// transport carries (§4.4 "authenticateAsync"). A real deployment would
/// implement this against an external identity provider; the gateway ships
/// [`AnonymousAuthenticator`] as its default.
#[async_trait::async_trait]
pub trait ConsumerAuthenticator: Send + Sync {
    async fn authenticate(&self, token: Option<&str>) -> Option<ConsumerIdentity>;
}

/// Default authenticator: every connection succeeds, minted a monotonic
/// `anonymous-{n}` id (§4.4, §8 scenario 1's `userId:"anonymous-1"`). Used
/// when no external identity provider is configured.
pub struct AnonymousAuthenticator {
    next: AtomicU64,
}

impl AnonymousAuthenticator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }
}

impl Default for AnonymousAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConsumerAuthenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _token: Option<&str>) -> Option<ConsumerIdentity> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Some(ConsumerIdentity { user_id: format!("anonymous-{n}") })
    }
}

/// Race `authenticator.authenticate(token)` against a `timeout_ms` deadline,
/// cancelling early if `cancel` resolves first — the socket closing before
/// either settles (§4.4, §5 "authenticateAsync races a timeout,
/// cancel-on-close"). `None` means denied, timed out, or cancelled; the
/// caller can't tell which and shouldn't need to.
pub async fn authenticate_with_timeout<F>(
    authenticator: &dyn ConsumerAuthenticator,
    token: Option<&str>,
    timeout_ms: u64,
    cancel: F,
) -> Option<ConsumerIdentity>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        identity = authenticator.authenticate(token) => identity,
        _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
        _ = cancel => None,
    }
}

pub async fn require_api_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let expected_hash = match &state.api_token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v: &axum::http::HeaderValue| v.to_str().ok())
        .and_then(|v: &str| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.as_slice().ct_eq(expected_hash.as_ref())) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API token" })),
        )
            .into_response();
    }

    next.run(req).await
}

/// Constant-time comparison of two pre-shared tokens, hashed first so
/// lengths don't leak through early-exit comparison.
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    bool::from(ha.ct_eq(&hb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_matches_identical_tokens() {
        assert!(token_eq("secret", "secret"));
    }

    #[test]
    fn token_eq_rejects_different_tokens() {
        assert!(!token_eq("secret", "wrong"));
    }

    #[tokio::test]
    async fn anonymous_authenticator_mints_monotonic_ids() {
        let auth = AnonymousAuthenticator::new();
        let first = auth.authenticate(None).await.unwrap();
        let second = auth.authenticate(None).await.unwrap();
        assert_eq!(first.user_id, "anonymous-1");
        assert_eq!(second.user_id, "anonymous-2");
    }

    #[tokio::test]
    async fn authenticate_with_timeout_resolves_before_the_deadline() {
        let auth = AnonymousAuthenticator::new();
        let identity = authenticate_with_timeout(&auth, None, 5_000, std::future::pending()).await;
        assert!(identity.is_some());
    }

    struct NeverAuthenticator;

    #[async_trait::async_trait]
    impl ConsumerAuthenticator for NeverAuthenticator {
        async fn authenticate(&self, _token: Option<&str>) -> Option<ConsumerIdentity> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn authenticate_with_timeout_denies_on_timeout() {
        let auth = NeverAuthenticator;
        let identity = authenticate_with_timeout(&auth, None, 10, std::future::pending()).await;
        assert!(identity.is_none());
    }

    #[tokio::test]
    async fn authenticate_with_timeout_is_cancelled_by_the_cancel_future() {
        let auth = NeverAuthenticator;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tx.send(()).unwrap();
        let cancel = async {
            let _ = rx.await;
        };
        let identity = authenticate_with_timeout(&auth, None, 5_000, cancel).await;
        assert!(identity.is_none());
    }
}
