//! Shared application state threaded through every axum handler.

use std::collections::HashMap;
use std::sync::Arc;

use broker_adapters::BackendAdapter;
use broker_domain::Config;
use broker_sessions::SessionRegistry;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::auth::ConsumerAuthenticator;
use crate::session_manager::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>>,
    pub manager: Arc<SessionManager>,
    pub api_token_hash: Option<Arc<[u8]>>,
    pub default_adapter: Arc<str>,
    /// Resolves a consumer socket's identity (§4.4 "authenticateAsync");
    /// defaults to [`crate::auth::AnonymousAuthenticator`] when no external
    /// identity provider is configured.
    pub authenticator: Arc<dyn ConsumerAuthenticator>,
}

impl AppState {
    pub fn adapter(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Check a pre-shared token against the configured API token, for
    /// endpoints (WebSocket upgrades) that can't rely on the `Authorization`
    /// header middleware because browsers can't set custom headers on the
    /// upgrade request.
    pub fn token_matches(&self, provided: &str) -> bool {
        match &self.api_token_hash {
            None => true,
            Some(expected) => {
                let provided_hash = Sha256::digest(provided.as_bytes());
                bool::from(provided_hash.as_slice().ct_eq(expected.as_ref()))
            }
        }
    }
}
