use serde::{Deserialize, Serialize};

/// Where a backend adapter's process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// A local subprocess the broker spawns and supervises.
    Local,
    /// A remote HTTP/SSE endpoint.
    Remote,
}

/// The capability descriptor every [`crate::adapter::BackendAdapter`]
/// (defined in `broker-adapters`, referenced here so both session state
/// and adapters agree on the shape) exposes. A plain value — no
/// inheritance, per the design notes' polymorphism guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub permissions: bool,
    pub slash_commands: bool,
    pub availability: Availability,
    pub teams: bool,
}

/// The `{commands, models, account}` tuple reported by a backend's
/// initialize handshake (§4.7), attached to `SessionState.capabilities`
/// once known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub account: Option<String>,
}
