//! Shared types for the agent session broker: the unified message model,
//! session state bag, lifecycle state machine, capability descriptors,
//! configuration, and structured trace events. Every other `broker-*`
//! crate depends on this one and nothing in here depends on them.

pub mod capability;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod session_state;
pub mod trace;

pub use capability::{AdapterCapabilities, Availability, Capabilities};
pub use config::{Config, ConfigIssue, ConfigSeverity, RateLimitConfig};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleSignal, LifecycleState};
pub use message::{MessageType, Role, UnifiedContent, UnifiedMessage};
pub use session_state::{CircuitBreakerInfo, GitInfo, SessionState, TeamState, Usage};
pub use trace::TraceEvent;
