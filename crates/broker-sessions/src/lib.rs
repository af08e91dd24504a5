//! Session state and lifecycle management: the live `Session` aggregate,
//! its registry and persistence, the single-slot follow-up queue, the
//! permission bridge, the slash command resolver, and the capabilities
//! handshake waiter.

pub mod capabilities;
pub mod permission;
pub mod queue;
pub mod ratelimit;
pub mod registry;
pub mod session;
pub mod slash;
pub mod snapshot;
pub mod storage;

pub use capabilities::{pair as capabilities_pair, CapabilitiesAnnouncer, CapabilitiesWaiter};
pub use permission::{PermissionBridge, PermissionDecision, PermissionInfo};
pub use queue::{FollowUpQueue, QueueMutationError, QueuedMessage};
pub use ratelimit::TokenBucket;
pub use registry::{RecordState, SessionRecord, SessionRegistry};
pub use session::{AdapterBinding, Consumer, ConsumerHandle, Session};
pub use slash::{strip_local_command_stdout, PassthroughDescriptor, SlashCommandRegistry, SlashCommandSource, WorkspaceCommand};
pub use snapshot::{PersistedPermission, SessionSnapshot};
pub use storage::{JsonFileStorage, Storage};
