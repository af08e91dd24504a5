//! Wire message types exchanged across the broker's two public boundaries:
//! the consumer-facing session WebSocket ([`inbound`]/[`outbound`]) and the
//! inverted-connection transport hub backend adapters dial into
//! ([`transport`]).

pub mod inbound;
pub mod outbound;
pub mod transport;

pub use inbound::InboundMessage;
pub use outbound::OutboundMessage;
pub use transport::{TransportMessage, MAX_FRAME_BYTES};

/// Wire protocol version carried on every `session_init` frame (§6). Bump
/// this when a breaking change is made to the consumer-facing frame shapes.
pub const PROTOCOL_VERSION: u32 = 1;
