//! chatbridge-core: Shared protocol library for the chat bridge.
//!
//! Provides the line-based wire codec (field escaping, splitting, handshake
//! parsing), the message-type registry, and the routing tables that decide
//! where a relayed message goes.

pub mod error;
pub mod message;
pub mod routing;
pub mod wire;

// Re-export commonly used items at crate root.
pub use error::{BridgeError, BridgeResult};
pub use message::{MessageType, TypeRegistry, MSG_PREFIX, SYS_PREFIX};
pub use routing::{RoutingTable, TypeRoute};
pub use wire::{escape, parse_handshake, split_fields, unescape, FIELD_SEP};
