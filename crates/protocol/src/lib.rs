//! Wire protocol for Intentcast.
//!
//! Defines the JSON message envelope exchanged with listeners and the
//! integrity-checked intention packet that rides along in `packetData`.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod packet;

// Re-export primary types for convenience.
pub use constants::{FieldType, MessageType, PacketType};
pub use envelope::{Message, WsError};
pub use error::PacketError;
pub use packet::{IntentionPacket, PacketHeader, PacketPayload, RepeaterFlags, source_address};
