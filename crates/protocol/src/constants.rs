use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Packet format version written into every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Destination address meaning "every listener".
pub const BROADCAST_ADDRESS: &str = "broadcast";

/// Upper bound (exclusive) for randomly drawn packet sequence numbers.
pub const SEQUENCE_RANGE: u32 = 1_000_000;

/// Frequency used when a request does not carry one (Schumann resonance).
pub const DEFAULT_FREQUENCY: f64 = 7.83;

/// Maximum number of times the repeater multiplier may repeat an intention.
pub const MAX_MULTIPLIER: u32 = 100;

/// How long a stopped repeater stays visible in statistics before purge.
pub const REPEATER_GRACE_WINDOW: Duration = Duration::from_secs(5);

/// Time to wait for a pong response (or any incoming message).
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings to listeners.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum inbound message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Broadcast content
    Data,
    Intention,
    SacredGeometry,
    FieldHarmonics,
    QuantumResonance,
    Repeater,

    // Repeater control (client -> server)
    StartRepeater,
    StopRepeater,
    GetRepeaterStats,

    // Replies (server -> client)
    RepeaterStarted,
    RepeaterStopped,
    RepeaterStats,

    Ping,
    Pong,
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns `true` for types a client may broadcast. `REPEATER` is
    /// only ever produced by the server.
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            MessageType::Data
                | MessageType::Intention
                | MessageType::SacredGeometry
                | MessageType::FieldHarmonics
                | MessageType::QuantumResonance
        )
    }

    /// Packet type carried in the header for this message type, if any.
    pub fn packet_type(self) -> Option<PacketType> {
        match self {
            MessageType::Data => Some(PacketType::Data),
            MessageType::Intention => Some(PacketType::Intention),
            MessageType::SacredGeometry => Some(PacketType::SacredGeometry),
            MessageType::FieldHarmonics => Some(PacketType::FieldHarmonics),
            MessageType::QuantumResonance => Some(PacketType::QuantumResonance),
            MessageType::Repeater => Some(PacketType::Repeater),
            _ => None,
        }
    }
}

/// Numeric packet type written into the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PacketType {
    Data = 0,
    Intention = 1,
    SacredGeometry = 2,
    FieldHarmonics = 3,
    QuantumResonance = 4,
    Repeater = 5,
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Intention),
            2 => Ok(PacketType::SacredGeometry),
            3 => Ok(PacketType::FieldHarmonics),
            4 => Ok(PacketType::QuantumResonance),
            5 => Ok(PacketType::Repeater),
            other => Err(format!("unknown packet type {other}")),
        }
    }
}

/// Known sacred geometry field kinds.
///
/// Packets carry the field type as a free-form string so unknown kinds
/// still round-trip; this enum is used where a known kind is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Torus,
    Merkaba,
    Metatron,
    SriYantra,
    FlowerOfLife,
    PlatonicSolid,
}

impl FieldType {
    pub const ALL: [FieldType; 6] = [
        FieldType::Torus,
        FieldType::Merkaba,
        FieldType::Metatron,
        FieldType::SriYantra,
        FieldType::FlowerOfLife,
        FieldType::PlatonicSolid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Torus => "torus",
            FieldType::Merkaba => "merkaba",
            FieldType::Metatron => "metatron",
            FieldType::SriYantra => "sri_yantra",
            FieldType::FlowerOfLife => "flower_of_life",
            FieldType::PlatonicSolid => "platonic_solid",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown field type: {s}"))
    }
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_UNPROCESSABLE: i32 = 422;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
