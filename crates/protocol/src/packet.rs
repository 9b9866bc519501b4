//! Integrity-checked intention packets.
//!
//! # Transport format
//!
//! A packet travels as standard base64 over compact JSON:
//!
//! ```text
//! {
//!   "header":  { "version", "type", "sequence", "timestamp",
//!                "sourceAddress", "destinationAddress",
//!                "payloadLength", "repetitionCount"? },
//!   "payload": { "intention", "frequency", "fieldType", "signature",
//!                "checksum", "repeaterOptions"? }
//! }
//! ```
//!
//! `checksum` is the lowercase hex SHA-256 of the payload serialized
//! without the checksum field, in the field order above.

use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{BROADCAST_ADDRESS, PROTOCOL_VERSION, PacketType, SEQUENCE_RANGE};
use crate::error::PacketError;

/// Signature nonce length in bytes (16 hex characters).
const SIGNATURE_BYTES: usize = 8;

/// Packet header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketHeader {
    pub version: u8,
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    /// Randomly drawn, only probabilistically unique.
    pub sequence: u32,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub source_address: String,
    pub destination_address: String,
    /// Byte length of the serialized payload.
    pub payload_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_count: Option<u64>,
}

/// Repeater settings embedded in repeater packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterFlags {
    pub use_hashing: bool,
    pub use_multiplier: bool,
    pub multiplier: u32,
    pub use_compression: bool,
}

/// Packet payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketPayload {
    pub intention: String,
    pub frequency: f64,
    pub field_type: String,
    pub signature: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeater_options: Option<RepeaterFlags>,
}

/// The payload as covered by the checksum: every field except `checksum`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumInput<'a> {
    intention: &'a str,
    frequency: f64,
    field_type: &'a str,
    signature: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeater_options: Option<&'a RepeaterFlags>,
}

impl PacketPayload {
    /// Computes the checksum over every payload field except `checksum`.
    pub fn compute_checksum(&self) -> Result<String, PacketError> {
        let input = ChecksumInput {
            intention: &self.intention,
            frequency: self.frequency,
            field_type: &self.field_type,
            signature: &self.signature,
            repeater_options: self.repeater_options.as_ref(),
        };
        let canonical = serde_json::to_vec(&input)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Recomputes and stores the checksum.
    fn seal(&mut self) -> Result<(), PacketError> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Serialized byte length, as recorded in the header.
    fn byte_len(&self) -> Result<usize, PacketError> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// A complete packet: header plus checksummed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentionPacket {
    pub header: PacketHeader,
    pub payload: PacketPayload,
}

impl IntentionPacket {
    /// Builds an `Intention` packet for the given destination.
    ///
    /// The codec accepts any intention and frequency; callers validate.
    pub fn encode(
        intention: &str,
        frequency: f64,
        field_type: &str,
        destination: &str,
    ) -> Result<Self, PacketError> {
        Self::build(
            PacketType::Intention,
            intention,
            frequency,
            field_type,
            destination,
            None,
        )
    }

    /// Builds a `Repeater` packet addressed to every listener, with
    /// `repetitionCount = 0` and the flags covered by the checksum.
    pub fn encode_repeater(
        intention: &str,
        frequency: f64,
        field_type: &str,
        flags: RepeaterFlags,
    ) -> Result<Self, PacketError> {
        Self::build(
            PacketType::Repeater,
            intention,
            frequency,
            field_type,
            BROADCAST_ADDRESS,
            Some(flags),
        )
    }

    /// Builds a packet of an arbitrary type.
    pub fn build(
        packet_type: PacketType,
        intention: &str,
        frequency: f64,
        field_type: &str,
        destination: &str,
        repeater_options: Option<RepeaterFlags>,
    ) -> Result<Self, PacketError> {
        let mut signature = [0u8; SIGNATURE_BYTES];
        rand::thread_rng().fill(&mut signature);

        let mut payload = PacketPayload {
            intention: intention.to_string(),
            frequency,
            field_type: field_type.to_string(),
            signature: hex::encode(signature),
            checksum: String::new(),
            repeater_options,
        };
        payload.seal()?;

        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type,
            sequence: rand::thread_rng().gen_range(0..SEQUENCE_RANGE),
            timestamp: now_millis(),
            source_address: source_address().to_string(),
            destination_address: destination.to_string(),
            payload_length: payload.byte_len()?,
            repetition_count: repeater_options.map(|_| 0),
        };

        Ok(Self { header, payload })
    }

    /// Derives the packet for the next repeater cycle.
    ///
    /// Returns a new packet carrying `intention`, a fresh timestamp and
    /// checksum and the given repetition count. Everything else carries over.
    pub fn next_cycle(
        &self,
        intention: impl Into<String>,
        repetition: u64,
    ) -> Result<Self, PacketError> {
        let mut payload = PacketPayload {
            intention: intention.into(),
            ..self.payload.clone()
        };
        payload.seal()?;

        let header = PacketHeader {
            timestamp: now_millis(),
            payload_length: payload.byte_len()?,
            repetition_count: Some(repetition),
            ..self.header.clone()
        };

        Ok(Self { header, payload })
    }

    /// Returns `true` if the stored checksum matches the payload exactly.
    pub fn verify(&self) -> bool {
        self.payload
            .compute_checksum()
            .is_ok_and(|computed| computed == self.payload.checksum)
    }

    /// Encodes the packet for transport (base64 over JSON).
    pub fn transport_encode(&self) -> Result<String, PacketError> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decodes a transport string. Does not verify the checksum.
    pub fn transport_decode(encoded: &str) -> Result<Self, PacketError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decodes a transport string and rejects it unless the checksum matches.
    pub fn decode_verified(encoded: &str) -> Result<Self, PacketError> {
        let packet = Self::transport_decode(encoded)?;
        let computed = packet.payload.compute_checksum()?;
        if computed != packet.payload.checksum {
            return Err(PacketError::ChecksumMismatch {
                expected: packet.payload.checksum,
                computed,
            });
        }
        Ok(packet)
    }
}

/// Process-wide source address, generated on first use.
pub fn source_address() -> &'static str {
    static ADDRESS: OnceLock<String> = OnceLock::new();
    ADDRESS.get_or_init(|| {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill(&mut bytes);
        format!("node-{}", hex::encode(bytes))
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
