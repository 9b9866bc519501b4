//! Error types for the packet codec.

/// Errors produced while building, decoding or verifying a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("malformed packet JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
}
