use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details carried as the `data` of an `ERROR` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// Envelope for all WebSocket communication.
///
/// `packetData` optionally carries a transport-encoded packet next to the
/// plain `data` object, so consumers that do not understand packets can
/// ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Request correlation id, echoed on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        rename = "packetData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub packet_data: Option<String>,
}

impl Message {
    /// Creates a new message with the given type and data, stamped now.
    pub fn new<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            msg_type,
            data: serde_json::to_value(data)?,
            timestamp: Utc::now(),
            packet_data: None,
        })
    }

    /// Attaches a transport-encoded packet.
    pub fn with_packet(mut self, packet_data: impl Into<String>) -> Self {
        self.packet_data = Some(packet_data.into());
        self
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Deserializes the data object into the given type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Creates an error message.
    pub fn error(id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        let err = WsError {
            code,
            message: message.into(),
        };
        Self {
            id,
            msg_type: MessageType::Error,
            data: serde_json::json!({ "code": err.code, "message": err.message }),
            timestamp: Utc::now(),
            packet_data: None,
        }
    }

    /// Returns the error details if this is an `ERROR` message.
    pub fn as_error(&self) -> Option<WsError> {
        if self.msg_type != MessageType::Error {
            return None;
        }
        self.parse_data().ok()
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut msg = Message::new(msg_type, data)?;
        msg.id = self.id.clone();
        Ok(msg)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(self.id.clone(), code, message)
    }
}
