//! One-shot fan-out of a message to every open listener.

use std::sync::Arc;

use intentcast_protocol::constants::{BROADCAST_ADDRESS, DEFAULT_FREQUENCY, FieldType};
use intentcast_protocol::{IntentionPacket, Message, MessageType};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::registry::ConnectionRegistry;

/// Outcome of a single dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Connections the message was queued on.
    pub delivered: usize,
    /// Connections found in a non-open state.
    pub skipped: usize,
    /// Open connections whose send buffer rejected the message.
    pub failed: usize,
}

/// The fields of an `INTENTION` message used to build its packet.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentionData {
    intention: String,
    #[serde(default = "default_frequency")]
    frequency: f64,
    #[serde(default = "default_field_type")]
    field_type: String,
}

fn default_frequency() -> f64 {
    DEFAULT_FREQUENCY
}

fn default_field_type() -> String {
    FieldType::Torus.to_string()
}

/// Sends messages to every connection in a [`ConnectionRegistry`].
///
/// Removal of dead connections is left to their close handlers; the
/// dispatcher only skips them.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Serializes `message` once and queues it on every open connection.
    ///
    /// `INTENTION` messages without `packetData` get a freshly encoded packet
    /// attached first. Never blocks on a slow listener.
    pub fn dispatch(&self, message: Message) -> DispatchReport {
        let message = attach_packet(message);
        let mut report = DispatchReport::default();

        let payload = match serde_json::to_string(&message) {
            Ok(j) => Utf8Bytes::from(j),
            Err(e) => {
                tracing::warn!(msg_type = ?message.msg_type, error = %e, "failed to serialize message");
                return report;
            }
        };

        for (id, sender) in self.registry.snapshot() {
            if !sender.is_connected() {
                report.skipped += 1;
                continue;
            }
            match sender.send_text(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::debug!(conn = %id, error = %e, "dispatch to connection failed");
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            msg_type = ?message.msg_type,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "dispatched message"
        );
        report
    }
}

/// Attaches an encoded packet to `INTENTION` messages that lack one.
fn attach_packet(mut message: Message) -> Message {
    if message.msg_type != MessageType::Intention || message.packet_data.is_some() {
        return message;
    }

    let data: IntentionData = match message.parse_data() {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "intention message without usable data, sending without packet");
            return message;
        }
    };

    let encoded = IntentionPacket::encode(
        &data.intention,
        data.frequency,
        &data.field_type,
        BROADCAST_ADDRESS,
    )
    .and_then(|packet| packet.transport_encode());

    match encoded {
        Ok(packet_data) => message.packet_data = Some(packet_data),
        Err(e) => tracing::warn!(error = %e, "failed to encode intention packet"),
    }
    message
}
