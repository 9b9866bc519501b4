//! Handler trait for processing listener messages.
//!
//! Implementors provide the broadcast and repeater logic while the server
//! handles connection management, routing and the ping/pong keepalive.

use std::future::Future;
use std::pin::Pin;

use intentcast_protocol::MessageType;
use intentcast_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use intentcast_protocol::envelope::Message;

use crate::connection::{ConnectionId, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from listeners.
///
/// The server dispatches parsed messages to the appropriate method. Each
/// method receives the requesting connection's `sender` and the parsed
/// envelope. Defaults reply with "not implemented".
pub trait Handler: Send + Sync + 'static {
    /// Called for the broadcast types (`INTENTION`, `SACRED_GEOMETRY`,
    /// `FIELD_HARMONICS`, `QUANTUM_RESONANCE`, `DATA`).
    fn on_broadcast(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called for `START_REPEATER`.
    fn on_start_repeater(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `STOP_REPEATER`.
    fn on_stop_repeater(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `GET_REPEATER_STATS`.
    fn on_get_repeater_stats(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `PING`.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, &serde_json::Value::Null) {
                let _ = sender.send_msg(&reply);
            }
        })
    }

    /// Called after a connection has been removed from the registry.
    fn on_disconnected(&self, id: ConnectionId) -> HandlerFuture<'_> {
        let _ = id;
        Box::pin(async {})
    }
}

fn not_implemented<'a>(sender: Sender, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}
