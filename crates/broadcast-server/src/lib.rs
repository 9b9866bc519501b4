//! WebSocket broadcaster for Intentcast.
//!
//! Accepts any number of listener connections, fans intentions out to all of
//! them and runs repeaters that re-transmit a mutating intention at a fixed
//! rate until stopped.

mod connection;
mod dispatcher;
mod field;
mod handler;
mod registry;
mod repeater;
mod server;
mod service;

pub use connection::{ClientConnection, ConnectionId, SendError, Sender};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use field::{FieldGenerator, NoopField};
pub use handler::{Handler, HandlerFuture};
pub use registry::ConnectionRegistry;
pub use repeater::{
    BroadcastDetail, BroadcastId, BroadcastStats, RepeaterError, RepeaterOptions,
    RepeaterScheduler, RepeaterState, RepeaterStats, SchedulerConfig,
};
pub use server::{BroadcastServer, ServerConfig};
pub use service::{IntentionService, ServiceConfig};

/// Per-connection send buffer capacity.
///
/// A repeater at a high rate enqueues one message per cycle on every
/// listener; a listener that falls this far behind starts losing messages.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the broadcast server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
