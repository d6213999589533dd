//! Observer fan-out for connection lifecycle and data delivery.
//!
//! Both the server and the client publish the same event surface over a
//! broadcast channel: lifecycle notifications carrying a [`PeerInfo`], raw
//! received chunks, and log records. Delivery is fire-and-forget; a lagging
//! subscriber drops events rather than applying backpressure to the
//! connection tasks.

use crate::peer::PeerInfo;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// A connection was accepted (server) or established (client) and
    /// registered. Fired at most once per connection.
    ConnectionAccepted(PeerInfo),
    /// A registered connection went away. Fired at most once per connection.
    ConnectionClosed(PeerInfo),
    /// An outbound connection attempt did not produce a session.
    ConnectionFailed(PeerInfo),
    /// A chunk of application data, delivered exactly as read from the
    /// transport. No framing or reassembly is applied.
    MessageReceived { peer: PeerInfo, data: Bytes },
    /// A log record: timestamp, level tag and message.
    Log {
        at: DateTime<Utc>,
        level: String,
        message: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers. A send with no
    /// subscribers is not an error.
    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }

    /// Emit a log event and mirror it to the `tracing` subscriber.
    pub fn log(&self, level: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            "ERROR" => tracing::error!("{message}"),
            "WARN" => tracing::warn!("{message}"),
            _ => tracing::debug!("{message}"),
        }
        self.emit(NetworkEvent::Log {
            at: Utc::now(),
            level: level.to_string(),
            message,
        });
    }
}
