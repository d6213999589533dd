//! Bidirectional TCP messaging with per-address access control, challenge
//! handshakes and optional TLS.
//!
//! A [`MessageServer`] accepts connections, filters them through a
//! whitelist/blacklist [`AccessControlEngine`] (optionally backed by a
//! length-prefixed JSON challenge exchange), and keeps admitted sessions in
//! a registry. A [`MessageClient`] holds the other end of one such
//! connection. Both sides publish the same [`NetworkEvent`] surface:
//! lifecycle notifications, raw received chunks and log records.
//!
//! Data is unframed: a `MessageReceived` event carries whatever one
//! transport read produced, and senders that need message boundaries layer
//! their own framing on top.

pub mod access_control;
pub mod challenge;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;

pub use access_control::{AccessControlEngine, AccessControlMode, AccessControlRule, Verdict};
pub use client::MessageClient;
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use events::{EventBus, NetworkEvent};
pub use peer::PeerInfo;
pub use server::MessageServer;
pub use tls::TlsIdentity;
