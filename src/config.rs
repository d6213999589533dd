//! Server and client configuration.
//!
//! Both structs deserialize from TOML with defaults for every field, so a
//! minimal file only names what it changes.

use crate::access_control::{AccessControlMode, AccessControlRule};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

fn default_listen_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_buffer_size() -> usize {
    8192
}

fn default_backlog() -> u32 {
    10
}

fn default_challenge_timeout_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    1024
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    /// Port to listen on; 0 asks the OS for an ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// Size of the per-connection read buffer; also the largest chunk a
    /// single `MessageReceived` event can carry.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Wrap every accepted connection in TLS.
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Require connecting clients to present a certificate chaining to one
    /// of `client_root_certificate_paths`.
    #[serde(default)]
    pub require_client_certificate: bool,
    #[serde(default)]
    pub client_root_certificate_paths: Vec<PathBuf>,
    #[serde(default)]
    pub access_control_enabled: bool,
    #[serde(default)]
    pub access_control_mode: AccessControlMode,
    #[serde(default)]
    pub challenge_enabled: bool,
    #[serde(default)]
    pub access_control_rules: Vec<AccessControlRule>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_challenge_timeout_secs")]
    pub challenge_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: 0,
            buffer_size: default_buffer_size(),
            secure: false,
            certificate_path: None,
            private_key_path: None,
            require_client_certificate: false,
            client_root_certificate_paths: Vec::new(),
            access_control_enabled: false,
            access_control_mode: AccessControlMode::default(),
            challenge_enabled: false,
            access_control_rules: Vec::new(),
            backlog: default_backlog(),
            challenge_timeout_secs: default_challenge_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub secure: bool,
    /// Extra PEM roots trusted in addition to the webpki set, for servers
    /// with self-signed or private-CA certificates.
    #[serde(default)]
    pub extra_root_certificate_paths: Vec<PathBuf>,
    /// Value to present when the server issues a challenge. When unset, a
    /// challenging server will reject the connection.
    #[serde(default)]
    pub challenge: Option<String>,
    /// Answer a challenge by echoing the request frame, as some historical
    /// deployments did. Such an answer never satisfies the server.
    #[serde(default)]
    pub legacy_echo_response: bool,
    /// When set, challenge the server after connecting and require this
    /// value back.
    #[serde(default)]
    pub require_peer_challenge: Option<String>,
    #[serde(default = "default_challenge_timeout_secs")]
    pub challenge_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            buffer_size: default_buffer_size(),
            secure: false,
            extra_root_certificate_paths: Vec::new(),
            challenge: None,
            legacy_echo_response: false,
            require_peer_challenge: None,
            challenge_timeout_secs: default_challenge_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }
}
