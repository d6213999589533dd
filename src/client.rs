//! Connecting side of the messaging substrate.
//!
//! A client holds exactly one connection. It shares the session, registry
//! and event machinery with the server side, so received data, lifecycle
//! events and the serialized write path behave identically in both
//! directions.

use crate::challenge;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, NetworkEvent};
use crate::peer::PeerInfo;
use crate::registry::ConnectionRegistry;
use crate::session::{read_loop, SecureStream, SessionHandle};
use crate::tls::{self, TlsIdentity};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct MessageClient {
    server: PeerInfo,
    local_addr: SocketAddr,
    session: Arc<SessionHandle>,
    registry: Arc<ConnectionRegistry>,
    events: EventBus,
}

impl MessageClient {
    /// Connect per the configuration, loading any extra trust roots from
    /// their PEM paths.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let extra_roots = tls::load_root_certificates(&config.extra_root_certificate_paths)?;
        Self::connect_with(config, extra_roots, None, None).await
    }

    /// Connect with trust roots, an optional client certificate and an
    /// optional pre-built event bus supplied directly. Subscribing to the
    /// bus before calling this is the way to observe `ConnectionFailed`,
    /// which fires on the failure path where no client value exists to
    /// subscribe through.
    pub async fn connect_with(
        config: ClientConfig,
        extra_roots: Vec<CertificateDer<'static>>,
        identity: Option<TlsIdentity>,
        events: Option<EventBus>,
    ) -> Result<Self> {
        let events = events.unwrap_or_else(|| EventBus::new(config.event_capacity));
        let server = PeerInfo::new(config.host.clone(), config.port, config.secure);
        let timeout = Duration::from_secs(config.challenge_timeout_secs);

        match Self::establish(&config, &events, extra_roots, identity, timeout).await {
            Ok((session, registry, local_addr)) => Ok(Self {
                server,
                local_addr,
                session,
                registry,
                events,
            }),
            Err(err) => {
                events.emit(NetworkEvent::ConnectionFailed(server));
                Err(err)
            }
        }
    }

    async fn establish(
        config: &ClientConfig,
        events: &EventBus,
        extra_roots: Vec<CertificateDer<'static>>,
        identity: Option<TlsIdentity>,
        timeout: Duration,
    ) -> Result<(Arc<SessionHandle>, Arc<ConnectionRegistry>, SocketAddr)> {
        let tcp = tokio::net::TcpStream::connect((config.host.as_str(), config.port)).await?;
        let local_addr = tcp.local_addr()?;
        if let Err(err) = tcp.set_nodelay(true) {
            events.log("WARN", format!("set_nodelay failed: {err}"));
        }

        let mut stream = if config.secure {
            let tls_config = tls::client_config(&extra_roots, identity.as_ref())?;
            let tls_stream = tls::connect(tls_config, &config.host, tcp).await?;
            SecureStream::ClientTls(tls_stream)
        } else {
            SecureStream::Plain(tcp)
        };

        // A challenging server speaks first; answer before anything else.
        if let Some(value) = &config.challenge {
            challenge::respond_to_challenge(
                &mut stream,
                value,
                timeout,
                config.legacy_echo_response,
            )
            .await?;
        }

        if let Some(expected) = &config.require_peer_challenge {
            let matched = challenge::issue_challenge(&mut stream, expected, timeout).await?;
            if !matched {
                return Err(Error::ChallengeFailed);
            }
        }

        let mut peer = PeerInfo::new(config.host.clone(), config.port, config.secure);
        peer.challenge = config.challenge.clone();

        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new(SessionHandle::new(peer, writer));
        registry.add(session.clone());

        tokio::spawn(read_loop(
            reader,
            session.clone(),
            registry.clone(),
            events.clone(),
            config.buffer_size,
        ));

        Ok((session, registry, local_addr))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn server(&self) -> PeerInfo {
        self.server.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        !self.registry.is_empty()
    }

    /// Send one payload to the server.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::PeerNotConnected(self.server.to_string()));
        }
        self.session.send(data).await
    }

    /// Close the connection. The read loop emits the `ConnectionClosed`
    /// event once the session leaves the registry.
    pub async fn disconnect(&self) {
        self.session.shutdown().await;
    }
}
