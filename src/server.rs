//! Accepting side of the messaging substrate.
//!
//! Each accepted connection runs through a fixed admission pipeline before
//! any application data flows: static access-control verdict, TLS handshake
//! when the server is secure, then the challenge exchange when the verdict
//! asks for one. Only admitted connections are registered and announced;
//! everything else is dropped without a trace on the event surface.

use crate::access_control::{AccessControlEngine, AccessControlMode, AccessControlRule, Verdict};
use crate::challenge;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, NetworkEvent};
use crate::peer::PeerInfo;
use crate::registry::ConnectionRegistry;
use crate::session::{read_loop, SecureStream, SessionHandle};
use crate::tls::{self, TlsIdentity};
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

struct ServerShared {
    engine: RwLock<AccessControlEngine>,
    registry: Arc<ConnectionRegistry>,
    events: EventBus,
    /// Current TLS configuration; replaced in place when the certificate is
    /// rotated, so only handshakes started after the swap see the new chain.
    tls: RwLock<Option<Arc<rustls::ServerConfig>>>,
    client_roots: Option<Vec<CertificateDer<'static>>>,
    secure: bool,
    buffer_size: usize,
    challenge_timeout: Duration,
}

pub struct MessageServer {
    shared: Arc<ServerShared>,
    stop: CancellationToken,
    local_addr: SocketAddr,
}

impl MessageServer {
    /// Bind and start accepting. When `secure` is set the certificate chain
    /// and key are loaded from the configured PEM paths.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let identity = if config.secure {
            let cert = config
                .certificate_path
                .as_deref()
                .ok_or_else(|| Error::Config("secure server needs certificate_path".into()))?;
            let key = config
                .private_key_path
                .as_deref()
                .ok_or_else(|| Error::Config("secure server needs private_key_path".into()))?;
            Some(TlsIdentity::from_pem_files(cert, key)?)
        } else {
            None
        };
        Self::start_inner(config, identity).await
    }

    /// Bind and start accepting with an identity supplied by the caller
    /// instead of PEM paths.
    pub async fn start_with_identity(config: ServerConfig, identity: TlsIdentity) -> Result<Self> {
        Self::start_inner(config, Some(identity)).await
    }

    async fn start_inner(config: ServerConfig, identity: Option<TlsIdentity>) -> Result<Self> {
        let events = EventBus::new(config.event_capacity);
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));

        let client_roots = if config.secure && config.require_client_certificate {
            Some(tls::load_root_certificates(
                &config.client_root_certificate_paths,
            )?)
        } else {
            None
        };

        let tls_config = match (&identity, config.secure) {
            (Some(identity), true) => Some(tls::server_config(identity, client_roots.as_deref())?),
            _ => None,
        };

        let engine = AccessControlEngine::new(
            config.access_control_mode,
            config.access_control_enabled,
            config.challenge_enabled,
            config.access_control_rules.clone(),
        );

        let listener = bind_listener(config.listen_address, config.port, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            engine: RwLock::new(engine),
            registry,
            events: events.clone(),
            tls: RwLock::new(tls_config),
            client_roots,
            secure: config.secure,
            buffer_size: config.buffer_size,
            challenge_timeout: Duration::from_secs(config.challenge_timeout_secs),
        });

        let stop = CancellationToken::new();
        tokio::spawn(accept_loop(listener, shared.clone(), stop.clone()));

        events.log("DEBUG", format!("listening on {local_addr}"));
        Ok(Self {
            shared,
            stop,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NetworkEvent> {
        self.shared.events.subscribe()
    }

    /// Connected peers, in registry order.
    pub fn hosts(&self) -> Vec<PeerInfo> {
        self.shared.registry.hosts()
    }

    /// Send to the peer at `host:port`.
    pub async fn send_to(&self, host: &str, port: u16, data: &[u8]) -> Result<()> {
        let session = self
            .shared
            .registry
            .lookup_host(host, port)
            .ok_or_else(|| Error::PeerNotConnected(format!("{host}:{port}")))?;
        session.send(data).await
    }

    pub async fn send_to_peer(&self, peer: &PeerInfo, data: &[u8]) -> Result<()> {
        let session = self
            .shared
            .registry
            .lookup(peer)
            .ok_or_else(|| Error::PeerNotConnected(peer.to_string()))?;
        session.send(data).await
    }

    /// Send to every connected peer. Per-peer failures are logged and do not
    /// stop the sweep.
    pub async fn broadcast(&self, data: &[u8]) {
        for session in self.shared.registry.snapshot() {
            if let Err(err) = session.send(data).await {
                self.shared
                    .events
                    .log("ERROR", format!("send to {} failed: {err}", session.peer()));
            }
        }
    }

    /// Close the connection to the peer at `host:port`.
    pub async fn disconnect_host(&self, host: &str, port: u16) -> Result<()> {
        let session = self
            .shared
            .registry
            .lookup_host(host, port)
            .ok_or_else(|| Error::PeerNotConnected(format!("{host}:{port}")))?;
        session.shutdown().await;
        Ok(())
    }

    /// Close the connection to one peer. The read loop observes the shutdown
    /// and emits the `ConnectionClosed` event.
    pub async fn disconnect(&self, peer: &PeerInfo) -> Result<()> {
        let session = self
            .shared
            .registry
            .lookup(peer)
            .ok_or_else(|| Error::PeerNotConnected(peer.to_string()))?;
        session.shutdown().await;
        Ok(())
    }

    /// Replace the certificate chain for future handshakes. Established
    /// sessions keep their negotiated parameters. Errors on a plaintext
    /// server, which has no handshake to feed the certificate into.
    pub fn update_certificate(&self, identity: TlsIdentity) -> Result<()> {
        if !self.shared.secure {
            return Err(Error::Config(
                "cannot rotate certificate on a plaintext server".into(),
            ));
        }
        let config = tls::server_config(&identity, self.shared.client_roots.as_deref())?;
        *self.shared.tls.write() = Some(config);
        Ok(())
    }

    pub fn access_control_mode(&self) -> AccessControlMode {
        self.shared.engine.read().mode()
    }

    /// Switch between whitelist and blacklist and re-check every connected
    /// peer against the new policy.
    pub async fn set_access_control_mode(&self, mode: AccessControlMode) {
        self.shared.engine.write().set_mode(mode);
        self.reevaluate_all().await;
    }

    pub async fn set_access_control_enabled(&self, enabled: bool) {
        self.shared.engine.write().set_enabled(enabled);
        self.reevaluate_all().await;
    }

    pub async fn set_challenge_enabled(&self, enabled: bool) {
        self.shared.engine.write().set_challenge_enabled(enabled);
        self.reevaluate_all().await;
    }

    /// Add a rule; existing rules for the address win. A new blacklist entry
    /// can evict peers that were admitted before it existed.
    pub async fn add_access_control_rule(&self, rule: AccessControlRule) -> bool {
        let addr = rule.addr;
        let added = self.shared.engine.write().add_rule(rule);
        if added && self.enforcing(AccessControlMode::Blacklist) {
            self.reevaluate_address(addr).await;
        }
        added
    }

    /// Replace the rule for an address and re-check peers from it.
    pub async fn update_access_control_rule(&self, rule: AccessControlRule) -> bool {
        let addr = rule.addr;
        let updated = self.shared.engine.write().update_rule(rule);
        if updated && self.shared.engine.read().is_enabled() {
            self.reevaluate_address(addr).await;
        }
        updated
    }

    /// Remove the rule for an address. Under a whitelist this can evict the
    /// peers the rule was admitting.
    pub async fn remove_access_control_rule(&self, addr: IpAddr) -> bool {
        let removed = self.shared.engine.write().remove_rule(addr);
        if removed && self.enforcing(AccessControlMode::Whitelist) {
            self.reevaluate_address(addr).await;
        }
        removed
    }

    pub fn access_control_rules(&self) -> Vec<AccessControlRule> {
        self.shared.engine.read().rules()
    }

    fn enforcing(&self, mode: AccessControlMode) -> bool {
        let engine = self.shared.engine.read();
        engine.is_enabled() && engine.mode() == mode
    }

    async fn reevaluate_all(&self) {
        for session in self.shared.registry.snapshot() {
            self.reevaluate_session(session).await;
        }
    }

    async fn reevaluate_address(&self, addr: IpAddr) {
        for session in self.shared.registry.by_address(&addr.to_string()) {
            self.reevaluate_session(session).await;
        }
    }

    async fn reevaluate_session(&self, session: Arc<SessionHandle>) {
        let peer = session.peer();
        let Ok(addr) = peer.host.parse::<IpAddr>() else {
            return;
        };
        // Challenges cannot be re-run against a live session, so only the
        // static rule fields apply here.
        let verdict = self.shared.engine.read().evaluate(addr, true);
        if verdict == Verdict::Deny {
            self.shared
                .events
                .log("DEBUG", format!("policy change evicts {peer}"));
            session.shutdown().await;
        }
    }

    /// Stop accepting, tear down every session and return. Sessions torn
    /// down here do not produce `ConnectionClosed` events.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        for session in self.shared.registry.drain() {
            session.shutdown().await;
        }
    }
}

/// Bind through socket2 so the backlog and address reuse are explicit.
fn bind_listener(addr: IpAddr, port: u16, backlog: u32) -> Result<TcpListener> {
    let sock_addr = SocketAddr::new(addr, port);
    let domain = match sock_addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, stop: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_connection(shared, stream, peer_addr).await;
                });
            }
            Err(err) => {
                shared.events.log("ERROR", format!("accept failed: {err}"));
            }
        }
    }
}

async fn handle_connection(shared: Arc<ServerShared>, stream: TcpStream, peer_addr: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        shared
            .events
            .log("WARN", format!("set_nodelay for {peer_addr} failed: {err}"));
    }

    let verdict = shared.engine.read().evaluate(peer_addr.ip(), false);
    if verdict == Verdict::Deny {
        shared
            .events
            .log("DEBUG", format!("denied connection from {peer_addr}"));
        return;
    }

    // TLS first, so a required challenge runs over the protected stream.
    let mut stream = if shared.secure {
        let config = shared.tls.read().clone();
        let Some(config) = config else {
            shared
                .events
                .log("ERROR", "secure server has no TLS configuration".to_string());
            return;
        };
        match tls::accept(config, stream).await {
            Ok(tls_stream) => SecureStream::ServerTls(tls_stream),
            Err(err) => {
                shared
                    .events
                    .log("DEBUG", format!("TLS handshake with {peer_addr} failed: {err}"));
                return;
            }
        }
    } else {
        SecureStream::Plain(stream)
    };

    let mut peer = PeerInfo::new(peer_addr.ip().to_string(), peer_addr.port(), shared.secure);

    if let Verdict::Challenge {
        expected,
        allow_on_match,
    } = verdict
    {
        let matched =
            match challenge::issue_challenge(&mut stream, &expected, shared.challenge_timeout).await
            {
                Ok(matched) => matched,
                Err(Error::ChallengeTimeout) => false,
                Err(err) if err.is_protocol_violation() => {
                    shared
                        .events
                        .log("DEBUG", format!("bad challenge exchange with {peer_addr}: {err}"));
                    false
                }
                Err(err) => {
                    shared
                        .events
                        .log("ERROR", format!("challenge with {peer_addr} failed: {err}"));
                    return;
                }
            };
        if matched != allow_on_match {
            shared
                .events
                .log("DEBUG", format!("challenge verdict rejects {peer_addr}"));
            return;
        }
        if matched {
            peer.challenge = Some(expected);
        }
    }

    let (reader, writer) = tokio::io::split(stream);
    let session = Arc::new(SessionHandle::new(peer, writer));
    shared.registry.add(session.clone());
    read_loop(
        reader,
        session,
        shared.registry.clone(),
        shared.events.clone(),
        shared.buffer_size,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_on_ephemeral_port() {
        let server = MessageServer::start(ServerConfig::default()).await.unwrap();
        assert_ne!(server.port(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn two_servers_do_not_share_a_port() {
        let a = MessageServer::start(ServerConfig::default()).await.unwrap();
        let b = MessageServer::start(ServerConfig::default()).await.unwrap();
        assert_ne!(a.port(), b.port());
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn certificate_rotation_on_plaintext_server_is_an_error() {
        let server = MessageServer::start(ServerConfig::default()).await.unwrap();
        let identity = TlsIdentity::self_signed(vec!["localhost".to_string()]).unwrap();
        let err = server.update_certificate(identity).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_an_error() {
        let server = MessageServer::start(ServerConfig::default()).await.unwrap();
        let err = server.send_to("10.1.2.3", 9, b"x").await.unwrap_err();
        assert!(matches!(err, Error::PeerNotConnected(_)));
        server.shutdown().await;
    }
}
