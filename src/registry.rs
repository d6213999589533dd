//! Thread-safe registry of live connections.
//!
//! The registry is the single source of truth for which peers are connected
//! and the gate for lifecycle events: `ConnectionAccepted` fires when a
//! session is added and `ConnectionClosed` fires when (and only when) its
//! removal actually takes a session out of the map, so each connection sees
//! each event at most once no matter how many paths race to close it.

use crate::events::{EventBus, NetworkEvent};
use crate::peer::PeerInfo;
use crate::session::{ConnectionId, SessionHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

pub struct ConnectionRegistry {
    inner: Mutex<HashMap<ConnectionId, Arc<SessionHandle>>>,
    next_index: AtomicI32,
    events: EventBus,
}

impl ConnectionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_index: AtomicI32::new(0),
            events,
        }
    }

    /// Register a session, assign it the next peer index and announce it.
    /// Re-adding an already-registered session is a no-op.
    pub fn add(&self, session: Arc<SessionHandle>) {
        let mut inner = self.inner.lock();
        if inner.contains_key(&session.id) {
            return;
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        session.set_index(index);
        inner.insert(session.id, session.clone());
        // Emitted under the mutex (emit is non-blocking) so the accepted
        // notification cannot reorder against a racing removal's closed one.
        self.events.emit(NetworkEvent::ConnectionAccepted(session.peer()));
    }

    /// Remove a session by id. Returns the peer only on the call that
    /// actually removed it, so callers can emit `ConnectionClosed` exactly
    /// once.
    pub fn remove(&self, id: ConnectionId) -> Option<PeerInfo> {
        self.inner.lock().remove(&id).map(|session| session.peer())
    }

    pub fn lookup(&self, peer: &PeerInfo) -> Option<Arc<SessionHandle>> {
        self.inner
            .lock()
            .values()
            .find(|session| &session.peer() == peer)
            .cloned()
    }

    pub fn lookup_host(&self, host: &str, port: u16) -> Option<Arc<SessionHandle>> {
        self.lookup(&PeerInfo::new(host, port, false))
    }

    /// All sessions whose peer address matches `host`, any port. Used when a
    /// policy change has to re-check every connection from one address.
    pub fn by_address(&self, host: &str) -> Vec<Arc<SessionHandle>> {
        self.inner
            .lock()
            .values()
            .filter(|session| session.peer().host.eq_ignore_ascii_case(host))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn hosts(&self) -> Vec<PeerInfo> {
        self.inner
            .lock()
            .values()
            .map(|session| session.peer())
            .collect()
    }

    /// Take every session out of the map without emitting closed events.
    /// Used on shutdown, where the caller tears the sessions down itself.
    pub fn drain(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SecureStream;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_session(host: &str, port: u16) -> (Arc<SessionHandle>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        let keep = client.await.unwrap();
        let (_, writer) = tokio::io::split(SecureStream::Plain(stream));
        (
            Arc::new(SessionHandle::new(PeerInfo::new(host, port, false), writer)),
            keep,
        )
    }

    #[tokio::test]
    async fn add_assigns_indices_and_announces() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let registry = ConnectionRegistry::new(events);

        let (a, _ka) = loopback_session("10.0.0.1", 1000).await;
        let (b, _kb) = loopback_session("10.0.0.2", 1000).await;
        registry.add(a.clone());
        registry.add(b.clone());

        assert_eq!(a.peer().index, 0);
        assert_eq!(b.peer().index, 1);
        assert_eq!(registry.len(), 2);

        match rx.recv().await.unwrap() {
            NetworkEvent::ConnectionAccepted(peer) => assert_eq!(peer.host, "10.0.0.1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_yields_peer_only_once() {
        let registry = ConnectionRegistry::new(EventBus::new(16));
        let (session, _keep) = loopback_session("10.0.0.1", 1000).await;
        registry.add(session.clone());

        assert!(registry.remove(session.id).is_some());
        assert!(registry.remove(session.id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn lookup_matches_case_insensitively() {
        let registry = ConnectionRegistry::new(EventBus::new(16));
        let (session, _keep) = loopback_session("Example.Test", 4400).await;
        registry.add(session);

        assert!(registry.lookup_host("example.test", 4400).is_some());
        assert!(registry.lookup_host("example.test", 4401).is_none());
    }

    #[tokio::test]
    async fn by_address_ignores_port() {
        let registry = ConnectionRegistry::new(EventBus::new(16));
        let (a, _ka) = loopback_session("10.0.0.1", 1000).await;
        let (b, _kb) = loopback_session("10.0.0.1", 2000).await;
        let (c, _kc) = loopback_session("10.0.0.2", 1000).await;
        registry.add(a);
        registry.add(b);
        registry.add(c);

        assert_eq!(registry.by_address("10.0.0.1").len(), 2);
        assert_eq!(registry.by_address("10.0.0.3").len(), 0);
    }

    #[tokio::test]
    async fn drain_empties_without_events() {
        let events = EventBus::new(16);
        let registry = ConnectionRegistry::new(events.clone());
        let (session, _keep) = loopback_session("10.0.0.1", 1000).await;
        registry.add(session);

        let mut rx = events.subscribe();
        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }
}
