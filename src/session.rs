//! Per-connection session state and the read loop.
//!
//! A session owns the write half of its stream behind an async mutex, so
//! concurrent senders serialize whole payloads rather than interleaving
//! bytes. The read half is consumed by [`read_loop`], which emits
//! `MessageReceived` for every chunk and drives the single orderly-close
//! path through the registry.

use crate::events::{EventBus, NetworkEvent};
use crate::peer::PeerInfo;
use crate::registry::ConnectionRegistry;
use crate::error::Result;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A plain or TLS-wrapped TCP stream behind one read/write interface.
pub enum SecureStream {
    Plain(TcpStream),
    ServerTls(tokio_rustls::server::TlsStream<TcpStream>),
    ClientTls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SecureStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            SecureStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SecureStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            SecureStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SecureStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            SecureStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SecureStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            SecureStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Shared handle to one live connection.
pub struct SessionHandle {
    pub id: ConnectionId,
    peer: parking_lot::RwLock<PeerInfo>,
    writer: tokio::sync::Mutex<WriteHalf<SecureStream>>,
    closed: CancellationToken,
}

impl SessionHandle {
    pub fn new(peer: PeerInfo, writer: WriteHalf<SecureStream>) -> Self {
        Self {
            id: next_connection_id(),
            peer: parking_lot::RwLock::new(peer),
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> PeerInfo {
        self.peer.read().clone()
    }

    pub fn set_index(&self, index: i32) {
        self.peer.write().index = index;
    }

    /// Write one payload atomically with respect to other senders.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side and signal the read loop to stop.
    pub async fn shutdown(&self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.closed.cancel();
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

/// An error class that means the connection is gone, as opposed to a
/// transient read failure.
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Pump the read half until the connection ends.
///
/// Every non-empty read becomes one `MessageReceived` with the chunk exactly
/// as read. End of stream, a disconnect-class error or local shutdown all
/// converge on the same close path: the registry removal gates the single
/// `ConnectionClosed` event.
pub async fn read_loop(
    mut reader: ReadHalf<SecureStream>,
    session: Arc<SessionHandle>,
    registry: Arc<ConnectionRegistry>,
    events: EventBus,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let read = tokio::select! {
            _ = session.closed().cancelled() => Ok(0),
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                events.emit(NetworkEvent::MessageReceived {
                    peer: session.peer(),
                    data: Bytes::copy_from_slice(&buf[..n]),
                });
            }
            Err(err) if is_disconnect(&err) => break,
            Err(err) => {
                events.log(
                    "ERROR",
                    format!("read error on {}: {err}", session.peer()),
                );
            }
        }
    }
    if let Some(peer) = registry.remove(session.id) {
        events.emit(NetworkEvent::ConnectionClosed(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
    }

    #[test]
    fn disconnect_classification() {
        assert!(is_disconnect(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(is_disconnect(&io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe"
        )));
        assert!(!is_disconnect(&io::Error::new(
            io::ErrorKind::InvalidData,
            "bad"
        )));
    }

    #[tokio::test]
    async fn send_writes_whole_payload() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let mut client_stream = client.await.unwrap();

        let (_, writer) = tokio::io::split(SecureStream::Plain(server_stream));
        let session = SessionHandle::new(PeerInfo::new("127.0.0.1", addr.port(), false), writer);
        session.send(b"hello there").await.unwrap();

        let mut buf = [0u8; 32];
        let n = client_stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello there");
    }
}
