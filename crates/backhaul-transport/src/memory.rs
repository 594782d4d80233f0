//! In-process transport
//!
//! Sessions are pairs of channels exchanging `tokio::io::duplex` streams.
//! Used by tests and by embedders that run relay and backend in one process.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    BoxedStream, Handshake, MuxSession, SharedSession, TransportConnector, TransportError,
    TransportListener, TransportResult,
};

/// Per-stream buffer size
const STREAM_BUFFER: usize = 64 * 1024;

static NEXT_PORT: AtomicU16 = AtomicU16::new(1);

fn next_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, NEXT_PORT.fetch_add(1, Ordering::Relaxed)))
}

/// One end of an in-memory session
pub struct MemorySession {
    session_id: String,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outgoing: mpsc::Sender<DuplexStream>,
    incoming: Mutex<mpsc::Receiver<DuplexStream>>,
    /// Shared by both ends: closing one side closes the other
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("session_id", &self.session_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl MemorySession {
    /// Create both ends of a session
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let a_addr = next_addr();
        let b_addr = next_addr();

        let a = Arc::new(Self {
            session_id: format!("memory-{}", uuid::Uuid::new_v4()),
            local_addr: a_addr,
            remote_addr: b_addr,
            outgoing: b_tx,
            incoming: Mutex::new(a_rx),
            shutdown: shutdown.clone(),
        });
        let b = Arc::new(Self {
            session_id: format!("memory-{}", uuid::Uuid::new_v4()),
            local_addr: b_addr,
            remote_addr: a_addr,
            outgoing: a_tx,
            incoming: Mutex::new(b_rx),
            shutdown,
        });

        (a, b)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl MuxSession for MemorySession {
    async fn open_stream(&self) -> TransportResult<BoxedStream> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        self.outgoing
            .send(remote)
            .await
            .map_err(|_| TransportError::SessionClosed)?;

        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> TransportResult<Option<BoxedStream>> {
        let mut incoming = self.incoming.lock().await;

        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            stream = incoming.recv() => Ok(stream.map(|s| Box::new(s) as BoxedStream)),
        }
    }

    async fn close(&self, reason: &str) {
        debug!(session_id = %self.session_id, reason, "Closing memory session");
        self.shutdown.cancel();
    }

    async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn protocol(&self) -> &'static str {
        "memory"
    }

    fn session_id(&self) -> String {
        self.session_id.clone()
    }
}

/// Create a connected listener/connector pair
pub fn memory_transport() -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::channel(64);
    let addr = next_addr();

    (
        MemoryListener {
            addr,
            pending: Mutex::new(rx),
        },
        MemoryConnector { pending: tx },
    )
}

/// Accepts sessions created by the matching [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    addr: SocketAddr,
    pending: Mutex<mpsc::Receiver<SharedSession>>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> TransportResult<Handshake> {
        let mut pending = self.pending.lock().await;
        let session = pending.recv().await.ok_or_else(|| {
            TransportError::ConnectionError("All memory connectors dropped".to_string())
        })?;

        Ok(Handshake::ready(session))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    fn protocol(&self) -> &'static str {
        "memory"
    }
}

/// Dials the matching [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    pending: mpsc::Sender<SharedSession>,
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, _addr: SocketAddr, _server_name: &str) -> TransportResult<SharedSession> {
        let (client, server) = MemorySession::pair();

        self.pending
            .send(server)
            .await
            .map_err(|_| TransportError::ConnectionError("Memory listener dropped".to_string()))?;

        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_and_accept() {
        let (a, b) = MemorySession::pair();

        let mut opened = a.open_stream().await.unwrap();
        let mut accepted = b.accept_stream().await.unwrap().unwrap();

        opened.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.write_all(b"pong").await.unwrap();
        opened.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (a, b) = MemorySession::pair();

        a.close("test").await;
        b.closed().await;

        assert!(b.is_closed());
        assert!(b.accept_stream().await.unwrap().is_none());
        assert!(matches!(
            b.open_stream().await,
            Err(TransportError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (a, b) = MemorySession::pair();
        drop(a);

        tokio::time::timeout(std::time::Duration::from_secs(1), b.closed())
            .await
            .expect("peer should observe the drop");
    }

    #[test]
    fn test_pair_addresses_mirror() {
        let (a, b) = MemorySession::pair();
        assert_eq!(a.local_address(), Some(b.remote_address()));
        assert_eq!(b.local_address(), Some(a.remote_address()));
        assert_ne!(a.session_id(), b.session_id());
    }
}
