//! Transport abstraction layer for backhaul sessions
//!
//! A backend client keeps one outbound connection to the relay. That
//! connection is split into many independent byte streams (a multiplexed
//! session): the relay opens one stream per forwarded HTTP exchange, and the
//! backend client serves whatever arrives on it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              backhaul-relay / backhaul-client            │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │          backhaul-transport (this crate)                 │
//! │  - MuxSession           - TransportListener              │
//! │  - Handshake            - TransportConnector             │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────┬──────────────────┬───────────────────┐
//! │ backhaul-        │ backhaul-        │ memory            │
//! │ transport-h2     │ transport-quic   │ (tests)           │
//! │ (tcp, tls)       │ (quic)           │                   │
//! └──────────────────┴──────────────────┴───────────────────┘
//! ```

pub mod memory;
pub mod tls;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{memory_transport, MemoryConnector, MemoryListener, MemorySession};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Session closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream carried by a multiplexed session
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased session stream
pub type BoxedStream = Box<dyn StreamIo>;

/// One transport connection split into many independent byte streams
///
/// Either peer may open streams; the relay opens them and the backend client
/// accepts them.
#[async_trait]
pub trait MuxSession: Send + Sync + Debug {
    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<BoxedStream>;

    /// Accept the next stream opened by the peer
    ///
    /// Returns `None` once the session is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<BoxedStream>>;

    /// Close the session and the underlying connection
    async fn close(&self, reason: &str);

    /// Resolves when the session is closed, locally or by the peer
    async fn closed(&self);

    /// Check if the session is closed
    fn is_closed(&self) -> bool;

    /// Get the local address of the underlying connection, if it has one
    fn local_address(&self) -> Option<SocketAddr>;

    /// Get the remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Short protocol name ("tcp", "tls", "quic", "memory")
    fn protocol(&self) -> &'static str;

    /// Get a unique stable identifier for this session
    fn session_id(&self) -> String;
}

/// Shared handle to a session
pub type SharedSession = Arc<dyn MuxSession>;

/// An accepted connection whose session handshake has not run yet
///
/// TLS and multiplexer handshakes are deferred so that the accept loop never
/// blocks on a slow peer; the per-connection task calls [`Handshake::establish`].
pub struct Handshake {
    peer_addr: SocketAddr,
    establish: BoxFuture<'static, TransportResult<SharedSession>>,
}

impl Handshake {
    pub fn new<F>(peer_addr: SocketAddr, establish: F) -> Self
    where
        F: Future<Output = TransportResult<SharedSession>> + Send + 'static,
    {
        Self {
            peer_addr,
            establish: Box::pin(establish),
        }
    }

    /// Wrap an already established session
    pub fn ready(session: SharedSession) -> Self {
        let peer_addr = session.remote_address();
        Self::new(peer_addr, async move { Ok(session) })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Run the deferred handshake
    pub async fn establish(self) -> TransportResult<SharedSession> {
        self.establish.await
    }
}

impl Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Relay side: accepts incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// Accept an incoming connection
    async fn accept(&self) -> TransportResult<Handshake>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Short protocol name of the sessions this listener produces
    fn protocol(&self) -> &'static str;
}

/// Backend side: establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Connect to a relay
    ///
    /// # Arguments
    /// * `addr` - The socket address to connect to
    /// * `server_name` - The server name for TLS verification (ignored by plain transports)
    async fn connect(&self, addr: SocketAddr, server_name: &str) -> TransportResult<SharedSession>;
}

/// TLS settings shared by the encrypted transports
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates, DER encoded (webpki roots when empty)
    pub root_certs: Vec<Vec<u8>>,

    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec!["backhaul-v1".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::BindError {
            address: "0.0.0.0:443".to_string(),
            reason: "address in use".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to bind to 0.0.0.0:443: address in use"
        );
    }

    #[test]
    fn test_security_defaults() {
        let security = TransportSecurityConfig::default();
        assert!(security.verify_server_cert);
        assert!(security.root_certs.is_empty());
    }

    #[tokio::test]
    async fn test_ready_handshake() {
        let (listener, connector) = memory_transport();
        let addr = listener.local_addr().unwrap();
        let client = connector.connect(addr, "memory").await.unwrap();
        let handshake = listener.accept().await.unwrap();

        assert_eq!(handshake.peer_addr(), client.local_address().unwrap());
        let server = handshake.establish().await.unwrap();
        assert_eq!(server.protocol(), "memory");
    }
}
