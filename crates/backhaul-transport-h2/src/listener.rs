//! HTTP/2 listener and connector implementations

use async_trait::async_trait;
use backhaul_transport::{
    Handshake, SharedSession, TransportConnector, TransportError, TransportListener,
    TransportResult,
};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::H2Config;
use crate::session::{H2BackendSession, H2RelaySession, SessionInfo};

fn session_info(
    config: &H2Config,
    local_addr: Option<SocketAddr>,
    remote_addr: SocketAddr,
) -> SessionInfo {
    SessionInfo {
        session_id: format!("h2-{}", uuid::Uuid::new_v4()),
        local_addr,
        remote_addr,
        protocol: config.protocol(),
    }
}

/// HTTP/2 listener for accepting backend connections on the relay
pub struct H2Listener {
    tcp_listener: TcpListener,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Listener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("protocol", &self.config.protocol())
            .finish()
    }
}

impl H2Listener {
    /// Bind a new listener
    pub async fn bind(bind_addr: SocketAddr, config: Arc<H2Config>) -> TransportResult<Self> {
        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| TransportError::BindError {
                    address: bind_addr.to_string(),
                    reason: e.to_string(),
                })?;

        Self::from_listener(tcp_listener, config)
    }

    /// Serve on an already bound TCP listener
    pub fn from_listener(tcp_listener: TcpListener, config: Arc<H2Config>) -> TransportResult<Self> {
        config.validate()?;

        let tls_acceptor = if config.tls {
            Some(config.build_tls_acceptor()?)
        } else {
            None
        };

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!(
            protocol = config.protocol(),
            "HTTP/2 listener bound to {}", local_addr
        );

        Ok(Self {
            tcp_listener,
            tls_acceptor,
            config,
        })
    }
}

#[async_trait]
impl TransportListener for H2Listener {
    async fn accept(&self) -> TransportResult<Handshake> {
        let (tcp_stream, remote_addr) = self
            .tcp_listener
            .accept()
            .await
            .map_err(TransportError::IoError)?;

        debug!("Incoming TCP connection from {}", remote_addr);

        let _ = tcp_stream.set_nodelay(true);
        let local_addr = tcp_stream.local_addr().ok();
        let info = session_info(&self.config, local_addr, remote_addr);
        let tls_acceptor = self.tls_acceptor.clone();
        let config = self.config.clone();

        Ok(Handshake::new(remote_addr, async move {
            let session = match tls_acceptor {
                Some(acceptor) => {
                    let tls_stream = acceptor.accept(tcp_stream).await.map_err(|e| {
                        TransportError::TlsError(format!("TLS handshake failed: {}", e))
                    })?;
                    debug!("TLS handshake complete from {}", remote_addr);
                    H2RelaySession::establish(tls_stream, info, &config).await?
                }
                None => H2RelaySession::establish(tcp_stream, info, &config).await?,
            };

            Ok::<SharedSession, TransportError>(Arc::new(session))
        }))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }

    fn protocol(&self) -> &'static str {
        self.config.protocol()
    }
}

/// HTTP/2 connector for dialing the relay from a backend
pub struct H2Connector {
    tls_connector: Option<tokio_rustls::TlsConnector>,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connector")
            .field("protocol", &self.config.protocol())
            .finish()
    }
}

impl H2Connector {
    pub fn new(config: Arc<H2Config>) -> TransportResult<Self> {
        config.validate()?;

        let tls_connector = if config.tls {
            Some(config.build_tls_connector()?)
        } else {
            None
        };

        debug!(protocol = config.protocol(), "HTTP/2 connector created");

        Ok(Self {
            tls_connector,
            config,
        })
    }
}

#[async_trait]
impl TransportConnector for H2Connector {
    async fn connect(&self, addr: SocketAddr, server_name: &str) -> TransportResult<SharedSession> {
        debug!("Connecting to relay: {} ({})", server_name, addr);

        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let _ = tcp_stream.set_nodelay(true);

        let local_addr = tcp_stream.local_addr().ok();
        let info = session_info(&self.config, local_addr, addr);

        let session = match &self.tls_connector {
            Some(connector) => {
                let dns_name = ServerName::try_from(server_name.to_string())
                    .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

                let tls_stream = connector
                    .connect(dns_name, tcp_stream)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

                H2BackendSession::establish(tls_stream, info, &self.config).await?
            }
            None => H2BackendSession::establish(tcp_stream, info, &self.config).await?,
        };

        info!(
            protocol = self.config.protocol(),
            "HTTP/2 session established to {} ({})", server_name, addr
        );

        Ok(Arc::new(session))
    }
}
