//! QUIC listener and connector implementations

use async_trait::async_trait;
use backhaul_transport::{
    Handshake, SharedSession, TransportConnector, TransportError, TransportListener,
    TransportResult,
};
use quinn::Endpoint;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::QuicConfig;
use crate::session::QuicSession;

/// QUIC listener for accepting backend connections on the relay
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let server_config = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(|e| TransportError::BindError {
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self {
            endpoint,
            local_addr,
        })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    async fn accept(&self) -> TransportResult<Handshake> {
        let incoming = self.endpoint.accept().await.ok_or_else(|| {
            TransportError::ConnectionError("QUIC endpoint closed".to_string())
        })?;

        let remote = incoming.remote_address();
        let local_addr = self.local_addr;
        debug!("Incoming QUIC connection from {}", remote);

        Ok(Handshake::new(remote, async move {
            let connection = incoming
                .await
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

            debug!("QUIC connection established from {}", remote);
            Ok::<SharedSession, TransportError>(Arc::new(QuicSession::new(
                connection,
                Some(local_addr),
            )))
        }))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    fn protocol(&self) -> &'static str {
        "quic"
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"Listener closed");
    }
}

/// QUIC connector for dialing the relay from a backend
#[derive(Debug)]
pub struct QuicConnector {
    endpoint_v4: Endpoint,
    endpoint_v6: Option<Endpoint>,
}

impl QuicConnector {
    /// Must be called from within a Tokio runtime
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let client_config = config.build_client_config()?;

        let mut endpoint_v4 =
            Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).map_err(TransportError::IoError)?;
        endpoint_v4.set_default_client_config(client_config.clone());

        // Hosts without IPv6 still get a working connector
        let endpoint_v6 = Endpoint::client(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
            .ok()
            .map(|mut endpoint| {
                endpoint.set_default_client_config(client_config);
                endpoint
            });

        debug!("QUIC connector created");

        Ok(Self {
            endpoint_v4,
            endpoint_v6,
        })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    async fn connect(&self, addr: SocketAddr, server_name: &str) -> TransportResult<SharedSession> {
        debug!("Connecting to QUIC relay: {} ({})", server_name, addr);

        let endpoint = match (addr, &self.endpoint_v6) {
            (SocketAddr::V6(_), Some(v6)) => v6,
            (SocketAddr::V6(_), None) => {
                return Err(TransportError::ConfigurationError(
                    "IPv6 is unavailable on this host".to_string(),
                ))
            }
            (SocketAddr::V4(_), _) => &self.endpoint_v4,
        };

        let connecting = endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        let local_addr = endpoint.local_addr().ok();
        Ok(Arc::new(QuicSession::new(connection, local_addr)))
    }
}
