//! Client configuration

use backhaul_transport::{tls, TransportConnector};
use backhaul_transport_h2::{H2Config, H2Connector};
use backhaul_transport_quic::{QuicConfig, QuicConnector};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::error::ClientError;

/// Transport used to reach the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// HTTP/2 over plain TCP
    Tcp,
    /// HTTP/2 over TLS
    Tls,
    /// QUIC, for lossy links
    Quic,
}

impl std::str::FromStr for TransportKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tls" => Ok(Self::Tls),
            "quic" => Ok(Self::Quic),
            other => Err(ClientError::Config(format!(
                "unknown transport {:?} (expected tcp, tls or quic)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportKind,

    /// Relay tunnel address as `host:port`
    pub server_addr: String,

    /// TLS server name; the host part of `server_addr` when unset
    #[serde(default)]
    pub server_name: Option<String>,

    pub token: String,

    pub domain: String,

    /// Local service requests are forwarded to, e.g. `http://127.0.0.1:3000`
    pub backend_url: String,

    /// Skip relay certificate verification (development only)
    #[serde(default)]
    pub insecure: bool,

    /// Extra PEM root certificates to trust for the relay
    #[serde(default)]
    pub root_cert_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(
        transport: TransportKind,
        server_addr: impl Into<String>,
        token: impl Into<String>,
        domain: impl Into<String>,
        backend_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            server_addr: server_addr.into(),
            server_name: None,
            token: token.into(),
            domain: domain.into(),
            backend_url: backend_url.into(),
            insecure: false,
            root_cert_path: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_cert_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.token.is_empty() {
            return Err(ClientError::Config("token must not be empty".to_string()));
        }
        if self.domain.is_empty() {
            return Err(ClientError::Config("domain must not be empty".to_string()));
        }
        if self.server_addr.is_empty() {
            return Err(ClientError::Config(
                "server address must not be empty".to_string(),
            ));
        }

        let backend = Url::parse(&self.backend_url)
            .map_err(|e| ClientError::Config(format!("invalid backend URL: {}", e)))?;
        if backend.scheme() != "http" {
            return Err(ClientError::Config(format!(
                "backend URL must use http, got {}",
                backend.scheme()
            )));
        }
        if backend.host_str().is_none() {
            return Err(ClientError::Config("backend URL has no host".to_string()));
        }

        Ok(())
    }

    /// Name presented for TLS verification
    pub fn server_name(&self) -> String {
        if let Some(name) = &self.server_name {
            return name.clone();
        }

        // Strip the port, including from bracketed IPv6 literals
        let addr = self.server_addr.as_str();
        let host = match addr.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => addr,
        };
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }

    pub async fn resolve(&self) -> Result<SocketAddr, ClientError> {
        tokio::net::lookup_host(&self.server_addr)
            .await
            .map_err(|e| ClientError::Resolve(format!("{}: {}", self.server_addr, e)))?
            .next()
            .ok_or_else(|| ClientError::Resolve(self.server_addr.clone()))
    }

    fn root_certificates(&self) -> Result<Vec<Vec<u8>>, ClientError> {
        match &self.root_cert_path {
            Some(path) => Ok(tls::load_certs(path)?
                .into_iter()
                .map(|cert| cert.as_ref().to_vec())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Build the connector for the configured transport
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connector(&self) -> Result<Arc<dyn TransportConnector>, ClientError> {
        let roots = self.root_certificates()?;

        let connector: Arc<dyn TransportConnector> = match self.transport {
            TransportKind::Tcp => Arc::new(H2Connector::new(Arc::new(H2Config::plain()))?),
            TransportKind::Tls => {
                let mut config = H2Config::client_tls();
                for root in roots {
                    config = config.with_root_certificate(root);
                }
                if self.insecure {
                    config = config.with_insecure_skip_verify();
                }
                Arc::new(H2Connector::new(Arc::new(config))?)
            }
            TransportKind::Quic => {
                let mut config = QuicConfig::client_default();
                for root in roots {
                    config = config.with_root_certificate(root);
                }
                if self.insecure {
                    config = config.with_insecure_skip_verify();
                }
                Arc::new(QuicConnector::new(Arc::new(config))?)
            }
        };

        Ok(connector)
    }
}
