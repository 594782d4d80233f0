//! HTTP/2 transport configuration

use backhaul_transport::tls::{self, CertificateSource};
use backhaul_transport::{TransportError, TransportResult, TransportSecurityConfig};
use std::path::PathBuf;
use std::sync::Arc;

const ALPN_H2: &str = "h2";

/// HTTP/2-specific configuration
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Security configuration
    security: TransportSecurityConfig,

    /// Wrap the TCP connection in TLS
    pub tls: bool,

    /// Server certificate and key (for relays with TLS)
    pub server_identity: Option<CertificateSource>,

    /// Initial stream window size
    pub initial_window_size: u32,

    /// Initial connection window size
    pub initial_connection_window_size: u32,

    /// Maximum concurrent streams the relay may open on one backend session
    pub max_concurrent_streams: u32,

    /// Maximum frame size
    pub max_frame_size: u32,
}

impl H2Config {
    fn base(tls: bool) -> Self {
        Self {
            security: TransportSecurityConfig {
                alpn_protocols: vec![ALPN_H2.to_string()],
                ..Default::default()
            },
            tls,
            server_identity: None,
            initial_window_size: 1024 * 1024,            // 1MB
            initial_connection_window_size: 4 * 1024 * 1024, // 4MB
            max_concurrent_streams: 1000,
            max_frame_size: 16 * 1024, // 16KB (HTTP/2 default)
        }
    }

    /// Plain TCP, no encryption (both sides)
    pub fn plain() -> Self {
        Self::base(false)
    }

    /// TLS client verifying against the webpki roots
    pub fn client_tls() -> Self {
        Self::base(true)
    }

    /// TLS client for local development (skip cert verification)
    pub fn client_insecure() -> Self {
        Self::client_tls().with_insecure_skip_verify()
    }

    /// TLS server with PEM certificate and key files
    pub fn server_tls(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            server_identity: Some(CertificateSource::files(cert_path, key_path)),
            ..Self::base(true)
        }
    }

    /// TLS server with an in-memory DER certificate and PKCS#8 key
    pub fn server_tls_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        Self {
            server_identity: Some(CertificateSource::Der { cert_der, key_der }),
            ..Self::base(true)
        }
    }

    /// Trust an additional root certificate (DER) instead of the webpki roots
    pub fn with_root_certificate(mut self, cert_der: Vec<u8>) -> Self {
        self.security.root_certs.push(cert_der);
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    pub fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    /// Session protocol name
    pub fn protocol(&self) -> &'static str {
        if self.tls {
            "tls"
        } else {
            "tcp"
        }
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.initial_window_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Initial window size must be > 0".to_string(),
            ));
        }
        if !(16_384..=16_777_215).contains(&self.max_frame_size) {
            return Err(TransportError::ConfigurationError(format!(
                "Max frame size {} outside 16384..=16777215",
                self.max_frame_size
            )));
        }
        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "Max concurrent streams must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder for the relay end (HTTP/2 client role)
    pub(crate) fn relay_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size);
        builder
    }

    /// Builder for the backend end (HTTP/2 server role)
    pub(crate) fn backend_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams);
        builder
    }

    /// Build rustls TlsConnector for the backend client
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        let client_crypto = tls::client_config(&self.security)?;
        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }

    /// Build rustls TlsAcceptor for the relay
    pub(crate) fn build_tls_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        let identity = self.server_identity.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server certificate required for TLS".to_string())
        })?;

        let server_crypto = tls::server_config(identity, &self.security)?;
        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

impl Default for H2Config {
    fn default() -> Self {
        Self::plain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_default() {
        let config = H2Config::default();
        assert!(!config.tls);
        assert_eq!(config.protocol(), "tcp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_size_validation() {
        let mut config = H2Config::plain();
        config.max_frame_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_acceptor_requires_identity() {
        let config = H2Config::client_tls();
        assert!(matches!(
            config.build_tls_acceptor(),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_insecure_client() {
        let config = H2Config::client_insecure();
        assert_eq!(config.protocol(), "tls");
        assert!(!config.security_config().verify_server_cert);
    }
}
