//! QUIC transport configuration

use backhaul_transport::tls::{self, CertificateSource};
use backhaul_transport::{TransportError, TransportResult, TransportSecurityConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Settings for QUIC relays and the clients that dial them
#[derive(Debug, Clone)]
pub struct QuicConfig {
    security: TransportSecurityConfig,

    /// Server certificate and key (for relays)
    pub server_identity: Option<CertificateSource>,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_streams: u32,
}

impl QuicConfig {
    fn base() -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            server_identity: None,
            keep_alive_interval: Duration::from_secs(3),
            // A silent peer is considered gone after this long
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 1000,
        }
    }

    /// Client trusting the webpki roots
    ///
    /// Self-signed relays need [`with_root_certificate`](Self::with_root_certificate)
    /// or [`with_insecure_skip_verify`](Self::with_insecure_skip_verify).
    pub fn client_default() -> Self {
        Self::base()
    }

    /// Client that accepts any relay certificate. Development only.
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Relay identity from PEM files
    pub fn server_default(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            server_identity: Some(CertificateSource::files(cert_path, key_path)),
            ..Self::base()
        }
    }

    /// Relay identity from a DER certificate and PKCS#8 key
    pub fn server_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        Self {
            server_identity: Some(CertificateSource::Der { cert_der, key_der }),
            ..Self::base()
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Trust an additional root certificate (DER) instead of the webpki roots
    pub fn with_root_certificate(mut self, cert_der: Vec<u8>) -> Self {
        self.security.root_certs.push(cert_der);
        self
    }

    /// Accept any relay certificate
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    pub fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "keep-alive interval is zero".to_string(),
            ));
        }

        // At least two keep-alives must fit in one idle period
        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                format!(
                    "idle timeout {:?} shorter than two keep-alives of {:?}",
                    self.max_idle_timeout, self.keep_alive_interval
                ),
            ));
        }

        Ok(())
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let idle_timeout = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid idle timeout: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle_timeout));
        transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_streams));
        Ok(transport)
    }

    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let client_crypto = tls::client_config(&self.security)?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.transport_config()?));

        Ok(client_config)
    }

    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        let identity = self.server_identity.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server certificate required for QUIC".to_string())
        })?;

        let server_crypto = tls::server_config(identity, &self.security)?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.transport_config()?));

        Ok(server_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_verifies() {
        let config = QuicConfig::client_default();
        assert!(config.validate().is_ok());
        assert!(config.security_config().verify_server_cert);
    }

    #[test]
    fn test_idle_timeout_validation() {
        let config = QuicConfig::client_default()
            .with_keep_alive(Duration::from_secs(10))
            .with_idle_timeout(Duration::from_secs(15));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_requires_identity() {
        let config = QuicConfig::client_default();
        assert!(matches!(
            config.build_server_config(),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_insecure_client_builds() {
        assert!(QuicConfig::client_insecure().build_client_config().is_ok());
    }
}
