//! rustls helpers shared by the TLS and QUIC transports

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{TransportError, TransportResult, TransportSecurityConfig};

/// Where a server loads its certificate chain and key from
#[derive(Debug, Clone)]
pub enum CertificateSource {
    /// PEM files on disk
    Files { cert_path: PathBuf, key_path: PathBuf },
    /// DER bytes held in memory (key in PKCS#8)
    Der { cert_der: Vec<u8>, key_der: Vec<u8> },
}

impl CertificateSource {
    pub fn files(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self::Files {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn load(
        &self,
    ) -> TransportResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        match self {
            Self::Files {
                cert_path,
                key_path,
            } => Ok((load_certs(cert_path)?, load_private_key(key_path)?)),
            Self::Der { cert_der, key_der } => Ok((
                vec![CertificateDer::from(cert_der.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.clone())),
            )),
        }
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("can't open certificate {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("can't open private key {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

/// Build a rustls client config from the shared security settings
pub fn client_config(security: &TransportSecurityConfig) -> TransportResult<rustls::ClientConfig> {
    ensure_crypto_provider();

    let mut client_crypto = if security.verify_server_cert {
        let mut roots = rustls::RootCertStore::empty();

        if security.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &security.root_certs {
                roots
                    .add(CertificateDer::from(cert_der.clone()))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    };

    client_crypto.alpn_protocols = alpn(security);
    Ok(client_crypto)
}

/// Build a rustls server config for the given identity
pub fn server_config(
    identity: &CertificateSource,
    security: &TransportSecurityConfig,
) -> TransportResult<rustls::ServerConfig> {
    ensure_crypto_provider();

    let (certs, key) = identity.load()?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

    server_crypto.alpn_protocols = alpn(security);
    Ok(server_crypto)
}

fn alpn(security: &TransportSecurityConfig) -> Vec<Vec<u8>> {
    security
        .alpn_protocols
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect()
}

/// Accepts whatever certificate the relay presents
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let source = CertificateSource::files("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(source.load(), Err(TransportError::TlsError(_))));
    }

    #[test]
    fn test_insecure_client_config() {
        let security = TransportSecurityConfig {
            verify_server_cert: false,
            alpn_protocols: vec!["h2".to_string()],
            ..Default::default()
        };
        let config = client_config(&security).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_invalid_root_cert() {
        let security = TransportSecurityConfig {
            root_certs: vec![vec![0u8; 16]],
            ..Default::default()
        };
        assert!(matches!(
            client_config(&security),
            Err(TransportError::ConfigurationError(_))
        ));
    }
}
