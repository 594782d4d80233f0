//! Self-signed certificate generation for development and testing

use rcgen::{CertificateParams, DistinguishedName, SanType};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::info;

/// Names covered by the default development certificate
const DEFAULT_NAMES: &[&str] = &["localhost", "*.localhost", "127.0.0.1", "::1"];

const VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60); // 90 days

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid subject name {0:?}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: Vec<u8>,

    /// Private key in PKCS#8 DER format (binary)
    pub key_der: Vec<u8>,

    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (text)
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

impl std::fmt::Debug for SelfSignedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertificate")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// Generate a certificate valid for localhost, 127.0.0.1 and ::1
///
/// **DO NOT use in production** - use proper CA-signed certificates instead.
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, SelfSignedError> {
    generate_self_signed_cert_for(DEFAULT_NAMES)
}

/// Generate a certificate for the given DNS names and IP addresses
///
/// Valid for 90 days with a random serial number.
pub fn generate_self_signed_cert_for<S: AsRef<str>>(
    names: &[S],
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "Backhaul Development Certificate");
    dn.push(rcgen::DnType::OrganizationName, "Backhaul Dev");
    params.distinguished_name = dn;

    params.subject_alt_names = names
        .iter()
        .map(|name| subject_alt_name(name.as_ref()))
        .collect::<Result<_, _>>()?;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp((now + VALIDITY).as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

fn subject_alt_name(name: &str) -> Result<SanType, SelfSignedError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }

    rcgen::Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|_| SelfSignedError::InvalidName(name.to_string()))
}

/// Reuse `<dir>/<stem>.crt` and `<dir>/<stem>.key` if both exist, otherwise
/// generate a development certificate and write it there.
///
/// Returns the certificate and key paths.
pub fn load_or_generate(dir: &Path, stem: &str) -> Result<(PathBuf, PathBuf), SelfSignedError> {
    let cert_path = dir.join(format!("{}.crt", stem));
    let key_path = dir.join(format!("{}.key", stem));

    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    std::fs::create_dir_all(dir)?;
    let cert = generate_self_signed_cert()?;
    cert.save_to_files(&cert_path, &key_path)?;

    info!(
        "Generated self-signed certificate at {}",
        cert_path.display()
    );

    Ok((cert_path, key_path))
}
