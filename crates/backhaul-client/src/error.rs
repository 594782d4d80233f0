//! Client error types

use backhaul_proto::CodecError;
use backhaul_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to resolve relay address {0}")]
    Resolve(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] CodecError),

    /// The relay ended the session: rejected credentials, a kill, or a
    /// network failure. Callers reconnect.
    #[error("Disconnected from relay")]
    Disconnected,
}

/// Failure to forward one request to the local backend
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP handshake with backend failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("Backend request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("Invalid upstream URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
}
