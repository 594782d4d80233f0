//! Relay error types

use backhaul_transport::TransportError;
use thiserror::Error;

/// Failure to open a stream on a backend session
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("there is no such backend")]
    Unusable,

    #[error("timed out opening session stream")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by relay operations
///
/// The three stream kinds stay distinct so callers can tell a request that
/// never left from one that may have partially reached the backend.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("there is no such backend")]
    NoSuchBackend,

    #[error("connection can't open session stream: {0}")]
    CantOpenSessionStream(#[source] StreamError),

    #[error("connection stream can't write request: {0}")]
    CantWriteRequest(#[source] hyper::Error),

    #[error("connection stream can't read response: {0}")]
    CantReadResponse(#[source] hyper::Error),

    #[error("health ping timed out")]
    PingTimeout,

    #[error("request cancelled by caller")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    /// Whether this failure condemns the backend connection it happened on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::CantOpenSessionStream(_)
                | RelayError::CantWriteRequest(_)
                | RelayError::CantReadResponse(_)
                | RelayError::PingTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_errors_are_fatal() {
        assert!(RelayError::CantOpenSessionStream(StreamError::Unusable).is_connection_fatal());
        assert!(RelayError::PingTimeout.is_connection_fatal());
        assert!(!RelayError::Cancelled.is_connection_fatal());
        assert!(!RelayError::NoSuchBackend.is_connection_fatal());
    }

    #[test]
    fn test_open_error_message() {
        let err = RelayError::CantOpenSessionStream(StreamError::Unusable);
        assert_eq!(
            err.to_string(),
            "connection can't open session stream: there is no such backend"
        );
    }
}
