//! Backhaul handshake protocol
//!
//! The first stream of every session carries exactly one JSON object,
//! [`Auth`], written by the backend client and read by the relay. Nothing is
//! sent back: a relay that rejects the credentials closes the session.
//! Every later stream carries one plain HTTP/1.1 exchange.

pub mod codec;
pub mod headers;
pub mod messages;

pub use codec::{read_auth, write_auth, AuthCodec, CodecError};
pub use headers::strip_hop_by_hop;
pub use messages::Auth;

/// Scope a token must carry to register a backend
pub const CONNECT_SCOPE: &str = "connect";

/// Path requested by the relay's health checks
pub const HEALTH_PATH: &str = "/health";

/// Header correlating an inbound request with relay logs and fallback pages
pub const REQUEST_ID_HEADER: &str = "x-request-id";
