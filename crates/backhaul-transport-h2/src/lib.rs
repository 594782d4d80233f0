//! HTTP/2 transport implementation using h2
//!
//! Carries backhaul sessions over a single TCP connection, optionally
//! wrapped in TLS. Use this where UDP is blocked or QUIC is unavailable.
//!
//! # Stream Mapping
//!
//! - Each session stream = one HTTP/2 stream opened by the relay
//! - Data is sent as DATA frames in both directions
//! - Stream close = END_STREAM flag, abandonment = RST_STREAM

pub mod config;
pub mod listener;
pub mod session;
pub mod stream;

pub use config::H2Config;
pub use listener::{H2Connector, H2Listener};
pub use session::{H2BackendSession, H2RelaySession};
pub use stream::H2Stream;
