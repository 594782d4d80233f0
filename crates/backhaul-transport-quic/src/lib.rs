//! QUIC transport implementation using quinn
//!
//! The reliable-UDP option for lossy links: every session stream is a
//! bidirectional QUIC stream, so loss on one stream never stalls another.

pub mod config;
pub mod listener;
pub mod session;

pub use config::QuicConfig;
pub use listener::{QuicConnector, QuicListener};
pub use session::{QuicSession, QuicStream};
