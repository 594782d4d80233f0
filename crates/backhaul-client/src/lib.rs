//! Backhaul tunnel client
//!
//! Registers a local HTTP service with a relay under a domain. The client
//! dials out, so the service needs no inbound connectivity.
//!
//! ```ignore
//! use backhaul_client::{ClientConfig, TransportKind, TunnelClient};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig::new(
//!     TransportKind::Tls,
//!     "relay.example.com:4443",
//!     "my-token",
//!     "app.example.com",
//!     "http://127.0.0.1:3000",
//! );
//! let client = TunnelClient::new(config)?;
//! client.connect(CancellationToken::new()).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod proxy;

pub use client::TunnelClient;
pub use config::{ClientConfig, TransportKind};
pub use error::{ClientError, ProxyError};
pub use proxy::HttpProxy;
