//! Backhaul relay
//!
//! Backends dial the relay over a multiplexed transport and authenticate on
//! the session's first stream. The relay then forwards public HTTP requests
//! for their domain, one session stream per exchange, to a randomly chosen
//! healthy backend.
//!
//! # Example
//!
//! ```ignore
//! use backhaul_relay::{MemoryStorage, ServerConfig, TunnelServer};
//! use backhaul_transport_h2::{H2Config, H2Listener};
//! use std::sync::Arc;
//!
//! let storage = MemoryStorage::from_json_file("storage.json".as_ref())?;
//! let server = TunnelServer::new(ServerConfig::default(), Arc::new(storage))?.start();
//!
//! let tunnel = H2Listener::bind("0.0.0.0:4443".parse()?, Arc::new(H2Config::plain())).await?;
//! let http = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!
//! tokio::join!(server.listen(tunnel), server.serve_http(http));
//! ```

pub mod auth;
pub mod backend;
pub mod config;
pub mod connection;
pub mod detector;
pub mod error;
pub mod fallback;
pub mod frontend;
pub mod registry;
pub mod selector;
pub mod server;
pub mod storage;

pub use auth::{AuthError, Authenticator};
pub use backend::Backend;
pub use config::ServerConfig;
pub use connection::Connection;
pub use detector::{DetectorFactory, FailureDetector, PhiAccrualDetector, PhiAccrualFactory};
pub use error::{RelayError, StreamError};
pub use frontend::GuardedBody;
pub use registry::Registry;
pub use selector::{BackendSelector, RandomSelector, RoundRobinSelector};
pub use server::{RelayBody, TunnelServer};
pub use storage::{MemoryStorage, Storage, StorageError};
