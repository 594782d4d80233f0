//! Certificate helpers for backhaul relays
//!
//! Self-signed certificates give TLS and QUIC relays a zero-config identity
//! for development and tests.

pub mod self_signed;

pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_for, load_or_generate,
    SelfSignedCertificate, SelfSignedError,
};
