//! Outbound tunnel client
//!
//! Listens for plaintext connections on a local address and tunnels each one over mutual
//! TLS to a remote database instance. The server certificate is checked against the root
//! and identity supplied by the certificate source, not against DNS names.

pub mod client;
pub mod config;
mod session;

pub use client::TunnelClient;
pub use config::TunnelClientConfig;
pub use session::SessionState;

use dbtunnel_cert::CertError;
use dbtunnel_transport::{AdmissionDenied, LifecycleError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("too many open connections (max {max})")]
    AdmissionDenied { max: u64 },

    #[error("couldn't retrieve certs for instance: {0}")]
    Credential(#[from] CertError),

    #[error("couldn't build TLS configuration: {0}")]
    TlsConfig(String),

    #[error("couldn't connect to {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("couldn't initiate TLS handshake to {address}: {reason}")]
    Handshake { address: String, reason: String },

    #[error("session cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl From<AdmissionDenied> for ClientError {
    fn from(e: AdmissionDenied) -> Self {
        ClientError::AdmissionDenied { max: e.max }
    }
}
