//! Connection plumbing shared by both proxy modes
//!
//! - [`relay`]: bidirectional byte copy between two endpoints with a single terminal report
//! - [`admission`]: concurrent-connection counter with an optional limit
//! - [`listener`]: accept loop with bounded retry on temporary errors
//! - [`lifecycle`]: run an acceptor until cancelled, then drain active connections

pub mod admission;
pub mod endpoint;
pub mod lifecycle;
pub mod listener;
pub mod relay;

pub use admission::{AdmissionDenied, AdmissionTicket, AdmissionTracker};
pub use endpoint::{enable_keepalive, Endpoint, DEFAULT_KEEPALIVE_PERIOD};
pub use lifecycle::{
    run_until_cancelled, wait_for_drain, DrainTimeout, LifecycleError, DEFAULT_SHUTDOWN_TIMEOUT,
    DRAIN_POLL_INTERVAL,
};
pub use listener::{bind, is_temporary, Acceptor, Listen, ACCEPT_RETRY_CAP};
pub use relay::{
    copy_then_close, Direction, RelayFailure, RelayOutcome, RelayReport, Side, RELAY_BUFFER_SIZE,
};

use thiserror::Error;

/// Listener-level errors. Per-connection failures never surface here.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("error in accept on {address}: {source}")]
    Accept {
        address: String,
        #[source]
        source: std::io::Error,
    },
}
