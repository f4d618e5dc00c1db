//! Client configuration

use dbtunnel_transport::{DEFAULT_KEEPALIVE_PERIOD, DEFAULT_SHUTDOWN_TIMEOUT};
use std::time::Duration;

/// Outbound tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    /// Address to listen on for plaintext local connections
    pub local_addr: String,
    /// TLS endpoint of the remote instance
    pub remote_addr: String,
    /// Instance identifier passed to the certificate source
    pub instance: String,
    /// Maximum concurrent sessions. 0 means no limit.
    pub max_connections: u64,
    /// Bound on the TCP dial to `remote_addr`
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_period: Duration,
    /// How long shutdown waits for active sessions
    pub shutdown_timeout: Duration,
}

impl Default for TunnelClientConfig {
    fn default() -> Self {
        Self {
            local_addr: "127.0.0.1:3307".to_string(),
            remote_addr: "127.0.0.1:3308".to_string(),
            instance: String::new(),
            max_connections: 0,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}
