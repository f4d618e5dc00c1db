//! Endpoint capability model
//!
//! Anything the relay can read from, write to and close is an endpoint. Keepalive control
//! is an optional capability: only endpoints sitting on a TCP socket expose it.

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Keepalive period applied to accepted and dialed sockets
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// A connection-like object: readable, writable, closable via shutdown/drop.
pub trait Endpoint: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Socket handle for keepalive control, if the endpoint has one.
    fn keepalive_control(&self) -> Option<SockRef<'_>> {
        None
    }
}

impl Endpoint for TcpStream {
    fn keepalive_control(&self) -> Option<SockRef<'_>> {
        Some(SockRef::from(self))
    }
}

impl<S: Endpoint> Endpoint for tokio_rustls::client::TlsStream<S> {
    fn keepalive_control(&self) -> Option<SockRef<'_>> {
        self.get_ref().0.keepalive_control()
    }
}

impl<S: Endpoint> Endpoint for tokio_rustls::server::TlsStream<S> {
    fn keepalive_control(&self) -> Option<SockRef<'_>> {
        self.get_ref().0.keepalive_control()
    }
}

impl Endpoint for tokio::io::DuplexStream {}

/// Best-effort keepalive configuration. Never fails the caller.
///
/// Returns whether keepalive is now active on the endpoint.
pub fn enable_keepalive<E: Endpoint + ?Sized>(endpoint: &E, period: Duration) -> bool {
    let Some(sock) = endpoint.keepalive_control() else {
        warn!("KeepAlive not supported: long-running tcp connections may be killed by the OS");
        return false;
    };

    let keepalive = TcpKeepalive::new().with_time(period);
    match sock.set_tcp_keepalive(&keepalive) {
        Ok(()) => {
            debug!("Enabled TCP keepalive (period {:?})", period);
            true
        }
        Err(e) => {
            warn!("Couldn't enable TCP keepalive: {}", e);
            false
        }
    }
}
