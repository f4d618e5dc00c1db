//! Accept loop
//!
//! Temporary accept errors (aborted handshakes, descriptor exhaustion, ...) are retried after
//! a short pause without tearing down the listener. Any other error closes the listener and
//! ends the loop.

use crate::TransportError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Maximum pause after a temporary accept error
pub const ACCEPT_RETRY_CAP: Duration = Duration::from_millis(10);

/// Something that yields inbound connections
#[async_trait]
pub trait Listen: Send {
    type Conn: Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Conn, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listen for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Bind a TCP listener, failing fast with a descriptive error
pub async fn bind(address: &str) -> Result<TcpListener, TransportError> {
    TcpListener::bind(address).await.map_err(|e| {
        let port = address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(0);
        TransportError::Bind {
            address: address.to_string(),
            port,
            reason: e.to_string(),
        }
    })
}

/// Whether an accept error is worth retrying on the same listener
pub fn is_temporary(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => is_resource_exhaustion(err),
    }
}

/// ENFILE / EMFILE / ENOBUFS / ENOMEM clear up on their own. The codes are Linux values.
#[cfg(target_os = "linux")]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23 | 24 | 105 | 12))
}

#[cfg(not(target_os = "linux"))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}

/// Owns a listener and runs the accept loop over it
pub struct Acceptor<L: Listen> {
    listener: L,
    address: String,
}

impl<L: Listen> Acceptor<L> {
    pub fn new(listener: L) -> Self {
        let address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        Self { listener, address }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, handing each one to `dispatch`.
    ///
    /// `dispatch` must not block; it is expected to spawn the session. Only returns on a
    /// non-temporary accept error, after the listener has been closed.
    pub async fn run<F>(self, mut dispatch: F) -> TransportError
    where
        F: FnMut(L::Conn, SocketAddr) + Send,
    {
        let Self {
            mut listener,
            address,
        } = self;
        info!("Accepting connections on {}", address);

        loop {
            let start = Instant::now();
            match listener.accept().await {
                Ok((conn, peer_addr)) => {
                    debug!("New connection from {} on {}", peer_addr, address);
                    dispatch(conn, peer_addr);
                }
                Err(e) if is_temporary(&e) => {
                    let delay = ACCEPT_RETRY_CAP.saturating_sub(start.elapsed());
                    warn!("Temporary accept error on {}: {} (retrying)", address, e);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!("Accept failed on {}: {}", address, e);
                    drop(listener);
                    return TransportError::Accept { address, source: e };
                }
            }
        }
    }
}
