//! TLS-terminating server in front of a plaintext backend
//!
//! Each accepted connection completes a mutual TLS handshake (client certificates are checked
//! against the configured CA pool), then a plaintext connection to the backend is dialed and
//! both are handed to the relay. There is no connection limit; active connections are still
//! tracked so shutdown can drain them.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dbtunnel_transport::{
    bind, copy_then_close, enable_keepalive, run_until_cancelled, Acceptor, AdmissionTracker,
    AdmissionTicket, LifecycleError, TransportError, DEFAULT_KEEPALIVE_PERIOD,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TlsServerError {
    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub bind_addr: String,
    pub backend_addr: String,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_period: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3308".to_string(),
            backend_addr: "127.0.0.1:3306".to_string(),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

pub struct TlsServer {
    config: TlsServerConfig,
    tls_acceptor: TlsAcceptor,
    admission: Arc<AdmissionTracker>,
}

impl TlsServer {
    /// Create a server presenting `cert_chain`/`key` and requiring client certificates that
    /// chain to any of `client_cas`.
    pub fn new(
        config: TlsServerConfig,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_cas: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TlsServerError> {
        let provider = dbtunnel_cert::crypto_provider();

        if client_cas.is_empty() {
            return Err(TlsServerError::Config(
                "No client CA certificates configured".to_string(),
            ));
        }
        let mut roots = RootCertStore::empty();
        for ca in client_cas {
            roots
                .add(ca)
                .map_err(|e| TlsServerError::Config(format!("Invalid client CA: {}", e)))?;
        }

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| TlsServerError::Config(format!("Client verifier: {}", e)))?;

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| TlsServerError::Config(e.to_string()))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain, key)
            .map_err(|e| TlsServerError::Config(format!("Server certificate: {}", e)))?;

        Ok(Self {
            config,
            tls_acceptor: TlsAcceptor::from(Arc::new(server_config)),
            admission: AdmissionTracker::unlimited(),
        })
    }

    pub fn config(&self) -> &TlsServerConfig {
        &self.config
    }

    /// Active connection tracker (no limit)
    pub fn admission(&self) -> Arc<AdmissionTracker> {
        self.admission.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener, TlsServerError> {
        Ok(bind(&self.config.bind_addr).await?)
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), TlsServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown` fires, then drain.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), TlsServerError> {
        info!(
            "TLS server relaying to backend {} (mutual TLS required)",
            self.config.backend_addr
        );

        let server = self.clone();
        let accept_loop = Acceptor::new(listener).run(move |tcp, peer_addr| {
            server.dispatch(tcp, peer_addr);
        });

        run_until_cancelled(
            accept_loop,
            &shutdown,
            &self.admission,
            self.config.shutdown_timeout,
        )
        .await?;
        info!("TLS server stopped");
        Ok(())
    }

    /// Track an accepted connection and spawn its handler. The ticket is taken before the
    /// spawn so the shutdown drain sees the connection immediately.
    fn dispatch(
        self: &Arc<Self>,
        tcp: TcpStream,
        peer_addr: SocketAddr,
    ) -> Option<JoinHandle<()>> {
        let ticket = match self.admission.try_admit() {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("Rejected connection from {}: {}", peer_addr, e);
                return None;
            }
        };

        let server = self.clone();
        let span = info_span!("tls_conn", session_id = %Uuid::new_v4(), peer = %peer_addr);
        Some(tokio::spawn(
            async move { server.handle_connection(ticket, tcp, peer_addr).await }.instrument(span),
        ))
    }

    async fn handle_connection(
        &self,
        _ticket: AdmissionTicket,
        tcp: TcpStream,
        peer_addr: SocketAddr,
    ) {
        enable_keepalive(&tcp, self.config.keepalive_period);

        let tls_stream = match tokio::time::timeout(
            self.config.handshake_timeout,
            self.tls_acceptor.accept(tcp),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("TLS handshake with {} failed: {}", peer_addr, e);
                return;
            }
            Err(_) => {
                warn!(
                    "TLS handshake with {} timed out after {:?}",
                    peer_addr, self.config.handshake_timeout
                );
                return;
            }
        };
        debug!("TLS handshake with {} complete", peer_addr);

        let backend_addr = &self.config.backend_addr;
        let backend = match tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(backend_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Failed to connect to backend {}: {}", backend_addr, e);
                return;
            }
            Err(_) => {
                warn!(
                    "Connecting to backend {} timed out after {:?}",
                    backend_addr, self.config.dial_timeout
                );
                return;
            }
        };
        enable_keepalive(&backend, self.config.keepalive_period);

        copy_then_close(
            backend,
            tls_stream,
            &format!("backend {}", backend_addr),
            &format!("tls connection from {}", peer_addr),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbtunnel_cert::DevAuthority;

    #[test]
    fn test_default_config() {
        let config = TlsServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3308");
        assert_eq!(config.backend_addr, "127.0.0.1:3306");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_new_with_generated_certificates() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let server = ca.issue_server("db").unwrap();

        let result = TlsServer::new(
            TlsServerConfig::default(),
            vec![server.cert_der.clone()],
            server.private_key(),
            vec![ca.cert_der()],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_new_rejects_invalid_client_ca() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let server = ca.issue_server("db").unwrap();

        let result = TlsServer::new(
            TlsServerConfig::default(),
            vec![server.cert_der.clone()],
            server.private_key(),
            vec![ca.cert_der(), CertificateDer::from(vec![1, 2, 3])],
        );
        assert!(matches!(result, Err(TlsServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_dispatch_tracks_connection_before_it_runs() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let server_cert = ca.issue_server("db").unwrap();
        let server = Arc::new(
            TlsServer::new(
                TlsServerConfig::default(),
                vec![server_cert.cert_der.clone()],
                server_cert.private_key(),
                vec![ca.cert_der()],
            )
            .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (tcp, peer_addr) = listener.accept().await.unwrap();

        let handle = server.dispatch(tcp, peer_addr).unwrap();
        // The handler has not been polled yet on this single-threaded runtime
        assert_eq!(server.admission().current_count(), 1);

        // Peer hangs up before sending a ClientHello: the handshake fails and the slot frees
        drop(peer);
        handle.await.unwrap();
        assert_eq!(server.admission().current_count(), 0);
    }

    #[test]
    fn test_new_requires_a_client_ca() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let server = ca.issue_server("db").unwrap();

        let result = TlsServer::new(
            TlsServerConfig::default(),
            vec![server.cert_der.clone()],
            server.private_key(),
            Vec::new(),
        );
        assert!(matches!(result, Err(TlsServerError::Config(_))));
    }
}
