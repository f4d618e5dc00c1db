//! One tunnelled connection, from accept to close
//!
//! accepted -> admitted -> credentialed -> dialing -> handshaking -> relaying -> closed
//!
//! Admission denial ends in `Rejected`; any other error ends in `Failed`. Admission is
//! decided before the session task is spawned; the ticket then moves onto the stack of
//! [`Session::establish`], so it is released exactly once on every path, and every endpoint
//! opened so far is dropped (closed) with it.

use std::net::SocketAddr;
use std::sync::Arc;

use dbtunnel_cert::{crypto_provider, CredentialBundle, PeerVerifier};
use dbtunnel_transport::{
    copy_then_close, enable_keepalive, AdmissionDenied, AdmissionTicket, Endpoint, RelayReport,
};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ClientError, TunnelClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Admitted,
    Credentialed,
    Dialing,
    Handshaking,
    Relaying,
    Closed,
    Rejected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Closed | SessionState::Rejected | SessionState::Failed
        )
    }
}

pub(crate) struct Session {
    client: Arc<TunnelClient>,
    shutdown: CancellationToken,
    peer_addr: SocketAddr,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(
        client: Arc<TunnelClient>,
        shutdown: CancellationToken,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            client,
            shutdown,
            peer_addr,
            state: SessionState::Accepted,
        }
    }

    /// Drive the session to a terminal state.
    ///
    /// Pre-relay failures are logged here, once. Relay outcomes are logged by the relay.
    pub(crate) async fn run<L: Endpoint>(
        mut self,
        admission: Result<AdmissionTicket, AdmissionDenied>,
        local: L,
    ) -> SessionState {
        let result = match admission {
            Ok(ticket) => self.establish(ticket, local).await,
            Err(denied) => {
                drop(local);
                Err(denied.into())
            }
        };

        match result {
            Ok(_report) => self.transition(SessionState::Closed),
            Err(e @ ClientError::AdmissionDenied { .. }) => {
                warn!("Rejected connection from {}: {}", self.peer_addr, e);
                self.transition(SessionState::Rejected);
            }
            Err(e) => {
                warn!(
                    "Error proxying connection from {} ({:?}): {}",
                    self.peer_addr, self.state, e
                );
                self.transition(SessionState::Failed);
            }
        }
        self.state
    }

    async fn establish<L: Endpoint>(
        &mut self,
        _ticket: AdmissionTicket,
        local: L,
    ) -> Result<RelayReport, ClientError> {
        let client = self.client.clone();
        let config = &client.config;
        self.transition(SessionState::Admitted);

        let bundle = tokio::select! {
            fetched = client.cert_source.fetch_credentials(&config.instance) => fetched?,
            _ = self.shutdown.cancelled() => return Err(ClientError::Cancelled),
        };
        let tls_config = tls_client_config(&bundle)?;
        let server_name = server_name(&config.remote_addr).map_err(ClientError::TlsConfig)?;
        self.transition(SessionState::Credentialed);

        self.transition(SessionState::Dialing);
        let remote = self.dial(&config.remote_addr).await?;

        enable_keepalive(&local, config.keepalive_period);
        enable_keepalive(&remote, config.keepalive_period);

        self.transition(SessionState::Handshaking);
        let connector = TlsConnector::from(tls_config);
        let tls = match tokio::time::timeout(
            config.handshake_timeout,
            connector.connect(server_name, remote),
        )
        .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                return Err(ClientError::Handshake {
                    address: config.remote_addr.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ClientError::Handshake {
                    address: config.remote_addr.clone(),
                    reason: format!("timed out after {:?}", config.handshake_timeout),
                })
            }
        };

        self.transition(SessionState::Relaying);
        let report = copy_then_close(
            tls,
            local,
            "remote connection",
            &format!("local connection on {}", config.local_addr),
        )
        .await;
        Ok(report)
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, ClientError> {
        let timeout = self.client.config.dial_timeout;
        let connect = tokio::time::timeout(timeout, TcpStream::connect(address));

        let reason = tokio::select! {
            dialed = connect => match dialed {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", timeout),
            },
            _ = self.shutdown.cancelled() => return Err(ClientError::Cancelled),
        };

        Err(ClientError::Dial {
            address: address.to_string(),
            reason,
        })
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Handshake configuration presenting the bundle's client certificate and verifying the
/// server with [`PeerVerifier`] instead of hostname checks
fn tls_client_config(bundle: &CredentialBundle) -> Result<Arc<ClientConfig>, ClientError> {
    let provider = crypto_provider();
    let verifier = PeerVerifier::new(bundle.trust_config()?, provider.clone());

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(bundle.cert_chain.clone(), bundle.private_key.clone_key())
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?;

    Ok(Arc::new(config))
}

/// SNI name for the remote address. The peer verifier ignores it, but rustls needs one.
fn server_name(address: &str) -> Result<ServerName<'static>, String> {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| format!("invalid server name {:?}: {}", host, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TunnelClientConfig;
    use async_trait::async_trait;
    use dbtunnel_cert::{CertError, CertSource, DevAuthority, StaticCertSource};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct PendingSource;

    #[async_trait]
    impl CertSource for PendingSource {
        async fn fetch_credentials(
            &self,
            _instance: &str,
        ) -> Result<Arc<CredentialBundle>, CertError> {
            std::future::pending().await
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn client_with(
        source: Arc<dyn CertSource>,
        max_connections: u64,
        remote_addr: &str,
    ) -> Arc<TunnelClient> {
        let config = TunnelClientConfig {
            remote_addr: remote_addr.to_string(),
            instance: "db".to_string(),
            max_connections,
            ..Default::default()
        };
        Arc::new(TunnelClient::new(config, source))
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn test_rejected_when_limit_reached() {
        let client = client_with(Arc::new(StaticCertSource::new()), 1, "127.0.0.1:1");
        let _held = client.admission.try_admit().unwrap();

        let (local, mut user) = tokio::io::duplex(64);
        let session = Session::new(client.clone(), CancellationToken::new(), peer());
        let admission = client.admission.try_admit();
        assert_eq!(session.run(admission, local).await, SessionState::Rejected);

        // local endpoint closed, counter untouched
        let mut buf = [0u8; 1];
        assert_eq!(user.read(&mut buf).await.unwrap(), 0);
        assert_eq!(client.admission.current_count(), 1);
    }

    #[tokio::test]
    async fn test_credential_failure_releases_slot() {
        let client = client_with(Arc::new(StaticCertSource::new()), 1, "127.0.0.1:1");

        let (local, _user) = tokio::io::duplex(64);
        let session = Session::new(client.clone(), CancellationToken::new(), peer());
        let admission = client.admission.try_admit();
        assert_eq!(session.run(admission, local).await, SessionState::Failed);
        assert_eq!(client.admission.current_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_credential_fetch() {
        let client = client_with(Arc::new(PendingSource), 0, "127.0.0.1:1");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let (local, _user) = tokio::io::duplex(64);
        let session = Session::new(client.clone(), shutdown, peer());
        let admission = client.admission.try_admit();
        assert_eq!(session.run(admission, local).await, SessionState::Failed);
        assert_eq!(client.admission.current_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_releases_slot() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let source = StaticCertSource::single(ca.client_bundle("client", "db").unwrap());
        let client = client_with(Arc::new(source), 1, &closed_port().await);

        let (local, mut user) = tokio::io::duplex(64);
        let session = Session::new(client.clone(), CancellationToken::new(), peer());
        let admission = client.admission.try_admit();
        assert_eq!(session.run(admission, local).await, SessionState::Failed);
        assert_eq!(client.admission.current_count(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(user.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unusable_server_name_fails_before_dialing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ca = DevAuthority::generate("Test CA").unwrap();
        let source = StaticCertSource::single(ca.client_bundle("client", "db").unwrap());
        let client = client_with(Arc::new(source), 0, &format!("bad host:{}", port));

        let (local, _user) = tokio::io::duplex(64);
        let mut session = Session::new(client.clone(), CancellationToken::new(), peer());
        let ticket = client.admission.try_admit().unwrap();
        let err = session.establish(ticket, local).await.unwrap_err();

        assert!(matches!(err, ClientError::TlsConfig(_)), "{err}");
        assert_eq!(session.state, SessionState::Admitted);
        assert_eq!(client.admission.current_count(), 0);

        let accepted =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no connection may be opened");
    }

    #[test]
    fn test_server_name_from_address() {
        assert!(matches!(
            server_name("127.0.0.1:3308").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("[::1]:3308").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("db.internal:3308").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(server_name("bad host:3308").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Rejected.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Relaying.is_terminal());
    }
}
