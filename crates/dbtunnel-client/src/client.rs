use std::net::SocketAddr;
use std::sync::Arc;

use dbtunnel_cert::CertSource;
use dbtunnel_transport::{bind, run_until_cancelled, Acceptor, AdmissionTracker, Endpoint};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::session::{Session, SessionState};
use crate::{ClientError, TunnelClientConfig};

/// Tunnels local plaintext connections to a remote instance over mutual TLS
pub struct TunnelClient {
    pub(crate) config: TunnelClientConfig,
    pub(crate) cert_source: Arc<dyn CertSource>,
    pub(crate) admission: Arc<AdmissionTracker>,
}

impl TunnelClient {
    pub fn new(config: TunnelClientConfig, cert_source: Arc<dyn CertSource>) -> Self {
        let admission = AdmissionTracker::new(config.max_connections);
        Self {
            config,
            cert_source,
            admission,
        }
    }

    pub fn config(&self) -> &TunnelClientConfig {
        &self.config
    }

    /// Tracker enforcing `max_connections`, also used for the shutdown drain
    pub fn admission(&self) -> Arc<AdmissionTracker> {
        self.admission.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener, ClientError> {
        Ok(bind(&self.config.local_addr).await?)
    }

    /// Bind the local address and tunnel connections until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), ClientError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Tunnel connections from an already bound listener until `shutdown` fires.
    ///
    /// Returns once active sessions have drained, or with a drain error if some are still
    /// open after `shutdown_timeout`. Returns early only if the listener fails.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ClientError> {
        info!(
            "Listening for remote DB instance {:?} (tunneling to {})",
            self.config.instance, self.config.remote_addr
        );

        let client = self.clone();
        let session_shutdown = shutdown.clone();
        let accept_loop = Acceptor::new(listener).run(move |local, peer_addr| {
            client.dispatch(local, peer_addr, &session_shutdown);
        });

        run_until_cancelled(
            accept_loop,
            &shutdown,
            &self.admission,
            self.config.shutdown_timeout,
        )
        .await?;
        info!("Tunnel client stopped");
        Ok(())
    }

    /// Admit an accepted connection and spawn its session.
    ///
    /// Admission happens here, before the spawn, so a drain that starts right after the
    /// accept already counts the session.
    fn dispatch<L: Endpoint>(
        self: &Arc<Self>,
        local: L,
        peer_addr: SocketAddr,
        shutdown: &CancellationToken,
    ) -> JoinHandle<SessionState> {
        let span = info_span!(
            "session",
            session_id = %Uuid::new_v4(),
            peer = %peer_addr,
            instance = %self.config.instance,
        );
        let admission = self.admission.try_admit();
        let session = Session::new(self.clone(), shutdown.clone(), peer_addr);
        tokio::spawn(session.run(admission, local).instrument(span))
    }
}
