//! Run-until-cancelled supervision with a bounded drain on shutdown

use crate::{AdmissionTracker, TransportError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the active-connection count is polled while draining
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time to wait for active connections to finish on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connections were still active when the drain deadline passed
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{remaining} active connections still exist after waiting for {timeout:?}")]
pub struct DrainTimeout {
    pub remaining: u64,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("error during shutdown: {0}")]
    Drain(#[from] DrainTimeout),
}

/// Wait up to `timeout` for the tracker to reach zero.
///
/// Sockets of sessions still running at the deadline are left alone; the caller only gets
/// told how many remain.
pub async fn wait_for_drain(
    tracker: &AdmissionTracker,
    timeout: Duration,
) -> Result<(), DrainTimeout> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(DRAIN_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let active = tracker.current_count();
                if active == 0 {
                    info!("No connections to wait for, shutting down");
                    break;
                }
                debug!("Waiting for {} active connections to finish", active);
            }
            _ = &mut deadline => break,
        }
    }

    match tracker.current_count() {
        0 => Ok(()),
        remaining => Err(DrainTimeout { remaining, timeout }),
    }
}

/// Drive `acceptor` until `shutdown` fires, then drain.
///
/// Cancellation drops the acceptor (closing its listener) before the drain starts. If the
/// acceptor stops on its own, its error is returned as is.
pub async fn run_until_cancelled<A>(
    acceptor: A,
    shutdown: &CancellationToken,
    tracker: &AdmissionTracker,
    shutdown_timeout: Duration,
) -> Result<(), LifecycleError>
where
    A: Future<Output = TransportError>,
{
    tokio::select! {
        err = acceptor => Err(LifecycleError::Transport(err)),
        _ = shutdown.cancelled() => {
            info!(
                "Received shutdown signal. Waiting up to {:?} before terminating.",
                shutdown_timeout
            );
            wait_for_drain(tracker, shutdown_timeout).await.map_err(|e| {
                warn!("{}", e);
                LifecycleError::Drain(e)
            })
        }
    }
}
