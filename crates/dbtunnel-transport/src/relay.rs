//! Duplex relay between a local and a remote endpoint
//!
//! Both directions run concurrently until one of them terminates (read error, clean
//! end-of-stream, or write error). The first direction to terminate wins: it is the only
//! one that gets classified, reported and followed by closing both endpoints. The losing
//! direction is dropped mid-flight and produces nothing.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Size of the per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Upper bound for the close of one endpoint (TLS close_notify + TCP shutdown)
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which endpoint of the relay an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    fn opposite(self) -> Self {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// Whether the failing operation was a read or a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn phrase(self) -> &'static str {
        match self {
            Direction::Read => "reading data from",
            Direction::Write => "writing data to",
        }
    }
}

/// A relay termination other than a clean peer close
#[derive(Debug, Error)]
#[error("{} {description} had error: {source}", .direction.phrase())]
pub struct RelayFailure {
    pub side: Side,
    pub direction: Direction,
    pub description: String,
    #[source]
    pub source: io::Error,
}

/// How a relay ended
#[derive(Debug)]
pub enum RelayOutcome {
    /// The given side closed its stream cleanly. Informational.
    PeerClosed { side: Side, description: String },
    Failed(RelayFailure),
}

impl RelayOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, RelayOutcome::PeerClosed { .. })
    }
}

/// Terminal report of one relay, produced exactly once
#[derive(Debug)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

/// How a single copy direction stopped
enum HalfEnd {
    Eof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// Copy `src` into `dst` until something fails. A clean end-of-stream counts as a failed read.
async fn copy_half<R, W>(src: &mut R, dst: &mut W, copied: &mut u64) -> HalfEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => return HalfEnd::Eof,
            Ok(n) => n,
            Err(e) => return HalfEnd::ReadFailed(e),
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            return HalfEnd::WriteFailed(e);
        }
        // TLS writers may hold records until flushed
        if let Err(e) = dst.flush().await {
            return HalfEnd::WriteFailed(e);
        }
        *copied += n as u64;
    }
}

/// Relay bytes between `remote` and `local` until either side stops, then close both.
///
/// Returns the single terminal report. The report is also logged here, once: a clean close
/// at info level, anything else as a warning naming the side and direction that failed.
pub async fn copy_then_close<R, L>(
    remote: R,
    local: L,
    remote_desc: &str,
    local_desc: &str,
) -> RelayReport
where
    R: AsyncRead + AsyncWrite,
    L: AsyncRead + AsyncWrite,
{
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let mut bytes_to_remote = 0u64;
    let mut bytes_to_local = 0u64;

    // Only one branch completes; the other is dropped without reporting or closing.
    let (read_side, end) = tokio::select! {
        end = copy_half(&mut local_read, &mut remote_write, &mut bytes_to_remote) => (Side::Local, end),
        end = copy_half(&mut remote_read, &mut local_write, &mut bytes_to_local) => (Side::Remote, end),
    };

    let describe = |side: Side| match side {
        Side::Local => local_desc.to_string(),
        Side::Remote => remote_desc.to_string(),
    };

    let outcome = match end {
        HalfEnd::Eof => RelayOutcome::PeerClosed {
            side: read_side,
            description: describe(read_side),
        },
        HalfEnd::ReadFailed(source) => RelayOutcome::Failed(RelayFailure {
            side: read_side,
            direction: Direction::Read,
            description: describe(read_side),
            source,
        }),
        HalfEnd::WriteFailed(source) => {
            let write_side = read_side.opposite();
            RelayOutcome::Failed(RelayFailure {
                side: write_side,
                direction: Direction::Write,
                description: describe(write_side),
                source,
            })
        }
    };

    match &outcome {
        RelayOutcome::PeerClosed {
            side: Side::Local,
            description,
        } => info!(
            bytes_to_remote,
            bytes_to_local, "client closed {}", description
        ),
        RelayOutcome::PeerClosed {
            side: Side::Remote,
            description,
        } => info!(
            bytes_to_remote,
            bytes_to_local, "instance {} closed connection", description
        ),
        RelayOutcome::Failed(failure) => warn!(
            side = %failure.side,
            bytes_to_remote,
            bytes_to_local,
            "{}",
            failure
        ),
    }

    close(&mut remote_write, remote_desc).await;
    close(&mut local_write, local_desc).await;

    RelayReport {
        outcome,
        bytes_to_remote,
        bytes_to_local,
    }
}

/// Shut down the write half. The peer may already be gone, so errors are only traced.
async fn close<W: AsyncWrite + Unpin>(writer: &mut W, desc: &str) {
    match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing {}: {}", desc, e),
        Err(_) => debug!("Closing {} timed out", desc),
    }
}
