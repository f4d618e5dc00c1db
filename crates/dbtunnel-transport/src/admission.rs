//! Admission control for concurrent connections
//!
//! A single atomic counter shared by every session. Admission reserves a slot before a
//! session does any work; the returned ticket gives the slot back when dropped, so every
//! exit path of a session (including panics) releases exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Admission was refused because the limit is reached
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("too many open connections (max {max})")]
pub struct AdmissionDenied {
    pub max: u64,
}

/// Tracks active connections against an optional maximum
#[derive(Debug)]
pub struct AdmissionTracker {
    active: AtomicU64,
    /// 0 means unlimited
    max_connections: u64,
}

impl AdmissionTracker {
    /// Create a tracker. A limit of 0 means unlimited.
    pub fn new(max_connections: u64) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicU64::new(0),
            max_connections,
        })
    }

    /// Tracker that never denies, used only for draining
    pub fn unlimited() -> Arc<Self> {
        Self::new(0)
    }

    /// Reserve a slot for a new connection.
    ///
    /// The counter is only incremented when the slot is granted.
    pub fn try_admit(self: &Arc<Self>) -> Result<AdmissionTicket, AdmissionDenied> {
        let max = self.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                if max > 0 && active >= max {
                    None
                } else {
                    Some(active + 1)
                }
            })
            .map_err(|_| AdmissionDenied { max })?;

        Ok(AdmissionTicket {
            tracker: Arc::clone(self),
        })
    }

    /// Live number of admitted, unreleased connections
    pub fn current_count(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> Option<u64> {
        (self.max_connections > 0).then_some(self.max_connections)
    }

    fn release(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "admission counter underflow");
    }
}

/// A granted slot. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping the ticket releases the admission slot immediately"]
pub struct AdmissionTicket {
    tracker: Arc<AdmissionTracker>,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.tracker.release();
    }
}
