//! Bookkeeping for in-flight and lifetime downloads.
//!
//! Every download that reaches the serving stage is registered through
//! [`DownloadTracker::begin`], which bumps the lifetime counter and adds the
//! client's `(address, port)` to the active set. The returned
//! [`ActiveDownload`] removes that entry when it is dropped, so the entry is
//! released exactly once whether the stream completed, failed, or the client
//! went away and the body was discarded.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

/// Identity of one download: the client's address and ephemeral port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(SocketAddr);

impl ConnectionId {
    pub fn new(peer: SocketAddr) -> Self {
        Self(peer)
    }

    pub fn peer(&self) -> SocketAddr {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0.ip(), self.0.port())
    }
}

/// Point-in-time view of the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadStats {
    pub active: usize,
    pub total_served: u64,
    pub peak_active: usize,
}

/// How a download ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { bytes: u64 },
    Failed { bytes: u64, error: String },
    Aborted { bytes: u64 },
}

#[derive(Debug, Default)]
struct TrackerState {
    active: HashSet<ConnectionId>,
    total_served: u64,
    peak_active: usize,
}

/// Active-connection set plus lifetime counter, shared by every handler
#[derive(Debug, Clone, Default)]
pub struct DownloadTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a download that is about to start streaming.
    pub fn begin(&self, id: ConnectionId) -> ActiveDownload {
        let (serial, active) = {
            let mut state = self.lock();
            if !state.active.insert(id) {
                warn!(client = %id, "Connection already has an active download");
            }
            state.total_served += 1;
            state.peak_active = state.peak_active.max(state.active.len());
            (state.total_served, state.active.len())
        };

        info!(
            serial,
            client = %id.peer().ip(),
            active,
            "[{}] Download started: {}",
            serial,
            id
        );

        ActiveDownload {
            tracker: self.clone(),
            id,
            serial,
            bytes_sent: 0,
            outcome: None,
        }
    }

    pub fn stats(&self) -> DownloadStats {
        let state = self.lock();
        DownloadStats {
            active: state.active.len(),
            total_served: state.total_served,
            peak_active: state.peak_active,
        }
    }

    #[cfg(test)]
    pub fn is_active(&self, id: &ConnectionId) -> bool {
        self.lock().active.contains(id)
    }

    fn finish(&self, id: &ConnectionId) -> usize {
        let mut state = self.lock();
        state.active.remove(id);
        state.active.len()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // Poison is ignored; each critical section is a single insert,
        // remove or increment.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connection record for one streaming download
///
/// Dropping it removes the record from the active set and logs the outcome.
/// A download dropped without an explicit outcome counts as aborted.
#[derive(Debug)]
pub struct ActiveDownload {
    tracker: DownloadTracker,
    id: ConnectionId,
    serial: u64,
    bytes_sent: u64,
    outcome: Option<DownloadOutcome>,
}

impl ActiveDownload {
    /// Position of this download in the lifetime counter (1-based)
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn record_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
    }

    pub fn complete(mut self) {
        self.outcome = Some(DownloadOutcome::Completed {
            bytes: self.bytes_sent,
        });
    }

    pub fn fail(mut self, error: impl std::fmt::Display) {
        self.outcome = Some(DownloadOutcome::Failed {
            bytes: self.bytes_sent,
            error: error.to_string(),
        });
    }
}

impl Drop for ActiveDownload {
    fn drop(&mut self) {
        let active = self.tracker.finish(&self.id);
        let outcome = self.outcome.take().unwrap_or(DownloadOutcome::Aborted {
            bytes: self.bytes_sent,
        });

        match outcome {
            DownloadOutcome::Completed { bytes } => info!(
                serial = self.serial,
                client = %self.id,
                bytes,
                active,
                "[{}] Download complete: {}",
                self.serial,
                self.id.peer().ip()
            ),
            DownloadOutcome::Failed { bytes, error } => warn!(
                serial = self.serial,
                client = %self.id,
                bytes,
                active,
                "[{}] Download failed: {} - {}",
                self.serial,
                self.id.peer().ip(),
                error
            ),
            DownloadOutcome::Aborted { bytes } => warn!(
                serial = self.serial,
                client = %self.id,
                bytes,
                active,
                "[{}] Download aborted: {} disconnected",
                self.serial,
                self.id.peer().ip()
            ),
        }
    }
}
