//! Engine lifecycle status, readable without locking.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle state of the sync engine.
///
/// State machine: Starting -> CatchingUp -> Live <-> Resyncing -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Opened, catch-up not started yet.
    Starting,
    /// Fetching rows changed since the watermark.
    CatchingUp,
    /// Caught up and applying channel events.
    Live,
    /// Rebuilding every table from the remote.
    Resyncing,
    /// Shut down; no further work is done.
    Closed,
}

/// Holder of the current [`SyncStatus`] with change notification.
#[derive(Debug)]
pub struct StatusCell {
    current: Arc<ArcSwap<SyncStatus>>,
    changed: watch::Sender<SyncStatus>,
}

impl StatusCell {
    #[must_use]
    pub fn new() -> Self {
        let (changed, _rx) = watch::channel(SyncStatus::Starting);
        Self {
            current: Arc::new(ArcSwap::from_pointee(SyncStatus::Starting)),
            changed,
        }
    }

    #[must_use]
    pub fn get(&self) -> SyncStatus {
        **self.current.load()
    }

    /// Moves to `status` unless already closed.
    pub fn set(&self, status: SyncStatus) {
        if self.get() == SyncStatus::Closed {
            return;
        }
        self.current.store(Arc::new(status));
        self.changed.send_replace(status);
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.changed.subscribe()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
