//! Detection of reconciliation trouble that warrants a full resync.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::DriftConfig;

/// Sliding-window counter of trouble occurrences.
///
/// Trouble is a failed event application or an event that waited longer
/// than `max_lock_wait` for the apply lock.
#[derive(Debug)]
pub struct DriftDetector {
    config: DriftConfig,
    seen: Mutex<VecDeque<Instant>>,
}

impl DriftDetector {
    #[must_use]
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            seen: Mutex::new(VecDeque::new()),
        }
    }

    /// Records one occurrence. Returns `true` once `threshold` occurrences
    /// fall within `window`; the window is then emptied.
    pub fn record(&self) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        while seen
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.window)
        {
            seen.pop_front();
        }
        seen.push_back(now);
        if seen.len() >= self.config.threshold {
            seen.clear();
            return true;
        }
        false
    }

    /// Returns `true` if `waited` for the apply lock counts as trouble.
    #[must_use]
    pub fn is_slow(&self, waited: Duration) -> bool {
        waited > self.config.max_lock_wait
    }

    pub fn reset(&self) {
        self.seen.lock().clear();
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.seen.lock().len()
    }
}
