//! Named mutual-exclusion locks with a hold timeout.
//!
//! The timeout covers waiting for the lock plus running the critical
//! section, so a holder that never finishes turns into a rejected attempt
//! instead of freezing the table.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Registry of async mutexes keyed by name.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NamedLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `critical` while holding the lock called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockTimeout`] if acquiring the lock and running
    /// `critical` together take longer than `timeout`. The critical section
    /// is dropped at that point.
    pub async fn run<F>(&self, name: &str, timeout: Duration, critical: F) -> Result<F::Output, StoreError>
    where
        F: Future,
    {
        let mutex = Arc::clone(
            self.locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        tokio::time::timeout(timeout, async move {
            let _guard = mutex.lock().await;
            critical.await
        })
        .await
        .map_err(|_| StoreError::LockTimeout {
            name: name.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Returns `true` if the lock exists and is currently held.
    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }
}
