//! Orchestrator-owned last-sync watermark.
//!
//! Loaded once at open, advanced only after the corresponding write has
//! committed, and reset to epoch by a forced resync.

use parking_lot::Mutex;
use replica_core::Timestamp;
use tracing::debug;

use crate::error::StoreError;
use crate::storage::LocalStore;

#[derive(Debug)]
pub struct Watermark {
    store: LocalStore,
    current: Mutex<Timestamp>,
}

impl Watermark {
    /// # Errors
    ///
    /// Storage failure reading the persisted value.
    pub async fn load(store: LocalStore) -> Result<Self, StoreError> {
        let current = store.load_watermark().await?;
        Ok(Self {
            store,
            current: Mutex::new(current),
        })
    }

    #[must_use]
    pub fn get(&self) -> Timestamp {
        *self.current.lock()
    }

    /// Persists `ts` if it is later than the current watermark. Returns
    /// whether it moved.
    ///
    /// # Errors
    ///
    /// Storage failure; the in-memory value is left unchanged.
    pub async fn advance(&self, ts: Timestamp) -> Result<bool, StoreError> {
        if ts <= self.get() {
            return Ok(false);
        }
        self.store.store_watermark(ts).await?;
        let mut current = self.current.lock();
        if ts > *current {
            *current = ts;
        }
        debug!(watermark = %ts, "watermark advanced");
        Ok(true)
    }

    /// # Errors
    ///
    /// Storage failure.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.store_watermark(Timestamp::EPOCH).await?;
        *self.current.lock() = Timestamp::EPOCH;
        Ok(())
    }
}
