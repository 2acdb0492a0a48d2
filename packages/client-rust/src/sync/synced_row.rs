//! One row's live value with an explicit observer interface.

use std::sync::Arc;

use parking_lot::Mutex;
use replica_core::{Key, Row};

use super::controller::TableSync;
use crate::emitter::{EventEmitter, Subscription};
use crate::error::SyncError;
use crate::query::LiveQuery;

/// Keeps the current value of one row and notifies observers when it
/// changes. `None` means the row is absent or was deleted.
pub struct SyncedRow {
    table: Arc<TableSync>,
    key: Key,
    current: Arc<Mutex<Option<Row>>>,
    observers: Arc<EventEmitter<Option<Row>>>,
    _live: LiveQuery,
}

impl SyncedRow {
    /// Binds to the row with `key` in `table`.
    ///
    /// # Errors
    ///
    /// See [`TableSync::observe`].
    pub fn bind(table: &Arc<TableSync>, key: Key) -> Result<Self, SyncError> {
        let current = Arc::new(Mutex::new(None));
        let observers = Arc::new(EventEmitter::new());
        let live = {
            let current = Arc::clone(&current);
            let observers = Arc::clone(&observers);
            table.observe(&key, move |row| {
                *current.lock() = row.clone();
                observers.emit(&row);
            })?
        };
        Ok(Self {
            table: Arc::clone(table),
            key,
            current,
            observers,
            _live: live,
        })
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The last value seen.
    #[must_use]
    pub fn current(&self) -> Option<Row> {
        self.current.lock().clone()
    }

    /// Registers an observer of later values.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Option<Row>) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    /// Merges `partial` into the row through the table's update path.
    ///
    /// # Errors
    ///
    /// See [`TableSync::update`].
    pub async fn write(&self, partial: Row) -> Result<Row, SyncError> {
        let mut row = partial;
        row.insert(self.table.info().primary_key.clone(), self.key.clone());
        self.table.update(row).await
    }
}

impl std::fmt::Debug for SyncedRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedRow")
            .field("table", &self.table.name())
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use replica_core::{TableInfo, Value};

    use super::*;
    use crate::sync::retry::RetryPolicy;
    use crate::sync::testing::fixture;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn tracks_writes_and_deletes() {
        let fx = fixture(TableInfo::new("tasks", "id"), false, RetryPolicy::default()).await;
        let row = SyncedRow::bind(&fx.table, Key::Int(3)).unwrap();
        settle().await;
        assert_eq!(row.current(), None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            row.subscribe(move |value| seen.lock().push(value.clone()))
        };

        row.write(Row::new().with("title", "draft")).await.unwrap();
        settle().await;
        let current = row.current().unwrap();
        assert_eq!(current.get("id"), Some(&Value::Int(3)));
        assert_eq!(current.get("title"), Some(&Value::from("draft")));

        fx.table.store().delete(&Key::Int(3)).await.unwrap();
        settle().await;
        assert_eq!(row.current(), None);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn unsubscribed_observers_stop_hearing() {
        let fx = fixture(TableInfo::new("tasks", "id"), false, RetryPolicy::default()).await;
        let row = SyncedRow::bind(&fx.table, Key::Int(1)).unwrap();
        settle().await;

        let hits = Arc::new(Mutex::new(0));
        let sub = {
            let hits = Arc::clone(&hits);
            row.subscribe(move |_| *hits.lock() += 1)
        };
        row.write(Row::new().with("a", 1)).await.unwrap();
        settle().await;
        sub.unsubscribe();
        row.write(Row::new().with("a", 2)).await.unwrap();
        settle().await;

        assert_eq!(*hits.lock(), 1);
        assert_eq!(row.current().and_then(|r| r.get("a").cloned()), Some(Value::Int(2)));
    }
}
