//! Recognition of change events caused by this client's own writes.
//!
//! Rows sent to the remote are remembered per `(table, key)` for a window.
//! An incoming event whose row agrees with a remembered row on every sent
//! field is an echo.

use std::time::Duration;

use dashmap::DashMap;
use replica_core::{Key, Row};
use tokio::time::Instant;

#[derive(Debug)]
pub struct EchoRegistry {
    sent: DashMap<(String, Key), Vec<(Instant, Row)>>,
    window: Duration,
}

impl EchoRegistry {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            sent: DashMap::new(),
            window,
        }
    }

    /// Remembers a row about to be sent.
    pub fn record(&self, table: &str, key: Key, row: Row) {
        let now = Instant::now();
        let mut entry = self.sent.entry((table.to_string(), key)).or_default();
        entry.retain(|(at, _)| now.duration_since(*at) <= self.window);
        entry.push((now, row));
    }

    /// Returns `true` if `row` matches a row of `table` sent within the
    /// window. A match is consumed.
    pub fn is_echo(&self, table: &str, key: &Key, row: &Row) -> bool {
        let now = Instant::now();
        let id = (table.to_string(), key.clone());
        let Some(mut entry) = self.sent.get_mut(&id) else {
            return false;
        };
        entry.retain(|(at, _)| now.duration_since(*at) <= self.window);
        let hit = entry.iter().position(|(_, sent)| row.agrees_with(sent));
        if let Some(i) = hit {
            entry.remove(i);
        }
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.sent.remove_if(&id, |_, rows| rows.is_empty());
        }
        hit.is_some()
    }

    /// Drops one remembered copy of `row`, for a send that failed.
    pub fn forget(&self, table: &str, key: &Key, row: &Row) {
        let id = (table.to_string(), key.clone());
        let Some(mut entry) = self.sent.get_mut(&id) else {
            return;
        };
        if let Some(i) = entry.iter().rposition(|(_, sent)| sent == row) {
            entry.remove(i);
        }
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.sent.remove_if(&id, |_, rows| rows.is_empty());
        }
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.sent.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.iter().map(|e| e.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
