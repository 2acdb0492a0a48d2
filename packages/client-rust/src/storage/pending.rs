//! Durable queue of optimistic mutations awaiting delivery to the remote.
//!
//! Entries are partial rows keyed by an auto-incrementing sequence number,
//! so they replay in the order they were made.

use std::collections::BTreeMap;
use std::sync::Arc;

use redb::{Database, ReadableTable, Table};
use replica_core::{Key, Row, TableInfo};

use super::table::reset_area;
use super::{decode_row, encode_row, pending_area, SeqArea};
use crate::error::StoreError;

pub(crate) type SeqTable<'txn> = Table<'txn, u64, &'static [u8]>;

/// One queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub seq: u64,
    pub row: Row,
}

/// Pending-mutation area of one table.
#[derive(Clone)]
pub struct PendingQueue {
    info: Arc<TableInfo>,
    db: Arc<Database>,
    area: Arc<str>,
}

impl PendingQueue {
    pub(crate) fn new(info: Arc<TableInfo>, db: Arc<Database>) -> Self {
        let area = pending_area(&info.name).into();
        Self { info, db, area }
    }

    /// Appends a mutation and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Storage or encode failure.
    pub async fn enqueue(&self, row: Row) -> Result<u64, StoreError> {
        let bytes = encode_row(&row)?;
        self.blocking(move |db, area| {
            let txn = db.begin_write()?;
            let seq = push(&mut txn.open_table(SeqArea::new(area))?, &bytes)?;
            txn.commit()?;
            Ok(seq)
        })
        .await
    }

    /// Every queued mutation in sequence order. Undecodable entries are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn entries(&self) -> Result<Vec<PendingMutation>, StoreError> {
        let table_name = self.info.name.clone();
        self.blocking(move |db, area| {
            let txn = db.begin_read()?;
            let table = txn.open_table(SeqArea::new(area))?;
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                match decode_row(v.value()) {
                    Ok(row) => out.push(PendingMutation { seq: k.value(), row }),
                    Err(e) => tracing::warn!(table = %table_name, seq = k.value(), error = %e, "skipping undecodable pending mutation"),
                }
            }
            Ok(out)
        })
        .await
    }

    /// Purges the given entries.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn remove(&self, seqs: &[u64]) -> Result<(), StoreError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let seqs = seqs.to_vec();
        self.blocking(move |db, area| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(SeqArea::new(area))?;
                for seq in seqs {
                    table.remove(seq)?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    /// Purges every entry targeting `key`. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn remove_key(&self, key: &Key) -> Result<usize, StoreError> {
        let info = Arc::clone(&self.info);
        let key = key.clone();
        self.blocking(move |db, area| {
            let txn = db.begin_write()?;
            let dropped = discard(&mut txn.open_table(SeqArea::new(area))?, &info, &[key])?;
            txn.commit()?;
            Ok(dropped)
        })
        .await
    }

    /// # Errors
    ///
    /// Storage failure.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.blocking(move |db, area| {
            let txn = db.begin_write()?;
            reset_area::<u64, &[u8]>(&txn, area)?;
            txn.commit()?;
            Ok(())
        })
        .await
    }

    /// # Errors
    ///
    /// Storage failure.
    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries().await?.len())
    }

    /// # Errors
    ///
    /// Storage failure.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        self.blocking(move |db, area| {
            let txn = db.begin_read()?;
            let table = txn.open_table(SeqArea::new(area))?;
            let empty = table.iter()?.next().is_none();
            Ok(empty)
        })
        .await
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let area = Arc::clone(&self.area);
        tokio::task::spawn_blocking(move || op(&db, &area)).await?
    }
}

/// Appends `bytes` after the last entry of an open queue area.
pub(crate) fn push(queue: &mut SeqTable<'_>, bytes: &[u8]) -> Result<u64, StoreError> {
    let last = queue.iter()?.next_back().transpose()?.map(|(k, _)| k.value());
    let seq = last.map_or(1, |s| s + 1);
    queue.insert(seq, bytes)?;
    Ok(seq)
}

/// Removes every entry of an open queue area targeting one of `keys`.
/// Undecodable entries are left alone.
pub(crate) fn discard(queue: &mut SeqTable<'_>, info: &TableInfo, keys: &[Key]) -> Result<usize, StoreError> {
    if keys.is_empty() {
        return Ok(0);
    }
    let mut doomed = Vec::new();
    for entry in queue.iter()? {
        let (k, v) = entry?;
        let Ok(row) = decode_row(v.value()) else {
            continue;
        };
        if info.key_of(&row).is_some_and(|key| keys.contains(&key)) {
            doomed.push(k.value());
        }
    }
    for seq in &doomed {
        queue.remove(*seq)?;
    }
    Ok(doomed.len())
}

/// Unsent mutations of an open queue area, grouped by key in queue order.
pub(crate) fn unsent_by_key<T>(queue: &T, info: &TableInfo) -> Result<BTreeMap<Key, Vec<Row>>, StoreError>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let mut unsent: BTreeMap<Key, Vec<Row>> = BTreeMap::new();
    for entry in queue.iter()? {
        let (_, v) = entry?;
        if let Ok(row) = decode_row(v.value()) {
            if let Some(key) = info.key_of(&row) {
                unsent.entry(key).or_default().push(row);
            }
        }
    }
    Ok(unsent)
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("table", &self.info.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;

    async fn open() -> (tempfile::TempDir, PendingQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("p.redb"), &[TableInfo::new("tasks", "id")])
            .await
            .unwrap();
        let queue = store.pending("tasks").unwrap();
        (dir, queue)
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let (_dir, queue) = open().await;
        let a = queue.enqueue(Row::new().with("id", 1).with("a", 1)).await.unwrap();
        let b = queue.enqueue(Row::new().with("id", 1).with("b", 2)).await.unwrap();
        assert!(b > a);

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![a, b]);
    }

    #[tokio::test]
    async fn remove_purges_only_given_entries() {
        let (_dir, queue) = open().await;
        let a = queue.enqueue(Row::new().with("id", 1)).await.unwrap();
        let b = queue.enqueue(Row::new().with("id", 2)).await.unwrap();

        queue.remove(&[a]).await.unwrap();
        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, b);
    }

    #[tokio::test]
    async fn remove_key_drops_every_entry_for_key() {
        let (_dir, queue) = open().await;
        queue.enqueue(Row::new().with("id", 1).with("a", 1)).await.unwrap();
        queue.enqueue(Row::new().with("id", 2).with("a", 1)).await.unwrap();
        queue.enqueue(Row::new().with("id", 1).with("b", 2)).await.unwrap();

        assert_eq!(queue.remove_key(&Key::Int(1)).await.unwrap(), 2);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_empties_queue() {
        let (_dir, queue) = open().await;
        queue.enqueue(Row::new().with("id", 1)).await.unwrap();
        queue.clear().await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }
}
