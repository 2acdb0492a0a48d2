//! Per-table CRUD and secondary-index access over the shared redb database.
//!
//! Rows are stored under their order-preserving key encoding. Every indexed
//! field contributes one index entry per row:
//!
//! ```text
//! encode_field(field) ++ encode_value(value) ++ encode_key(pk)  ->  encode_key(pk)
//! ```
//!
//! Every write goes through [`TableStore::commit`]: row and index edits,
//! the pending-queue entries they imply and the search nodes they touch are
//! written in one transaction, so none of them is ever out of step with the
//! others. A commit always runs to completion on the blocking pool once
//! started, even if its caller stops waiting; changes are emitted from there
//! right after the transaction lands. Reads race a [`CancellationToken`] and
//! abort their transaction when it fires.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition, WriteTransaction};
use replica_core::encoding::{decode_key, encode_field, encode_key, encode_value, prefix_successor, TAG_STRING};
use replica_core::{Change, IndexRange, Key, Row, TableInfo, Value, CALCULATED_FIELD};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pending::{discard, push, unsent_by_key};
use super::{decode_row, encode_row, index_area, pending_area, rows_area, BytesArea, NamedLocks, SeqArea};
use crate::emitter::EventEmitter;
use crate::error::StoreError;
use crate::search::SearchIndex;

/// Rows between cancellation checks during scans.
const CANCEL_CHECK_EVERY: usize = 256;

type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

/// Area names of one table.
#[derive(Debug, Clone)]
struct Areas {
    rows: Arc<str>,
    index: Arc<str>,
    pending: Arc<str>,
}

/// Edits applied atomically by [`TableStore::commit`].
///
/// A reset runs first; row edits then run in the order they were added.
#[derive(Debug, Default)]
pub struct Commit {
    reset: bool,
    ops: Vec<RowOp>,
    discard: Vec<Key>,
    enqueue: Vec<Row>,
}

#[derive(Debug)]
enum RowOp {
    Put(Row),
    Merge(Key, Row),
    Remote(Key, Row),
    Delete(Key),
}

impl Commit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every row, index entry, queued mutation and search node of the
    /// table before anything else in this commit.
    #[must_use]
    pub fn reset(mut self) -> Self {
        self.reset = true;
        self
    }

    /// Upserts `row` as given.
    #[must_use]
    pub fn put(mut self, row: Row) -> Self {
        self.ops.push(RowOp::Put(row));
        self
    }

    #[must_use]
    pub fn put_all(mut self, rows: impl IntoIterator<Item = Row>) -> Self {
        self.ops.extend(rows.into_iter().map(RowOp::Put));
        self
    }

    /// Merges `partial` into the row stored under `key`, or into an empty
    /// row if there is none.
    #[must_use]
    pub fn merge(mut self, key: Key, partial: Row) -> Self {
        self.ops.push(RowOp::Merge(key, partial));
        self
    }

    /// Stores a row received from the remote. The local `_calculated` map is
    /// kept unless the row brings its own, and unsent mutations of the key
    /// are replayed on top.
    #[must_use]
    pub fn remote(mut self, key: Key, row: Row) -> Self {
        self.ops.push(RowOp::Remote(key, row));
        self
    }

    #[must_use]
    pub fn delete(mut self, key: Key) -> Self {
        self.ops.push(RowOp::Delete(key));
        self
    }

    /// Drops every queued mutation of `key`, before `enqueue`d entries are
    /// appended.
    #[must_use]
    pub fn discard(mut self, key: Key) -> Self {
        self.discard.push(key);
        self
    }

    /// Queues `row` for the remote.
    #[must_use]
    pub fn enqueue(mut self, row: Row) -> Self {
        self.enqueue.push(row);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.reset && self.ops.is_empty() && self.discard.is_empty() && self.enqueue.is_empty()
    }
}

/// Outcome of a [`TableStore::commit`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Committed {
    /// One change per row that actually changed, reset deletions first.
    pub changes: Vec<Change>,
    /// Row stored by each put, merge or remote edit, in edit order.
    pub rows: Vec<Row>,
    /// Sequence numbers of the queued entries.
    pub queued: Vec<u64>,
    /// Queued mutations dropped by a reset or a discard.
    pub discarded: usize,
    /// Whether the table was reset first.
    pub reset: bool,
}

/// Type-safe access to one table's row, index and pending areas.
///
/// Cheap to clone; clones share the database, lock registry, change emitter
/// and attached search index.
#[derive(Clone)]
pub struct TableStore {
    info: Arc<TableInfo>,
    db: Arc<Database>,
    locks: Arc<NamedLocks>,
    changes: Arc<EventEmitter<Change>>,
    search: Option<Arc<SearchIndex>>,
    areas: Areas,
}

impl TableStore {
    pub(crate) fn new(info: Arc<TableInfo>, db: Arc<Database>, locks: Arc<NamedLocks>) -> Self {
        let areas = Areas {
            rows: rows_area(&info.name).into(),
            index: index_area(&info.name).into(),
            pending: pending_area(&info.name).into(),
        };
        Self {
            info,
            db,
            locks,
            changes: Arc::new(EventEmitter::new()),
            search: None,
            areas,
        }
    }

    /// Keeps `search` in step with every commit through this handle and its
    /// clones made afterwards.
    #[must_use]
    pub fn with_search(mut self, search: Arc<SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }

    #[must_use]
    pub fn search(&self) -> Option<&Arc<SearchIndex>> {
        self.search.as_ref()
    }

    #[must_use]
    pub fn info(&self) -> &Arc<TableInfo> {
        &self.info
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Emitter of every committed [`Change`] to this table.
    #[must_use]
    pub fn changes(&self) -> &EventEmitter<Change> {
        &self.changes
    }

    // -- writes ------------------------------------------------------------

    /// Upserts one row. Returns `None` when the stored row is already equal.
    ///
    /// # Errors
    ///
    /// Fails on a row without a usable primary key or on storage failure.
    pub async fn write(&self, row: Row) -> Result<Option<Change>, StoreError> {
        Ok(self.write_many(vec![row]).await?.pop())
    }

    /// Upserts rows in one transaction, emitting one change per row that
    /// actually changed.
    ///
    /// # Errors
    ///
    /// Fails on a row without a usable primary key or on storage failure.
    /// Nothing is written in that case.
    pub async fn write_many(&self, rows: Vec<Row>) -> Result<Vec<Change>, StoreError> {
        Ok(self.commit(Commit::new().put_all(rows)).await?.changes)
    }

    /// Deletes one row. Returns `None` if it was not stored.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn delete(&self, key: &Key) -> Result<Option<Change>, StoreError> {
        Ok(self.delete_many(std::slice::from_ref(key)).await?.pop())
    }

    /// Deletes rows in one transaction. Missing keys are skipped.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn delete_many(&self, keys: &[Key]) -> Result<Vec<Change>, StoreError> {
        let commit = keys.iter().cloned().fold(Commit::new(), Commit::delete);
        Ok(self.commit(commit).await?.changes)
    }

    /// Removes every row, index entry, queued mutation and search node,
    /// emitting a delete per row.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn clear(&self) -> Result<Vec<Change>, StoreError> {
        Ok(self.commit(Commit::new().reset()).await?.changes)
    }

    /// Applies `commit` in one write transaction and emits its changes.
    ///
    /// Once started the transaction runs to completion even if the returned
    /// future is dropped, so a caller that gives up early may still find
    /// its edits applied, whole.
    ///
    /// # Errors
    ///
    /// Fails on a row without a usable primary key or on storage failure.
    /// Nothing is written in that case.
    pub async fn commit(&self, commit: Commit) -> Result<Committed, StoreError> {
        if commit.is_empty() {
            return Ok(Committed::default());
        }
        let info = Arc::clone(&self.info);
        let areas = self.areas.clone();
        let search = self.search.clone();
        let emitter = Arc::clone(&self.changes);
        let committed = self
            .blocking(None, move |db| {
                let committed = match &search {
                    Some(search) => search.commit_with(db, |txn| stage(txn, &info, &areas, commit)),
                    None => {
                        let txn = db.begin_write()?;
                        let committed = stage(&txn, &info, &areas, commit)?;
                        txn.commit()?;
                        Ok(committed)
                    }
                }?;
                for change in &committed.changes {
                    emitter.emit(change);
                }
                Ok(committed)
            })
            .await?;
        debug!(
            table = %self.info.name,
            changed = committed.changes.len(),
            queued = committed.queued.len(),
            discarded = committed.discarded,
            "commit applied"
        );
        Ok(committed)
    }

    // -- reads -------------------------------------------------------------

    /// Reads one row.
    ///
    /// # Errors
    ///
    /// [`StoreError::Aborted`] when `cancel` fires first; storage or decode
    /// failure otherwise.
    pub async fn read(&self, key: &Key, cancel: Option<&CancellationToken>) -> Result<Option<Row>, StoreError> {
        let key = encode_key(key);
        let rows_area = Arc::clone(&self.areas.rows);
        self.blocking(cancel, move |db| {
            let txn = db.begin_read()?;
            let rows_t = txn.open_table(BytesArea::new(&rows_area))?;
            let row = match rows_t.get(key.as_slice())? {
                Some(bytes) => Some(decode_row(bytes.value())?),
                None => None,
            };
            Ok(row)
        })
        .await
    }

    /// Reads rows in one transaction, in key order of `keys`.
    ///
    /// Fail-soft per key: a missing or undecodable row yields `None`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Aborted`] when `cancel` fires first; storage failure.
    pub async fn read_many(&self, keys: &[Key], cancel: Option<&CancellationToken>) -> Result<Vec<Option<Row>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<Vec<u8>> = keys.iter().map(encode_key).collect();
        let rows_area = Arc::clone(&self.areas.rows);
        let table = self.info.name.clone();
        let token = cancel.cloned();
        self.blocking(cancel, move |db| {
            let txn = db.begin_read()?;
            let rows_t = txn.open_table(BytesArea::new(&rows_area))?;
            let mut out = Vec::with_capacity(keys.len());
            for (i, key) in keys.iter().enumerate() {
                check_cancel(token.as_ref(), i, &table)?;
                let row = match rows_t.get(key.as_slice())? {
                    Some(bytes) => decode_row(bytes.value())
                        .map_err(|e| warn!(table = %table, error = %e, "skipping undecodable row"))
                        .ok(),
                    None => None,
                };
                out.push(row);
            }
            Ok(out)
        })
        .await
    }

    /// Reads every row in key order.
    ///
    /// # Errors
    ///
    /// [`StoreError::Aborted`] when `cancel` fires first; storage or decode
    /// failure otherwise.
    pub async fn read_all(&self, cancel: Option<&CancellationToken>) -> Result<Vec<Row>, StoreError> {
        let rows_area = Arc::clone(&self.areas.rows);
        let table = self.info.name.clone();
        let token = cancel.cloned();
        self.blocking(cancel, move |db| {
            let txn = db.begin_read()?;
            let rows_t = txn.open_table(BytesArea::new(&rows_area))?;
            let mut out = Vec::new();
            for (i, entry) in rows_t.iter()?.enumerate() {
                check_cancel(token.as_ref(), i, &table)?;
                let (_, v) = entry?;
                out.push(decode_row(v.value())?);
            }
            Ok(out)
        })
        .await
    }

    /// Reads every primary key in key order.
    ///
    /// # Errors
    ///
    /// [`StoreError::Aborted`] when `cancel` fires first; storage failure.
    pub async fn read_all_keys(&self, cancel: Option<&CancellationToken>) -> Result<Vec<Key>, StoreError> {
        let rows_area = Arc::clone(&self.areas.rows);
        let table = self.info.name.clone();
        let token = cancel.cloned();
        self.blocking(cancel, move |db| {
            let txn = db.begin_read()?;
            let rows_t = txn.open_table(BytesArea::new(&rows_area))?;
            let mut out = Vec::new();
            for (i, entry) in rows_t.iter()?.enumerate() {
                check_cancel(token.as_ref(), i, &table)?;
                let (k, _) = entry?;
                out.extend(decode_key(k.value()));
            }
            Ok(out)
        })
        .await
    }

    /// Largest numeric primary key, found by a reverse scan of the numeric
    /// key range.
    ///
    /// # Errors
    ///
    /// [`StoreError::Aborted`] when `cancel` fires first; storage failure.
    pub async fn find_largest_id(&self, cancel: Option<&CancellationToken>) -> Result<Option<i64>, StoreError> {
        let rows_area = Arc::clone(&self.areas.rows);
        self.blocking(cancel, move |db| {
            let txn = db.begin_read()?;
            let rows_t = txn.open_table(BytesArea::new(&rows_area))?;
            let upper: &[u8] = &[TAG_STRING];
            let last = rows_t.range(..upper)?.next_back().transpose()?;
            Ok(last.and_then(|(k, _)| match decode_key(k.value()) {
                Some(Key::Int(i)) => Some(i),
                _ => None,
            }))
        })
        .await
    }

    /// Number of stored rows.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let rows_area = Arc::clone(&self.areas.rows);
        self.blocking(None, move |db| {
            let txn = db.begin_read()?;
            let rows_t = txn.open_table(BytesArea::new(&rows_area))?;
            let mut count = 0;
            for entry in rows_t.iter()? {
                entry?;
                count += 1;
            }
            Ok(count)
        })
        .await
    }

    /// # Errors
    ///
    /// Storage failure.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        let rows_area = Arc::clone(&self.areas.rows);
        self.blocking(None, move |db| {
            let txn = db.begin_read()?;
            let rows_t = txn.open_table(BytesArea::new(&rows_area))?;
            let empty = rows_t.iter()?.next().is_none();
            Ok(empty)
        })
        .await
    }

    /// Handle to the secondary index of `field`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotIndexed`] if the field was not declared indexed.
    pub fn index(&self, field: &str) -> Result<IndexReader, StoreError> {
        if !self.info.is_indexed(field) {
            return Err(StoreError::NotIndexed {
                table: self.info.name.clone(),
                field: field.to_string(),
            });
        }
        Ok(IndexReader {
            store: self.clone(),
            field: field.to_string(),
            prefix: encode_field(field),
        })
    }

    /// Runs `critical` under this table's named lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockTimeout`] if waiting plus running exceeds `timeout`.
    pub async fn lock<F>(&self, timeout: Duration, critical: F) -> Result<F::Output, StoreError>
    where
        F: Future,
    {
        self.locks.run(&self.info.name, timeout, critical).await
    }

    // -- internals ---------------------------------------------------------

    async fn blocking<T, F>(&self, cancel: Option<&CancellationToken>, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(self.aborted());
        }
        let db = Arc::clone(&self.db);
        let task = tokio::task::spawn_blocking(move || op(&db));
        match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => Err(self.aborted()),
                joined = task => joined?,
            },
            None => task.await?,
        }
    }

    fn aborted(&self) -> StoreError {
        StoreError::Aborted {
            table: self.info.name.clone(),
        }
    }
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("table", &self.info.name)
            .finish_non_exhaustive()
    }
}

/// Read access to one field's secondary index.
#[derive(Debug, Clone)]
pub struct IndexReader {
    store: TableStore,
    field: String,
    prefix: Vec<u8>,
}

impl IndexReader {
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Keys of rows whose encoded field value falls in any of `ranges`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Aborted`] when `cancel` fires first; storage failure.
    pub async fn keys_in(&self, ranges: &[IndexRange], cancel: Option<&CancellationToken>) -> Result<BTreeSet<Key>, StoreError> {
        let bounds: Vec<(Bound<Vec<u8>>, Bound<Vec<u8>>)> = ranges
            .iter()
            .map(|range| scan_bounds(&self.prefix, range))
            .filter(|(lo, hi)| !is_empty_range(lo, hi))
            .collect();
        if bounds.is_empty() {
            return Ok(BTreeSet::new());
        }
        let index_area = Arc::clone(&self.store.areas.index);
        let table = self.store.info.name.clone();
        let token = cancel.cloned();
        self.store
            .blocking(cancel, move |db| {
                let txn = db.begin_read()?;
                let index_t = txn.open_table(BytesArea::new(&index_area))?;
                let mut keys = BTreeSet::new();
                let mut scanned = 0;
                for (lo, hi) in &bounds {
                    for entry in index_t.range::<&[u8]>((as_slice(lo), as_slice(hi)))? {
                        check_cancel(token.as_ref(), scanned, &table)?;
                        scanned += 1;
                        let (_, pk) = entry?;
                        keys.extend(decode_key(pk.value()));
                    }
                }
                Ok(keys)
            })
            .await
    }

    /// Keys of rows whose field equals `value`. Unindexable values match
    /// nothing.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn keys_eq(&self, value: &Value, cancel: Option<&CancellationToken>) -> Result<BTreeSet<Key>, StoreError> {
        match encode_value(value) {
            Some(encoded) => self.keys_in(&[IndexRange::point(encoded)], cancel).await,
            None => Ok(BTreeSet::new()),
        }
    }
}

/// Index entries a row contributes.
pub(crate) fn index_entries(info: &TableInfo, key: &Key, row: &Row) -> Vec<Vec<u8>> {
    let key = encode_key(key);
    info.indexes
        .iter()
        .filter_map(|field| {
            let value = encode_value(row.get(field)?)?;
            let mut entry = encode_field(field);
            entry.extend_from_slice(&value);
            entry.extend_from_slice(&key);
            Some(entry)
        })
        .collect()
}

/// Applies the edits of `commit` inside `txn`.
fn stage(txn: &WriteTransaction, info: &TableInfo, areas: &Areas, commit: Commit) -> Result<Committed, StoreError> {
    let mut out = Committed {
        reset: commit.reset,
        ..Committed::default()
    };
    if commit.reset {
        out.changes = stored_rows(txn, &areas.rows)?
            .into_iter()
            .map(|(key, row)| Change {
                key,
                old: Some(row),
                new: None,
            })
            .collect();
        let queued = txn.open_table(SeqArea::new(&areas.pending))?.len()?;
        out.discarded = usize::try_from(queued).unwrap_or(usize::MAX);
        reset_area::<&[u8], &[u8]>(txn, &areas.rows)?;
        reset_area::<&[u8], &[u8]>(txn, &areas.index)?;
        reset_area::<u64, &[u8]>(txn, &areas.pending)?;
    }

    let mut queue = txn.open_table(SeqArea::new(&areas.pending))?;
    out.discarded += discard(&mut queue, info, &commit.discard)?;
    let needs_unsent = commit.ops.iter().any(|op| matches!(op, RowOp::Remote(..)));
    let unsent = if needs_unsent {
        unsent_by_key(&queue, info)?
    } else {
        BTreeMap::new()
    };
    for row in &commit.enqueue {
        out.queued.push(push(&mut queue, &encode_row(row)?)?);
    }

    let mut rows_t = txn.open_table(BytesArea::new(&areas.rows))?;
    let mut index_t = txn.open_table(BytesArea::new(&areas.index))?;
    for op in commit.ops {
        let change = match op {
            RowOp::Put(row) => {
                out.rows.push(row.clone());
                put_row(&mut rows_t, &mut index_t, info, row)?
            }
            RowOp::Merge(key, partial) => {
                let mut merged = read_row(&rows_t, &key)?.unwrap_or_default();
                merged.merge(&partial);
                out.rows.push(merged.clone());
                put_row(&mut rows_t, &mut index_t, info, merged)?
            }
            RowOp::Remote(key, mut row) => {
                if let Some(derived) = read_row(&rows_t, &key)?.and_then(|local| local.get(CALCULATED_FIELD).cloned()) {
                    if !row.contains(CALCULATED_FIELD) {
                        row.insert(CALCULATED_FIELD, derived);
                    }
                }
                for partial in unsent.get(&key).into_iter().flatten() {
                    row.merge(partial);
                }
                out.rows.push(row.clone());
                put_row(&mut rows_t, &mut index_t, info, row)?
            }
            RowOp::Delete(key) => remove_row(&mut rows_t, &mut index_t, info, key)?,
        };
        out.changes.extend(change);
    }
    Ok(out)
}

fn read_row(rows_t: &BytesTable<'_>, key: &Key) -> Result<Option<Row>, StoreError> {
    let key = encode_key(key);
    let row = match rows_t.get(key.as_slice())? {
        Some(bytes) => Some(decode_row(bytes.value())?),
        None => None,
    };
    Ok(row)
}

/// Every decodable row of a rows area, in key order.
pub(crate) fn stored_rows(txn: &WriteTransaction, area: &str) -> Result<Vec<(Key, Row)>, StoreError> {
    let rows_t = txn.open_table(BytesArea::new(area))?;
    let mut out = Vec::new();
    for entry in rows_t.iter()? {
        let (k, v) = entry?;
        if let (Some(key), Ok(row)) = (decode_key(k.value()), decode_row(v.value())) {
            out.push((key, row));
        }
    }
    Ok(out)
}

/// Drops and recreates an area inside a write transaction.
pub(crate) fn reset_area<K, V>(txn: &WriteTransaction, area: &str) -> Result<(), StoreError>
where
    K: redb::Key + 'static,
    V: redb::Value + 'static,
{
    txn.delete_table(TableDefinition::<K, V>::new(area))?;
    txn.open_table(TableDefinition::<K, V>::new(area))?;
    Ok(())
}

fn put_row(rows_t: &mut BytesTable<'_>, index_t: &mut BytesTable<'_>, info: &TableInfo, row: Row) -> Result<Option<Change>, StoreError> {
    let key = info.key_of(&row).ok_or_else(|| StoreError::MissingKey {
        table: info.name.clone(),
    })?;
    let key_bytes = encode_key(&key);
    let old = read_row(rows_t, &key)?;
    if old.as_ref() == Some(&row) {
        return Ok(None);
    }
    if let Some(old) = &old {
        for entry in index_entries(info, &key, old) {
            index_t.remove(entry.as_slice())?;
        }
    }
    for entry in index_entries(info, &key, &row) {
        index_t.insert(entry.as_slice(), key_bytes.as_slice())?;
    }
    rows_t.insert(key_bytes.as_slice(), encode_row(&row)?.as_slice())?;
    Ok(Some(Change {
        key,
        old,
        new: Some(row),
    }))
}

fn remove_row(rows_t: &mut BytesTable<'_>, index_t: &mut BytesTable<'_>, info: &TableInfo, key: Key) -> Result<Option<Change>, StoreError> {
    let key_bytes = encode_key(&key);
    let old = match rows_t.remove(key_bytes.as_slice())? {
        Some(bytes) => decode_row(bytes.value())?,
        None => return Ok(None),
    };
    for entry in index_entries(info, &key, &old) {
        index_t.remove(entry.as_slice())?;
    }
    Ok(Some(Change {
        key,
        old: Some(old),
        new: None,
    }))
}

fn check_cancel(token: Option<&CancellationToken>, scanned: usize, table: &str) -> Result<(), StoreError> {
    if scanned % CANCEL_CHECK_EVERY == 0 && token.is_some_and(CancellationToken::is_cancelled) {
        return Err(StoreError::Aborted {
            table: table.to_string(),
        });
    }
    Ok(())
}

/// Translates a range over encoded values into a range over index entries
/// of the field with entry prefix `prefix`.
fn scan_bounds(prefix: &[u8], range: &IndexRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let with_prefix = |value: &[u8]| {
        let mut out = prefix.to_vec();
        out.extend_from_slice(value);
        out
    };
    let after = |bytes: Vec<u8>| match prefix_successor(&bytes) {
        Some(next) => Bound::Excluded(next),
        None => Bound::Unbounded,
    };

    let lower = match &range.lower {
        Bound::Unbounded => Bound::Included(prefix.to_vec()),
        Bound::Included(v) => Bound::Included(with_prefix(v)),
        // Skips every entry of `v`, whatever key follows it.
        Bound::Excluded(v) => match after(with_prefix(v)) {
            Bound::Excluded(next) => Bound::Included(next),
            other => other,
        },
    };
    let upper = match &range.upper {
        Bound::Unbounded => after(prefix.to_vec()),
        Bound::Included(v) => after(with_prefix(v)),
        Bound::Excluded(v) => Bound::Excluded(with_prefix(v)),
    };
    (lower, upper)
}

fn is_empty_range(lo: &Bound<Vec<u8>>, hi: &Bound<Vec<u8>>) -> bool {
    match (lo, hi) {
        (Bound::Included(l), Bound::Included(h)) => l > h,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(h))
        | (Bound::Excluded(l), Bound::Included(h)) => l >= h,
        _ => false,
    }
}

fn as_slice(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
