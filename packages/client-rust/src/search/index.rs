//! Persistent search index of one table.
//!
//! Each live trie node is stored under its arena index in the table's
//! `search:<t>` area. The free list is stored as a pseudo-node under
//! [`FREE_LIST_NODE`]. An update writes only the nodes it touched, removes
//! the ones it freed, and rewrites the free list only when it changed.
//!
//! Updates ride on the row commit that caused them: the trie lock is taken
//! before the write transaction begins and held until it ends, so trie diffs
//! apply in commit order and the saved nodes land with the rows. A failed
//! commit reloads the trie from disk.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, WriteTransaction};
use replica_core::{Change, Key, Row, TableInfo};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::trie::{SearchNode, SearchTrie, TextChange, UpdateStats};
use crate::error::StoreError;
use crate::storage::table::{reset_area, stored_rows, Committed};
use crate::storage::{rows_area, search_area, SeqArea};

/// Node id under which the free list is persisted.
pub const FREE_LIST_NODE: u64 = u64::MAX;

/// Query mode of [`SearchIndex::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Prefix,
    Contains,
    Closest,
}

pub struct SearchIndex {
    table: String,
    field: String,
    db: Arc<Database>,
    area: Arc<str>,
    trie: Mutex<SearchTrie>,
}

impl SearchIndex {
    /// Loads the persisted trie of `info`'s search field. Returns `None` for
    /// tables without one.
    ///
    /// # Errors
    ///
    /// Storage failure. Undecodable nodes are skipped with a warning.
    pub async fn load(db: Arc<Database>, info: &TableInfo) -> Result<Option<Self>, StoreError> {
        let Some(field) = info.search_field.clone() else {
            return Ok(None);
        };
        let area: Arc<str> = search_area(&info.name).into();
        let table = info.name.clone();
        let trie = {
            let db = Arc::clone(&db);
            let area = Arc::clone(&area);
            let table = table.clone();
            tokio::task::spawn_blocking(move || read_trie(&db, &area, &table)).await??
        };
        debug!(table = %table, nodes = trie.node_count(), "search index loaded");
        Ok(Some(Self {
            table,
            field,
            db,
            area,
            trie: Mutex::new(trie),
        }))
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Reads the persisted trie of `table` from the database file at `path`
    /// without declaring a schema. A table without a search area yields an
    /// empty trie.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist or cannot be read.
    pub fn inspect(path: impl AsRef<Path>, table: &str) -> Result<SearchTrie, StoreError> {
        let db = Database::open(path.as_ref())?;
        read_trie(&db, &search_area(table), table)
    }

    /// Runs `op` in a write transaction and folds the changes it commits
    /// into the trie, saving the touched nodes in the same transaction.
    pub(crate) fn commit_with<F>(&self, db: &Database, op: F) -> Result<Committed, StoreError>
    where
        F: FnOnce(&WriteTransaction) -> Result<Committed, StoreError>,
    {
        let mut trie = self.trie.blocking_lock();
        let result = self.write_through(db, &mut trie, op);
        if let Err(e) = &result {
            warn!(table = %self.table, error = %e, "commit failed, reloading search index");
            match read_trie(db, &self.area, &self.table) {
                Ok(saved) => *trie = saved,
                Err(e) => warn!(table = %self.table, error = %e, "search index reload failed"),
            }
        }
        result
    }

    /// Replaces the index with one built from the stored rows.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn rebuild(self: &Arc<Self>) -> Result<(), StoreError> {
        let this = Arc::clone(self);
        let (rows, nodes) = tokio::task::spawn_blocking(move || {
            let mut trie = this.trie.blocking_lock();
            let txn = this.db.begin_write()?;
            let texts: Vec<TextChange> = stored_rows(&txn, &rows_area(&this.table))?
                .into_iter()
                .filter_map(|(key, row)| {
                    Some(TextChange {
                        key,
                        old: None,
                        new: Some(this.text_of(Some(&row))?),
                    })
                })
                .collect();
            let mut fresh = SearchTrie::new();
            fresh.update(&texts);
            save_all(&txn, &this.area, &fresh)?;
            txn.commit()?;
            *trie = fresh;
            Ok::<_, StoreError>((texts.len(), trie.node_count()))
        })
        .await??;
        info!(table = %self.table, rows, nodes, "search index rebuilt");
        Ok(())
    }

    pub async fn starts_with(&self, query: &str) -> BTreeSet<Key> {
        self.trie.lock().await.starts_with(query)
    }

    pub async fn contains_text(&self, query: &str) -> BTreeSet<Key> {
        self.trie.lock().await.contains_text(query)
    }

    pub async fn closest(&self, query: &str, limit: usize) -> Vec<Key> {
        self.trie.lock().await.closest(query, limit)
    }

    /// Keys matching `query` in `mode`, at most `limit` of them.
    pub async fn search(&self, query: &str, mode: SearchMode, limit: usize) -> Vec<Key> {
        let trie = self.trie.lock().await;
        match mode {
            SearchMode::Prefix => trie.starts_with(query).into_iter().take(limit).collect(),
            SearchMode::Contains => trie.contains_text(query).into_iter().take(limit).collect(),
            SearchMode::Closest => trie.closest(query, limit),
        }
    }

    pub async fn node_count(&self) -> usize {
        self.trie.lock().await.node_count()
    }

    // -- internals ---------------------------------------------------------

    fn text_of(&self, row: Option<&Row>) -> Option<String> {
        row?.get(&self.field)?.as_str().map(str::to_string)
    }

    fn text_changes(&self, changes: &[Change]) -> Vec<TextChange> {
        changes
            .iter()
            .filter_map(|change| {
                let old = self.text_of(change.old.as_ref());
                let new = self.text_of(change.new.as_ref());
                (old != new).then(|| TextChange {
                    key: change.key.clone(),
                    old,
                    new,
                })
            })
            .collect()
    }

    fn write_through<F>(&self, db: &Database, trie: &mut SearchTrie, op: F) -> Result<Committed, StoreError>
    where
        F: FnOnce(&WriteTransaction) -> Result<Committed, StoreError>,
    {
        let txn = db.begin_write()?;
        let committed = op(&txn)?;
        if committed.reset {
            *trie = SearchTrie::new();
            save_all(&txn, &self.area, trie)?;
        }
        let texts = self.text_changes(&committed.changes);
        if !texts.is_empty() {
            let stats = trie.update(&texts);
            save_touched(&txn, &self.area, trie, &stats)?;
            debug!(
                table = %self.table,
                rows = texts.len(),
                touched = stats.touched.len(),
                freed = stats.freed.len(),
                "search index updated"
            );
        }
        txn.commit()?;
        Ok(committed)
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex")
            .field("table", &self.table)
            .field("field", &self.field)
            .finish_non_exhaustive()
    }
}

fn save_touched(txn: &WriteTransaction, area: &str, trie: &SearchTrie, stats: &UpdateStats) -> Result<(), StoreError> {
    let mut nodes = txn.open_table(SeqArea::new(area))?;
    for &idx in &stats.freed {
        nodes.remove(u64::from(idx))?;
    }
    for &idx in &stats.touched {
        if let Some(node) = trie.node(idx) {
            nodes.insert(u64::from(idx), rmp_serde::to_vec_named(node)?.as_slice())?;
        }
    }
    if stats.free_list_changed {
        nodes.insert(FREE_LIST_NODE, rmp_serde::to_vec(trie.free_list())?.as_slice())?;
    }
    Ok(())
}

fn save_all(txn: &WriteTransaction, area: &str, trie: &SearchTrie) -> Result<(), StoreError> {
    reset_area::<u64, &[u8]>(txn, area)?;
    let mut nodes = txn.open_table(SeqArea::new(area))?;
    for idx in 0..trie.arena_len() {
        let idx = u32::try_from(idx).unwrap_or(u32::MAX);
        if let Some(node) = trie.node(idx) {
            nodes.insert(u64::from(idx), rmp_serde::to_vec_named(node)?.as_slice())?;
        }
    }
    nodes.insert(FREE_LIST_NODE, rmp_serde::to_vec(trie.free_list())?.as_slice())?;
    Ok(())
}

/// Reads a persisted trie. Used by [`SearchIndex::load`] and by the
/// inspection CLI, which opens the database read-only.
pub(crate) fn read_trie(db: &Database, area: &str, table: &str) -> Result<SearchTrie, StoreError> {
    let txn = db.begin_read()?;
    let nodes_t = match txn.open_table(SeqArea::new(area)) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(SearchTrie::new()),
        Err(e) => return Err(e.into()),
    };
    let mut nodes = Vec::new();
    let mut free = Vec::new();
    for entry in nodes_t.iter()? {
        let (k, v) = entry?;
        if k.value() == FREE_LIST_NODE {
            match rmp_serde::from_slice::<Vec<u32>>(v.value()) {
                Ok(list) => free = list,
                Err(e) => warn!(table = %table, error = %e, "discarding undecodable search free list"),
            }
            continue;
        }
        match rmp_serde::from_slice::<SearchNode>(v.value()) {
            Ok(node) => nodes.push(node),
            Err(e) => warn!(table = %table, node = k.value(), error = %e, "skipping undecodable search node"),
        }
    }
    Ok(SearchTrie::from_parts(nodes, free))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Commit, LocalStore, TableStore};

    fn notes() -> TableInfo {
        TableInfo::new("notes", "id").search("text")
    }

    fn note(id: i64, text: &str) -> Row {
        Row::new().with("id", id).with("text", text)
    }

    async fn open(path: &std::path::Path) -> (LocalStore, Arc<SearchIndex>, TableStore) {
        let store = LocalStore::open(path, &[notes()]).await.unwrap();
        let index = Arc::new(
            SearchIndex::load(Arc::clone(store.database()), &notes())
                .await
                .unwrap()
                .unwrap(),
        );
        let table = store.table("notes").unwrap().with_search(Arc::clone(&index));
        (store, index, table)
    }

    #[tokio::test]
    async fn tables_without_search_field_have_no_index() {
        let dir = tempfile::tempdir().unwrap();
        let info = TableInfo::new("plain", "id");
        let store = LocalStore::open(dir.path().join("db"), &[info.clone()]).await.unwrap();
        assert!(SearchIndex::load(Arc::clone(store.database()), &info).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commits_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let (_store, _index, table) = open(&path).await;
            table
                .write_many(vec![note(1, "database engine"), note(2, "blue whale")])
                .await
                .unwrap();
            table.write(note(2, "blue shark")).await.unwrap();
        }

        let (_store, index, _table) = open(&path).await;
        assert!(index.contains_text("base").await.contains(&Key::Int(1)));
        assert!(index.starts_with("whale").await.is_empty());
        assert!(index.starts_with("shark").await.contains(&Key::Int(2)));
    }

    #[tokio::test]
    async fn inspect_reads_a_closed_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let (_store, _index, table) = open(&path).await;
            table.write(note(3, "quiet harbor")).await.unwrap();
        }

        let trie = SearchIndex::inspect(&path, "notes").unwrap();
        assert!(trie.starts_with("harb").contains(&Key::Int(3)));
        assert!(SearchIndex::inspect(&path, "absent").unwrap().starts_with("q").is_empty());
    }

    #[tokio::test]
    async fn unchanged_text_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, index, table) = open(&dir.path().join("db")).await;
        table.write(note(1, "alpha")).await.unwrap();
        let nodes = index.node_count().await;

        table.write(note(1, "alpha").with("extra", 1)).await.unwrap();
        assert_eq!(index.node_count().await, nodes);

        table.delete(&Key::Int(1)).await.unwrap();
        assert!(index.starts_with("alpha").await.is_empty());
        assert_eq!(index.node_count().await, 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_index_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, index, table) = open(&dir.path().join("db")).await;
        table.write(note(1, "alpha")).await.unwrap();

        let err = table
            .commit(
                Commit::new()
                    .put(note(2, "beta"))
                    .put(Row::new().with("text", "gamma")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { .. }));
        assert!(index.starts_with("beta").await.is_empty());
        assert!(table.read(&Key::Int(2), None).await.unwrap().is_none());
        assert!(index.starts_with("alpha").await.contains(&Key::Int(1)));
    }

    #[tokio::test]
    async fn rebuild_reads_stored_rows_and_reset_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let (store, index, table) = open(&path).await;
        store
            .table("notes")
            .unwrap()
            .write_many(vec![note(1, "red fox"), note(2, "red panda")])
            .await
            .unwrap();
        assert!(index.starts_with("red").await.is_empty());

        index.rebuild().await.unwrap();
        assert_eq!(index.starts_with("red").await.len(), 2);
        assert_eq!(
            index.search("pan", SearchMode::Prefix, 10).await,
            vec![Key::Int(2)]
        );

        table.clear().await.unwrap();
        assert!(index.starts_with("red").await.is_empty());
        assert_eq!(index.node_count().await, 1);
        let saved = read_trie(store.database(), &search_area("notes"), "notes").unwrap();
        assert_eq!(saved.node_count(), 1);
    }
}
