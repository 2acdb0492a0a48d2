//! Opening, upgrading and inspecting the local store.
//!
//! The `meta` area records the schema version, the set of declared tables,
//! one fingerprint per table and the last-sync watermark. On open, every
//! declared table whose fingerprint changed has its index area rebuilt from
//! its rows and its search area cleared; areas of tables no longer declared
//! are dropped. Any such change bumps the schema version.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, WriteTransaction};
use replica_core::encoding::decode_key;
use replica_core::{TableInfo, Timestamp};
use serde::Serialize;
use tracing::info;

use super::table::{index_entries, reset_area};
use super::{
    decode_row, index_area, pending_area, rows_area, search_area, BytesArea, NamedLocks, PendingQueue,
    SeqArea, TableStore, META,
};
use crate::error::StoreError;

const SCHEMA_VERSION_KEY: &str = "schema_version";
const TABLES_KEY: &str = "tables";
const WATERMARK_KEY: &str = "last_sync";

fn fingerprint_key(table: &str) -> String {
    format!("fp:{table}")
}

/// Handle to the open local database and its per-table areas.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
    path: PathBuf,
    locks: Arc<NamedLocks>,
    tables: Arc<BTreeMap<String, Arc<TableInfo>>>,
    schema_version: u64,
    upgraded: Arc<BTreeSet<String>>,
}

impl LocalStore {
    /// Opens (creating if needed) the database at `path` and upgrades it to
    /// the declared tables.
    ///
    /// # Errors
    ///
    /// Storage failure while opening or upgrading.
    pub async fn open(path: impl AsRef<Path>, tables: &[TableInfo]) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let declared: Vec<Arc<TableInfo>> = tables.iter().cloned().map(Arc::new).collect();
        let (db, schema_version, upgraded) = {
            let path = path.clone();
            let declared = declared.clone();
            tokio::task::spawn_blocking(move || {
                let db = Database::create(&path)?;
                let (version, upgraded) = upgrade(&db, &declared)?;
                Ok::<_, StoreError>((db, version, upgraded))
            })
            .await??
        };
        if !upgraded.is_empty() {
            info!(path = %path.display(), schema_version, tables = ?upgraded, "local store upgraded");
        }
        Ok(Self {
            db: Arc::new(db),
            path,
            locks: Arc::new(NamedLocks::new()),
            tables: Arc::new(declared.into_iter().map(|t| (t.name.clone(), t)).collect()),
            schema_version,
            upgraded: Arc::new(upgraded),
        })
    }

    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    /// Tables whose areas were created or rebuilt by this open.
    #[must_use]
    pub fn upgraded_tables(&self) -> &BTreeSet<String> {
        &self.upgraded
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<NamedLocks> {
        &self.locks
    }

    /// Row and index access for a declared table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<TableStore> {
        let info = self.tables.get(name)?;
        Some(TableStore::new(Arc::clone(info), Arc::clone(&self.db), Arc::clone(&self.locks)))
    }

    /// Pending-mutation queue of a declared table.
    #[must_use]
    pub fn pending(&self, name: &str) -> Option<PendingQueue> {
        let info = self.tables.get(name)?;
        Some(PendingQueue::new(Arc::clone(info), Arc::clone(&self.db)))
    }

    /// Reads the persisted watermark, epoch when none was stored.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn load_watermark(&self) -> Result<Timestamp, StoreError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || read_watermark(&db)).await?
    }

    /// Persists the watermark.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub async fn store_watermark(&self, ts: Timestamp) -> Result<(), StoreError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write()?;
            {
                let mut meta = txn.open_table(META)?;
                meta.insert(WATERMARK_KEY, ts.as_millis().to_be_bytes().as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    /// Summarizes an existing store without upgrading it.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist or cannot be read.
    pub fn inspect(path: impl AsRef<Path>) -> Result<StoreSummary, StoreError> {
        let db = Database::open(path.as_ref())?;
        let txn = db.begin_read()?;
        let meta = txn.open_table(META)?;
        let schema_version = read_u64(&meta, SCHEMA_VERSION_KEY)?.unwrap_or(0);
        let names = read_table_names(&meta)?;
        drop(meta);

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let rows = count_entries(&txn.open_table(BytesArea::new(&rows_area(&name)))?)?;
            let pending = count_entries(&txn.open_table(SeqArea::new(&pending_area(&name)))?)?;
            let search_nodes = match txn.open_table(SeqArea::new(&search_area(&name))) {
                Ok(area) => Some(count_entries(&area)?),
                Err(redb::TableError::TableDoesNotExist(_)) => None,
                Err(e) => return Err(e.into()),
            };
            tables.push(TableSummary {
                name,
                rows,
                pending,
                search_nodes,
            });
        }
        Ok(StoreSummary {
            schema_version,
            watermark: read_watermark(&db)?,
            tables,
        })
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .field("schema_version", &self.schema_version)
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Overview of a local store, as printed by `replica inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub schema_version: u64,
    pub watermark: Timestamp,
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub rows: usize,
    pub pending: usize,
    /// `None` when the table has no search area.
    pub search_nodes: Option<usize>,
}

fn upgrade(db: &Database, declared: &[Arc<TableInfo>]) -> Result<(u64, BTreeSet<String>), StoreError> {
    let txn = db.begin_write()?;
    let (mut version, previous) = {
        let meta = txn.open_table(META)?;
        (read_u64(&meta, SCHEMA_VERSION_KEY)?.unwrap_or(0), read_table_names(&meta)?)
    };

    let mut upgraded = BTreeSet::new();
    let mut stale_fingerprints = Vec::new();
    for info in declared {
        let key = fingerprint_key(&info.name);
        let stored = {
            let meta = txn.open_table(META)?;
            let value = meta.get(key.as_str())?;
            value.and_then(|v| <[u8; 4]>::try_from(v.value()).ok().map(u32::from_be_bytes))
        };

        txn.open_table(BytesArea::new(&rows_area(&info.name)))?;
        txn.open_table(BytesArea::new(&index_area(&info.name)))?;
        txn.open_table(SeqArea::new(&pending_area(&info.name)))?;

        if stored == Some(info.fingerprint()) {
            continue;
        }
        rebuild_index(&txn, info)?;
        let search = search_area(&info.name);
        if info.search_field.is_some() {
            reset_area::<u64, &[u8]>(&txn, &search)?;
        } else {
            txn.delete_table(SeqArea::new(&search))?;
        }
        stale_fingerprints.push((key, info.fingerprint()));
        upgraded.insert(info.name.clone());
    }

    let declared_names: BTreeSet<String> = declared.iter().map(|t| t.name.clone()).collect();
    let dropped: Vec<String> = previous.difference(&declared_names).cloned().collect();
    for name in &dropped {
        txn.delete_table(BytesArea::new(&rows_area(name)))?;
        txn.delete_table(BytesArea::new(&index_area(name)))?;
        txn.delete_table(SeqArea::new(&pending_area(name)))?;
        txn.delete_table(SeqArea::new(&search_area(name)))?;
    }

    if !upgraded.is_empty() || !dropped.is_empty() {
        version += 1;
        let names = rmp_serde::to_vec(&declared_names.iter().collect::<Vec<_>>())?;
        let mut meta = txn.open_table(META)?;
        meta.insert(SCHEMA_VERSION_KEY, version.to_be_bytes().as_slice())?;
        meta.insert(TABLES_KEY, names.as_slice())?;
        for (key, fp) in &stale_fingerprints {
            meta.insert(key.as_str(), fp.to_be_bytes().as_slice())?;
        }
        for name in &dropped {
            meta.remove(fingerprint_key(name).as_str())?;
        }
    }
    txn.commit()?;
    Ok((version, upgraded))
}

/// Regenerates a table's index area from its rows.
fn rebuild_index(txn: &WriteTransaction, info: &TableInfo) -> Result<(), StoreError> {
    let index = index_area(&info.name);
    reset_area::<&[u8], &[u8]>(txn, &index)?;
    let rows_t = txn.open_table(BytesArea::new(&rows_area(&info.name)))?;
    let mut index_t = txn.open_table(BytesArea::new(&index))?;
    for entry in rows_t.iter()? {
        let (k, v) = entry?;
        let (Some(key), Ok(row)) = (decode_key(k.value()), decode_row(v.value())) else {
            continue;
        };
        for index_entry in index_entries(info, &key, &row) {
            index_t.insert(index_entry.as_slice(), k.value())?;
        }
    }
    Ok(())
}

fn read_watermark(db: &Database) -> Result<Timestamp, StoreError> {
    let txn = db.begin_read()?;
    let meta = match txn.open_table(META) {
        Ok(meta) => meta,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Timestamp::EPOCH),
        Err(e) => return Err(e.into()),
    };
    let millis = meta
        .get(WATERMARK_KEY)?
        .and_then(|v| <[u8; 8]>::try_from(v.value()).ok())
        .map(i64::from_be_bytes);
    Ok(millis.map_or(Timestamp::EPOCH, Timestamp::from_millis))
}

fn read_u64(meta: &impl ReadableTable<&'static str, &'static [u8]>, key: &str) -> Result<Option<u64>, StoreError> {
    Ok(meta
        .get(key)?
        .and_then(|v| <[u8; 8]>::try_from(v.value()).ok())
        .map(u64::from_be_bytes))
}

fn read_table_names(meta: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<BTreeSet<String>, StoreError> {
    match meta.get(TABLES_KEY)? {
        Some(bytes) => {
            let names: Vec<String> = rmp_serde::from_slice(bytes.value())?;
            Ok(names.into_iter().collect())
        }
        None => Ok(BTreeSet::new()),
    }
}

fn count_entries<K: redb::Key + 'static, V: redb::Value + 'static>(area: &impl ReadableTable<K, V>) -> Result<usize, StoreError> {
    let mut count = 0;
    for entry in area.iter()? {
        entry?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use replica_core::{Key, Row, Value};

    use super::*;

    fn tasks() -> TableInfo {
        TableInfo::new("tasks", "id").index("project_id")
    }

    #[tokio::test]
    async fn first_open_creates_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db"), &[tasks()]).await.unwrap();
        assert_eq!(store.schema_version(), 1);
        assert!(store.upgraded_tables().contains("tasks"));
    }

    #[tokio::test]
    async fn reopen_with_same_schema_keeps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        drop(LocalStore::open(&path, &[tasks()]).await.unwrap());
        let store = LocalStore::open(&path, &[tasks()]).await.unwrap();
        assert_eq!(store.schema_version(), 1);
        assert!(store.upgraded_tables().is_empty());
    }

    #[tokio::test]
    async fn new_index_bumps_version_and_rebuilds_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = LocalStore::open(&path, &[tasks()]).await.unwrap();
            let table = store.table("tasks").unwrap();
            table
                .write(Row::new().with("id", 1).with("project_id", 5).with("status", "open"))
                .await
                .unwrap();
        }

        let store = LocalStore::open(&path, &[tasks().index("status")]).await.unwrap();
        assert_eq!(store.schema_version(), 2);
        let table = store.table("tasks").unwrap();
        let keys = table
            .index("status")
            .unwrap()
            .keys_eq(&Value::from("open"), None)
            .await
            .unwrap();
        assert!(keys.contains(&Key::Int(1)));
    }

    #[tokio::test]
    async fn undeclared_tables_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        drop(
            LocalStore::open(&path, &[tasks(), TableInfo::new("projects", "id")])
                .await
                .unwrap(),
        );
        let store = LocalStore::open(&path, &[tasks()]).await.unwrap();
        assert_eq!(store.schema_version(), 2);
        assert!(store.table("projects").is_none());
        drop(store);

        let summary = LocalStore::inspect(&path).unwrap();
        assert_eq!(
            summary.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["tasks"]
        );
    }

    #[tokio::test]
    async fn watermark_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db"), &[tasks()]).await.unwrap();
        assert_eq!(store.load_watermark().await.unwrap(), Timestamp::EPOCH);

        store.store_watermark(Timestamp::from_millis(1_234)).await.unwrap();
        assert_eq!(store.load_watermark().await.unwrap(), Timestamp::from_millis(1_234));
    }

    #[tokio::test]
    async fn inspect_counts_rows_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = LocalStore::open(&path, &[tasks().search("title")]).await.unwrap();
            store
                .table("tasks")
                .unwrap()
                .write_many(vec![Row::new().with("id", 1), Row::new().with("id", 2)])
                .await
                .unwrap();
            store
                .pending("tasks")
                .unwrap()
                .enqueue(Row::new().with("id", 1))
                .await
                .unwrap();
        }

        let summary = LocalStore::inspect(&path).unwrap();
        assert_eq!(summary.schema_version, 1);
        let table = &summary.tables[0];
        assert_eq!((table.rows, table.pending, table.search_nodes), (2, 1, Some(0)));
    }
}
