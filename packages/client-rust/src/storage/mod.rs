//! Local persistent store: one redb database holding, per table, a row area,
//! a secondary-index area, a pending-mutation area and (for searchable
//! tables) a search-node area, plus one shared `meta` area.

pub mod database;
pub mod lock;
pub mod pending;
pub mod table;

use redb::TableDefinition;
use replica_core::Row;

pub use database::{LocalStore, StoreSummary, TableSummary};
pub use lock::NamedLocks;
pub use pending::PendingQueue;
pub use table::{Commit, Committed, IndexReader, TableStore};

use crate::error::StoreError;

/// Area keyed and valued by raw bytes (rows, index entries).
pub(crate) type BytesArea<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

/// Area keyed by a sequence number or node id.
pub(crate) type SeqArea<'a> = TableDefinition<'a, u64, &'static [u8]>;

pub(crate) const META: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("meta");

pub(crate) fn rows_area(table: &str) -> String {
    format!("rows:{table}")
}

pub(crate) fn index_area(table: &str) -> String {
    format!("index:{table}")
}

pub(crate) fn pending_area(table: &str) -> String {
    format!("pending:{table}")
}

pub(crate) fn search_area(table: &str) -> String {
    format!("search:{table}")
}

pub(crate) fn encode_row(row: &Row) -> Result<Vec<u8>, StoreError> {
    Ok(rmp_serde::to_vec_named(row)?)
}

pub(crate) fn decode_row(bytes: &[u8]) -> Result<Row, StoreError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
