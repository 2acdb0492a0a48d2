//! Error types for the local store, table schemas and the sync engine.

use replica_core::ConditionError;

/// Failures of the local persistent store.
///
/// These indicate an unrecoverable storage problem and are propagated to the
/// immediate caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("failed to encode row: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode row: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("field `{field}` of table `{table}` is not declared indexed")]
    NotIndexed { table: String, field: String },

    #[error("row of table `{table}` has no usable primary key")]
    MissingKey { table: String },

    #[error("read of table `{table}` was cancelled")]
    Aborted { table: String },

    #[error("lock `{name}` not released within {timeout_ms} ms")]
    LockTimeout { name: String, timeout_ms: u64 },

    #[error("unknown store area `{0}`")]
    UnknownArea(String),

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Misconfigured table declarations, reported at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table `{table}` is declared twice")]
    DuplicateTable { table: String },

    #[error("calculated field `{table}.{field}` depends on unknown table `{dependency}`")]
    UnknownDependency {
        table: String,
        field: String,
        dependency: String,
    },

    #[error("calculated field `{table}.{field}` links through `{link_table}.{link_field}`, which is not indexed")]
    UnindexedLink {
        table: String,
        field: String,
        link_table: String,
        link_field: String,
    },

    #[error("calculated fields form a cycle through tables {tables:?}")]
    Cycle { tables: Vec<String> },
}

/// Errors surfaced by the sync engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("remote call failed: {0:#}")]
    Remote(anyhow::Error),

    #[error("row of table `{table}` has no usable primary key")]
    MissingKey { table: String },

    #[error("unknown table `{0}`")]
    UnknownTable(String),

    #[error("table `{0}` declares no search field")]
    NoSearchField(String),

    #[error("sync engine is closed")]
    Closed,
}

impl SyncError {
    /// Returns `true` if a table lock was not released in time.
    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, SyncError::Store(StoreError::LockTimeout { .. }))
    }

    /// Returns `true` for failures worth retrying later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_distinguishable() {
        let err = SyncError::from(StoreError::LockTimeout {
            name: "tasks".to_string(),
            timeout_ms: 10,
        });
        assert!(err.is_lock_timeout());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("tasks"));
    }

    #[test]
    fn remote_failures_are_transient() {
        let err = SyncError::Remote(anyhow::anyhow!("connection refused"));
        assert!(err.is_transient());
        assert!(!err.is_lock_timeout());
    }

    #[test]
    fn not_indexed_names_table_and_field() {
        let err = StoreError::NotIndexed {
            table: "tasks".to_string(),
            field: "title".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "field `title` of table `tasks` is not declared indexed"
        );
    }
}
