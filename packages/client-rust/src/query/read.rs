//! Index-backed evaluation of a [`Filter`].
//!
//! Each condition is resolved on its own against its field's index. A single
//! condition's key set is used as is; several are intersected. An empty
//! filter reads every key.

use std::collections::BTreeSet;

use replica_core::{Change, Filter, Key, Row};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::storage::TableStore;

/// Keys of rows matching `filter`, in key order.
///
/// # Errors
///
/// [`StoreError::NotIndexed`] if a condition's field has no index;
/// [`StoreError::Aborted`] when `cancel` fires.
pub async fn resolve_keys(store: &TableStore, filter: &Filter, cancel: Option<&CancellationToken>) -> Result<Vec<Key>, StoreError> {
    let conditions = filter.conditions();
    if conditions.is_empty() {
        return store.read_all_keys(cancel).await;
    }

    // Validate every field up front so a bad query fails the same way
    // whatever the first condition matches.
    let indexes = conditions
        .iter()
        .map(|c| store.index(c.field()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut result: Option<BTreeSet<Key>> = None;
    for (condition, index) in conditions.iter().zip(&indexes) {
        let keys = index.keys_in(condition.ranges(), cancel).await?;
        let narrowed = match result {
            Some(acc) => acc.intersection(&keys).cloned().collect(),
            None => keys,
        };
        if narrowed.is_empty() {
            return Ok(Vec::new());
        }
        result = Some(narrowed);
    }
    Ok(result.unwrap_or_default().into_iter().collect())
}

/// Rows matching `filter`, in key order.
///
/// # Errors
///
/// See [`resolve_keys`].
pub async fn read_rows(store: &TableStore, filter: &Filter, cancel: Option<&CancellationToken>) -> Result<Vec<Row>, StoreError> {
    if filter.is_empty() {
        return store.read_all(cancel).await;
    }
    let keys = resolve_keys(store, filter, cancel).await?;
    Ok(store.read_many(&keys, cancel).await?.into_iter().flatten().collect())
}

/// Incremental result change of a live query.
///
/// The first update of a subscription carries the full current result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryUpdate {
    /// Rows entering or updated within the result.
    pub result: Vec<Row>,
    /// Keys leaving the result.
    pub deletions: Vec<Key>,
}

impl QueryUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.result.is_empty() && self.deletions.is_empty()
    }
}

/// Re-evaluates one committed change against `filter` without touching the
/// store. Returns `None` when the result is unaffected.
#[must_use]
pub fn evaluate(filter: &Filter, change: &Change) -> Option<QueryUpdate> {
    if let Some(new) = change.new.as_ref().filter(|row| filter.matches(row)) {
        return Some(QueryUpdate {
            result: vec![new.clone()],
            deletions: Vec::new(),
        });
    }
    change
        .old
        .as_ref()
        .filter(|row| filter.matches(row))
        .map(|_| QueryUpdate {
            result: Vec::new(),
            deletions: vec![change.key.clone()],
        })
}

#[cfg(test)]
mod tests {
    use replica_core::{Condition, TableInfo, Value};

    use super::*;
    use crate::storage::LocalStore;

    async fn seeded() -> (tempfile::TempDir, TableStore) {
        let dir = tempfile::tempdir().unwrap();
        let info = TableInfo::new("tasks", "id").index("project_id").index("status");
        let store = LocalStore::open(dir.path().join("q.redb"), &[info]).await.unwrap();
        let table = store.table("tasks").unwrap();
        table
            .write_many(vec![
                Row::new().with("id", 1).with("project_id", 1).with("status", "open"),
                Row::new().with("id", 2).with("project_id", 1).with("status", "done"),
                Row::new().with("id", 3).with("project_id", 2).with("status", "open"),
                Row::new().with("id", 4).with("status", "open"),
            ])
            .await
            .unwrap();
        (dir, table)
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter()
            .filter_map(|r| match r.get("id") {
                Some(Value::Int(i)) => Some(*i),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn conditions_intersect() {
        let (_dir, table) = seeded().await;
        let filter = Filter::new()
            .and("project_id", Condition::Eq(Value::Int(1)))
            .unwrap()
            .and("status", Condition::Eq(Value::from("open")))
            .unwrap();
        let rows = read_rows(&table, &filter, None).await.unwrap();
        assert_eq!(ids(&rows), vec![1]);
    }

    #[tokio::test]
    async fn in_unions_its_values() {
        let (_dir, table) = seeded().await;
        let filter = Filter::new()
            .and("project_id", Condition::In(vec![Value::Int(1), Value::Int(2)]))
            .unwrap();
        let keys = resolve_keys(&table, &filter, None).await.unwrap();
        assert_eq!(keys, vec![Key::Int(1), Key::Int(2), Key::Int(3)]);
    }

    #[tokio::test]
    async fn not_skips_rows_without_the_field() {
        let (_dir, table) = seeded().await;
        let filter = Filter::new().and("project_id", Condition::Not(Value::Int(2))).unwrap();
        let rows = read_rows(&table, &filter, None).await.unwrap();
        assert_eq!(ids(&rows), vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_filter_reads_everything() {
        let (_dir, table) = seeded().await;
        assert_eq!(read_rows(&table, &Filter::new(), None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn unindexed_field_fails_loudly() {
        let (_dir, table) = seeded().await;
        let filter = Filter::new().and("title", Condition::Eq(Value::from("x"))).unwrap();
        let err = resolve_keys(&table, &filter, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotIndexed { .. }));
    }

    #[tokio::test]
    async fn predicate_agrees_with_index_scan() {
        let (_dir, table) = seeded().await;
        let filters = [
            Filter::new().and("project_id", Condition::Gt(Value::Int(1))).unwrap(),
            Filter::new().and("project_id", Condition::Lt(Value::Float(1.5))).unwrap(),
            Filter::new().and("status", Condition::Not(Value::from("open"))).unwrap(),
        ];
        let all = table.read_all(None).await.unwrap();
        for filter in &filters {
            let scanned = read_rows(&table, filter, None).await.unwrap();
            let predicated: Vec<Row> = all.iter().filter(|r| filter.matches(r)).cloned().collect();
            assert_eq!(scanned, predicated);
        }
    }

    #[test]
    fn evaluate_classifies_changes() {
        let filter = Filter::new().and("status", Condition::Eq(Value::from("open"))).unwrap();
        let open = Row::new().with("id", 1).with("status", "open");
        let done = Row::new().with("id", 1).with("status", "done");

        let entering = Change {
            key: Key::Int(1),
            old: Some(done.clone()),
            new: Some(open.clone()),
        };
        assert_eq!(evaluate(&filter, &entering).unwrap().result, vec![open.clone()]);

        let leaving = Change {
            key: Key::Int(1),
            old: Some(open.clone()),
            new: Some(done.clone()),
        };
        assert_eq!(evaluate(&filter, &leaving).unwrap().deletions, vec![Key::Int(1)]);

        let deleted = Change {
            key: Key::Int(1),
            old: Some(open),
            new: None,
        };
        assert_eq!(evaluate(&filter, &deleted).unwrap().deletions, vec![Key::Int(1)]);

        let outside = Change {
            key: Key::Int(1),
            old: None,
            new: Some(done),
        };
        assert!(evaluate(&filter, &outside).is_none());
    }
}
