//! Recomputation of calculated fields along the dependency graph.
//!
//! Calculated values live under each row's `_calculated` map. When rows of a
//! table change, its own rows are recomputed if their source fields moved,
//! then every dependent table recomputes the rows linked to the changed
//! keys. Recomputed rows are fed back into the queue, so changes fan out
//! transitively in graph order. Each recomputation runs under the dependent
//! table's lock.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use replica_core::{CalcInputs, Change, Key, Link, Row, TableInfo, Value, CALCULATED_FIELD};
use tracing::debug;

use super::graph::DependencyGraph;
use crate::error::StoreError;
use crate::storage::TableStore;

pub struct CalculatedFields {
    graph: Arc<DependencyGraph>,
    tables: BTreeMap<String, TableStore>,
    lock_timeout: Duration,
}

impl CalculatedFields {
    #[must_use]
    pub fn new(graph: Arc<DependencyGraph>, tables: BTreeMap<String, TableStore>, lock_timeout: Duration) -> Self {
        Self {
            graph,
            tables,
            lock_timeout,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Recomputes everything affected by `changes` to `table`. Returns the
    /// number of rows whose calculated values changed.
    ///
    /// # Errors
    ///
    /// Storage failure or a lock timeout on a dependent table.
    pub async fn propagate(&self, table: &str, changes: &[Change]) -> Result<usize, StoreError> {
        let mut queue: VecDeque<(String, Vec<Change>)> = VecDeque::new();
        queue.push_back((table.to_string(), changes.to_vec()));
        let mut recomputed = 0;

        while let Some((source, changes)) = queue.pop_front() {
            let Some(store) = self.tables.get(&source) else {
                continue;
            };

            if !store.info().calculated.is_empty() {
                let own: BTreeSet<Key> = changes
                    .iter()
                    .filter(|c| source_fields_moved(c))
                    .map(|c| c.key.clone())
                    .collect();
                let produced = self.recompute(store, &own).await?;
                recomputed += produced.len();
                if !produced.is_empty() {
                    queue.push_back((source.clone(), produced));
                }
            }

            for (dependent, keys) in self.affected(&source, &changes).await? {
                let Some(target) = self.tables.get(&dependent) else {
                    continue;
                };
                let produced = self.recompute(target, &keys).await?;
                recomputed += produced.len();
                if !produced.is_empty() {
                    queue.push_back((dependent, produced));
                }
            }
        }

        if recomputed > 0 {
            debug!(table = %table, recomputed, "calculated fields propagated");
        }
        Ok(recomputed)
    }

    /// Calculated values of `row` in table `info`.
    ///
    /// # Errors
    ///
    /// Storage failure while reading dependency rows.
    pub async fn compute(&self, info: &TableInfo, row: &Row) -> Result<BTreeMap<String, Value>, StoreError> {
        let mut values = BTreeMap::new();
        for (name, calc) in &info.calculated {
            let mut inputs = CalcInputs::new();
            for dep in &calc.dependencies {
                let Some(source) = self.tables.get(&dep.table) else {
                    continue;
                };
                let rows = match &dep.link {
                    Link::Forward { local_field } => match row.get(local_field).and_then(Key::from_value) {
                        Some(key) => source.read(&key, None).await?.into_iter().collect(),
                        None => Vec::new(),
                    },
                    Link::Reverse { remote_field } => match info.key_of(row) {
                        Some(key) => {
                            let keys: Vec<Key> = source
                                .index(remote_field)?
                                .keys_eq(&Value::from(key), None)
                                .await?
                                .into_iter()
                                .collect();
                            source.read_many(&keys, None).await?.into_iter().flatten().collect()
                        }
                        None => Vec::new(),
                    },
                };
                inputs.insert(dep.table.clone(), rows);
            }
            values.insert(name.clone(), calc.compute(row, &inputs));
        }
        Ok(values)
    }

    /// Dependent tables and the keys of their rows linked to `changes`.
    async fn affected(&self, source: &str, changes: &[Change]) -> Result<BTreeMap<String, BTreeSet<Key>>, StoreError> {
        let mut out: BTreeMap<String, BTreeSet<Key>> = BTreeMap::new();
        for edge in self.graph.dependents_of(source) {
            let Some(dependent) = self.tables.get(&edge.table) else {
                continue;
            };
            for change in changes {
                if !edge.dependency.is_affected_by(change.old.as_ref(), change.new.as_ref()) {
                    continue;
                }
                let keys = out.entry(edge.table.clone()).or_default();
                match &edge.dependency.link {
                    Link::Forward { local_field } => {
                        let linked = dependent
                            .index(local_field)?
                            .keys_eq(&Value::from(change.key.clone()), None)
                            .await?;
                        keys.extend(linked);
                    }
                    Link::Reverse { remote_field } => {
                        for row in change.old.iter().chain(change.new.iter()) {
                            keys.extend(row.get(remote_field).and_then(Key::from_value));
                        }
                    }
                }
            }
        }
        out.retain(|_, keys| !keys.is_empty());
        Ok(out)
    }

    /// Rewrites the `_calculated` map of each row in `keys` that needs it,
    /// under the table's lock. Returns the resulting changes.
    async fn recompute(&self, store: &TableStore, keys: &BTreeSet<Key>) -> Result<Vec<Change>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<Key> = keys.iter().cloned().collect();
        store
            .lock(self.lock_timeout, async {
                let rows = store.read_many(&keys, None).await?;
                let mut updated = Vec::new();
                for row in rows.into_iter().flatten() {
                    let values = self.compute(store.info(), &row).await?;
                    if row.calculated() == Some(&values) {
                        continue;
                    }
                    let mut next = row;
                    next.insert(CALCULATED_FIELD, Value::Map(values));
                    updated.push(next);
                }
                store.write_many(updated).await
            })
            .await?
    }
}

impl std::fmt::Debug for CalculatedFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculatedFields")
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

/// Returns `true` unless the change only touched derived values.
fn source_fields_moved(change: &Change) -> bool {
    match (&change.old, &change.new) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(old), Some(new)) => old.without_calculated() != new.without_calculated(),
    }
}
