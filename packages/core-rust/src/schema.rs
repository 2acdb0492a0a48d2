//! Static per-table descriptors.
//!
//! A [`TableInfo`] names a table's primary key, the fields with secondary
//! indexes, the soft-delete flag, whether writes may be optimistic, the text
//! field feeding the search index, and the calculated fields derived from
//! rows of other tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::encoding::ENCODING_VERSION;
use crate::hash::fnv1a_parts;
use crate::types::{Key, Row, Value};

/// Default name of the remote modification timestamp column.
pub const DEFAULT_UPDATED_AT: &str = "updated_at";

/// Static descriptor of one synchronized table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Table name, shared with the remote and the change stream.
    pub name: String,
    /// Primary-key field. Always indexed.
    pub primary_key: String,
    /// Fields with a secondary index.
    pub indexes: BTreeSet<String>,
    /// Boolean flag marking a row as soft-deleted, for soft-deletable tables.
    pub soft_delete: Option<String>,
    /// Inserts are applied locally first and queued for the remote.
    pub optimistic_insert: bool,
    /// Updates are applied locally first and queued for the remote.
    pub optimistic_update: bool,
    /// Text field indexed by the search trie.
    pub search_field: Option<String>,
    /// Remote modification timestamp column used by catch-up.
    pub updated_at: String,
    /// Calculated field name to its declaration.
    pub calculated: BTreeMap<String, CalculatedField>,
}

impl TableInfo {
    /// Creates a descriptor with optimistic writes and no secondary indexes.
    #[must_use]
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let primary_key = primary_key.into();
        let mut indexes = BTreeSet::new();
        indexes.insert(primary_key.clone());
        Self {
            name: name.into(),
            primary_key,
            indexes,
            soft_delete: None,
            optimistic_insert: true,
            optimistic_update: true,
            search_field: None,
            updated_at: DEFAULT_UPDATED_AT.to_string(),
            calculated: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.insert(field.into());
        self
    }

    /// Marks the table soft-deletable through a boolean `field`.
    #[must_use]
    pub fn soft_delete(mut self, field: impl Into<String>) -> Self {
        self.soft_delete = Some(field.into());
        self
    }

    /// Requires inserts and updates to round-trip before touching the replica.
    #[must_use]
    pub fn synchronous(mut self) -> Self {
        self.optimistic_insert = false;
        self.optimistic_update = false;
        self
    }

    #[must_use]
    pub fn optimistic(mut self, insert: bool, update: bool) -> Self {
        self.optimistic_insert = insert;
        self.optimistic_update = update;
        self
    }

    #[must_use]
    pub fn search(mut self, field: impl Into<String>) -> Self {
        self.search_field = Some(field.into());
        self
    }

    #[must_use]
    pub fn updated_at(mut self, field: impl Into<String>) -> Self {
        self.updated_at = field.into();
        self
    }

    #[must_use]
    pub fn calculated(mut self, name: impl Into<String>, field: CalculatedField) -> Self {
        self.calculated.insert(name.into(), field);
        self
    }

    /// Primary key of `row`, if the key field holds an integer or string.
    #[must_use]
    pub fn key_of(&self, row: &Row) -> Option<Key> {
        row.get(&self.primary_key).and_then(Key::from_value)
    }

    #[must_use]
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexes.contains(field)
    }

    /// Returns `true` if the row carries a true soft-delete flag.
    #[must_use]
    pub fn is_deleted(&self, row: &Row) -> bool {
        self.soft_delete
            .as_deref()
            .and_then(|flag| row.get(flag))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Fingerprint of everything that shapes this table's local areas.
    ///
    /// A changed fingerprint forces an index rebuild and a search reset.
    #[must_use]
    pub fn fingerprint(&self) -> u32 {
        let search = self.search_field.as_deref().unwrap_or("");
        let head = [ENCODING_VERSION, self.name.as_str(), self.primary_key.as_str(), search];
        fnv1a_parts(
            head.into_iter()
                .chain(std::iter::once("|"))
                .chain(self.indexes.iter().map(String::as_str)),
        )
    }
}

/// Values of dependency rows handed to a calculated field's computation.
#[derive(Debug, Clone, Default)]
pub struct CalcInputs {
    rows: BTreeMap<String, Vec<Row>>,
}

impl CalcInputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: impl Into<String>, rows: Vec<Row>) {
        self.rows.insert(table.into(), rows);
    }

    /// All linked rows of `table` (empty when none are linked).
    #[must_use]
    pub fn rows(&self, table: &str) -> &[Row] {
        self.rows.get(table).map_or(&[], Vec::as_slice)
    }

    /// The first linked row of `table`, for forward links.
    #[must_use]
    pub fn one(&self, table: &str) -> Option<&Row> {
        self.rows(table).first()
    }
}

/// How rows of a dependency table relate to the row being computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// This row's `local_field` holds the primary key of the dependency row.
    Forward { local_field: String },
    /// Dependency rows whose `remote_field` holds this row's primary key.
    Reverse { remote_field: String },
}

/// One table a calculated field reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub table: String,
    /// Dependency fields the computation reads. A change to any of them, or
    /// to the link field, triggers recomputation.
    pub fields: Vec<String>,
    pub link: Link,
}

impl Dependency {
    #[must_use]
    pub fn forward(table: impl Into<String>, local_field: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            table: table.into(),
            fields: fields.iter().map(ToString::to_string).collect(),
            link: Link::Forward {
                local_field: local_field.into(),
            },
        }
    }

    #[must_use]
    pub fn reverse(table: impl Into<String>, remote_field: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            table: table.into(),
            fields: fields.iter().map(ToString::to_string).collect(),
            link: Link::Reverse {
                remote_field: remote_field.into(),
            },
        }
    }

    /// Returns `true` if going from `old` to `new` touches anything this
    /// dependency reads.
    #[must_use]
    pub fn is_affected_by(&self, old: Option<&Row>, new: Option<&Row>) -> bool {
        let (Some(old), Some(new)) = (old, new) else {
            return true;
        };
        let link_field = match &self.link {
            Link::Reverse { remote_field } => Some(remote_field.as_str()),
            Link::Forward { .. } => None,
        };
        self.fields
            .iter()
            .map(String::as_str)
            .chain(link_field)
            .any(|field| old.get(field) != new.get(field))
    }
}

type ComputeFn = dyn Fn(&Row, &CalcInputs) -> Value + Send + Sync;

/// A derived value stored under the row's `_calculated` map.
#[derive(Clone)]
pub struct CalculatedField {
    pub dependencies: Vec<Dependency>,
    compute: Arc<ComputeFn>,
}

impl CalculatedField {
    pub fn new<F>(dependencies: Vec<Dependency>, compute: F) -> Self
    where
        F: Fn(&Row, &CalcInputs) -> Value + Send + Sync + 'static,
    {
        Self {
            dependencies,
            compute: Arc::new(compute),
        }
    }

    #[must_use]
    pub fn compute(&self, row: &Row, inputs: &CalcInputs) -> Value {
        (self.compute)(row, inputs)
    }
}

impl fmt::Debug for CalculatedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatedField")
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}
