//! Field conditions shared by index lookups and in-memory row predicates.
//!
//! A [`FieldCondition`] resolves its [`Condition`] into a list of
//! [`IndexRange`]s over encoded values exactly once. The local query engine
//! scans those ranges in the field's index, and [`FieldCondition::matches`]
//! tests a row's encoded value against the same ranges, so a live query's
//! incremental filter and its initial index scan always agree.

use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::encoding::encode_value;
use crate::types::{Row, Value};

/// A condition on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op", content = "value")]
pub enum Condition {
    /// Field equals the value.
    Eq(Value),
    /// Field has an indexable value different from this one.
    Not(Value),
    /// Field equals any of the values.
    In(Vec<Value>),
    /// Field is strictly greater than the value.
    Gt(Value),
    /// Field is strictly less than the value.
    Lt(Value),
}

/// Errors raised while building a condition.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConditionError {
    #[error("condition on field `{field}` uses a value that cannot be indexed: {value:?}")]
    Unindexable { field: String, value: Value },
}

/// A range of encoded values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl IndexRange {
    /// Range holding exactly one encoded value.
    #[must_use]
    pub fn point(encoded: Vec<u8>) -> Self {
        Self {
            lower: Bound::Included(encoded.clone()),
            upper: Bound::Included(encoded),
        }
    }

    /// Returns `true` if the encoded value lies inside the range.
    #[must_use]
    pub fn contains_encoded(&self, encoded: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => encoded >= lo.as_slice(),
            Bound::Excluded(lo) => encoded > lo.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => encoded <= hi.as_slice(),
            Bound::Excluded(hi) => encoded < hi.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }
}

/// A condition bound to a field, with its index ranges precomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    field: String,
    condition: Condition,
    ranges: Vec<IndexRange>,
}

impl FieldCondition {
    /// Resolves `condition` into index ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::Unindexable`] if any operand has no index
    /// encoding (null, NaN, arrays, maps).
    pub fn new(field: impl Into<String>, condition: Condition) -> Result<Self, ConditionError> {
        let field = field.into();
        let encode = |value: &Value| {
            encode_value(value).ok_or_else(|| ConditionError::Unindexable {
                field: field.clone(),
                value: value.clone(),
            })
        };
        let ranges = match &condition {
            Condition::Eq(v) => vec![IndexRange::point(encode(v)?)],
            Condition::Not(v) => {
                let e = encode(v)?;
                vec![
                    IndexRange {
                        lower: Bound::Unbounded,
                        upper: Bound::Excluded(e.clone()),
                    },
                    IndexRange {
                        lower: Bound::Excluded(e),
                        upper: Bound::Unbounded,
                    },
                ]
            }
            Condition::In(values) => {
                let mut encoded = values.iter().map(&encode).collect::<Result<Vec<_>, _>>()?;
                encoded.sort();
                encoded.dedup();
                encoded.into_iter().map(IndexRange::point).collect()
            }
            Condition::Gt(v) => vec![IndexRange {
                lower: Bound::Excluded(encode(v)?),
                upper: Bound::Unbounded,
            }],
            Condition::Lt(v) => vec![IndexRange {
                lower: Bound::Unbounded,
                upper: Bound::Excluded(encode(v)?),
            }],
        };
        Ok(Self {
            field,
            condition,
            ranges,
        })
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Disjoint ranges whose union is the condition's match set.
    #[must_use]
    pub fn ranges(&self) -> &[IndexRange] {
        &self.ranges
    }

    /// In-memory predicate over the same ranges the index scan uses.
    ///
    /// A row whose field is absent or unindexable never matches.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        let Some(encoded) = row.get(&self.field).and_then(encode_value) else {
            return false;
        };
        self.ranges.iter().any(|r| r.contains_encoded(&encoded))
    }
}

/// A conjunction of field conditions. An empty filter matches every row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    conditions: Vec<FieldCondition>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition.
    ///
    /// # Errors
    ///
    /// See [`FieldCondition::new`].
    pub fn and(mut self, field: impl Into<String>, condition: Condition) -> Result<Self, ConditionError> {
        self.conditions.push(FieldCondition::new(field, condition)?);
        Ok(self)
    }

    pub fn push(&mut self, condition: FieldCondition) {
        self.conditions.push(condition);
    }

    #[must_use]
    pub fn conditions(&self) -> &[FieldCondition] {
        &self.conditions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}
