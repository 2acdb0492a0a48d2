//! Capped exponential backoff and pending-mutation coalescing.

use std::collections::BTreeMap;
use std::time::Duration;

use replica_core::{Key, Row, TableInfo};

use crate::storage::pending::PendingMutation;

/// Exponential backoff: `min(initial * multiplier^(attempt - 1), max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based). Attempt 0 is treated
    /// as 1.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Mutations merged per primary key, ready for one bulk send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coalesced {
    /// One row per key, in key order. Derived values are stripped.
    pub rows: Vec<Row>,
    /// Every queue entry the rows were built from.
    pub seqs: Vec<u64>,
}

/// Merges queued mutations in sequence order; later fields overwrite
/// earlier ones for the same key. Entries without a key are dropped.
#[must_use]
pub fn coalesce(info: &TableInfo, mutations: &[PendingMutation]) -> Coalesced {
    let mut by_key: BTreeMap<Key, Row> = BTreeMap::new();
    let mut seqs = Vec::with_capacity(mutations.len());
    let mut ordered: Vec<&PendingMutation> = mutations.iter().collect();
    ordered.sort_by_key(|m| m.seq);
    for mutation in ordered {
        seqs.push(mutation.seq);
        let Some(key) = info.key_of(&mutation.row) else {
            continue;
        };
        by_key
            .entry(key)
            .and_modify(|row| row.merge(&mutation.row))
            .or_insert_with(|| mutation.row.clone());
    }
    Coalesced {
        rows: by_key.into_values().map(|row| row.without_calculated()).collect(),
        seqs,
    }
}

#[cfg(test)]
mod tests {
    use replica_core::{Value, CALCULATED_FIELD};

    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
        };
        let delays: Vec<Duration> = (1..=8).map(|n| policy.delay(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[7], Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
        assert_eq!(policy.delay(0), policy.delay(1));
    }

    #[test]
    fn coalesces_per_key_in_sequence_order() {
        let info = TableInfo::new("tasks", "id");
        let mutations = vec![
            PendingMutation {
                seq: 2,
                row: Row::new().with("id", 1).with("b", 2),
            },
            PendingMutation {
                seq: 1,
                row: Row::new().with("id", 1).with("a", 1).with("b", 1),
            },
            PendingMutation {
                seq: 3,
                row: Row::new().with("id", 2).with("a", 5),
            },
        ];
        let out = coalesce(&info, &mutations);
        assert_eq!(
            out.rows,
            vec![
                Row::new().with("id", 1).with("a", 1).with("b", 2),
                Row::new().with("id", 2).with("a", 5),
            ]
        );
        assert_eq!(out.seqs, vec![1, 2, 3]);
    }

    #[test]
    fn derived_values_are_not_sent() {
        let info = TableInfo::new("tasks", "id");
        let mut row = Row::new().with("id", 1);
        row.insert(CALCULATED_FIELD, Value::Map(Default::default()));
        let out = coalesce(&info, &[PendingMutation { seq: 1, row }]);
        assert_eq!(out.rows, vec![Row::new().with("id", 1)]);
    }
}
