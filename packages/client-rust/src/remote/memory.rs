//! In-process remote source of truth.
//!
//! Every table keeps its rows in a `BTreeMap`, stamps the modification
//! column on each write and, when a [`MemoryChannel`] is attached,
//! broadcasts the matching change event the way a database replication
//! stream would. `select` evaluates the same [`Filter`] predicate the local
//! query engine uses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use replica_core::{ChangeEvent, ClockSource, Filter, Key, Row, TableInfo, Timestamp, Value};

use crate::network::MemoryChannel;
use crate::traits::{RemoteSource, RemoteTable};

/// Calls received by one [`MemoryTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub select: usize,
    pub insert: usize,
    pub update: usize,
    pub upsert: usize,
    pub delete: usize,
}

pub struct MemoryRemote {
    tables: DashMap<String, Arc<MemoryTable>>,
    clock: Arc<dyn ClockSource>,
    channel: Option<Arc<MemoryChannel>>,
}

impl MemoryRemote {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            tables: DashMap::new(),
            clock,
            channel: None,
        }
    }

    /// Broadcasts every write on `channel`.
    #[must_use]
    pub fn with_channel(mut self, channel: Arc<MemoryChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// The table for `info`, created empty on first use.
    pub fn register(&self, info: &TableInfo) -> Arc<MemoryTable> {
        Arc::clone(
            self.tables
                .entry(info.name.clone())
                .or_insert_with(|| {
                    Arc::new(MemoryTable {
                        name: info.name.clone(),
                        primary_key: info.primary_key.clone(),
                        updated_at: info.updated_at.clone(),
                        rows: Mutex::new(BTreeMap::new()),
                        clock: Arc::clone(&self.clock),
                        channel: self.channel.clone(),
                        down: AtomicBool::new(false),
                        failing_calls: AtomicUsize::new(0),
                        calls: Mutex::new(CallCounts::default()),
                        upserts: Mutex::new(Vec::new()),
                    })
                })
                .value(),
        )
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<Arc<MemoryTable>> {
        self.tables.get(table).map(|t| Arc::clone(t.value()))
    }
}

impl RemoteSource for MemoryRemote {
    fn table(&self, info: &TableInfo) -> Arc<dyn RemoteTable> {
        self.register(info)
    }
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("tables", &self.tables.len())
            .finish_non_exhaustive()
    }
}

pub struct MemoryTable {
    name: String,
    primary_key: String,
    updated_at: String,
    rows: Mutex<BTreeMap<Key, Row>>,
    clock: Arc<dyn ClockSource>,
    channel: Option<Arc<MemoryChannel>>,
    down: AtomicBool,
    failing_calls: AtomicUsize,
    calls: Mutex<CallCounts>,
    upserts: Mutex<Vec<Vec<Row>>>,
}

impl MemoryTable {
    /// Stores rows directly, stamped with the current time, without
    /// broadcasting.
    pub fn seed(&self, rows: impl IntoIterator<Item = Row>) {
        let now = self.clock.now();
        let mut stored = self.rows.lock();
        for row in rows {
            if let Some(key) = self.key_of(&row) {
                stored.insert(key, self.stamp(row, now));
            }
        }
    }

    /// Makes every call fail until set back to `false`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next(&self, count: usize) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn row(&self, key: &Key) -> Option<Row> {
        self.rows.lock().get(key).cloned()
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        *self.calls.lock()
    }

    /// Payloads of every upsert call, in call order.
    #[must_use]
    pub fn upserts(&self) -> Vec<Vec<Row>> {
        self.upserts.lock().clone()
    }

    fn key_of(&self, row: &Row) -> Option<Key> {
        row.get(&self.primary_key).and_then(Key::from_value)
    }

    fn stamp(&self, mut row: Row, at: Timestamp) -> Row {
        row.insert(self.updated_at.clone(), at.to_value());
        row
    }

    fn check(&self, record: impl FnOnce(&mut CallCounts)) -> anyhow::Result<()> {
        record(&mut self.calls.lock());
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("remote table `{}` is unreachable", self.name);
        }
        let failing = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            anyhow::bail!("remote table `{}` rejected the call", self.name);
        }
        Ok(())
    }

    fn next_id(rows: &BTreeMap<Key, Row>) -> Key {
        let max = rows
            .keys()
            .filter_map(|k| match k {
                Key::Int(i) => Some(*i),
                Key::Str(_) => None,
            })
            .max()
            .unwrap_or(0);
        Key::Int(max + 1)
    }

    /// Merges `row` into the stored row with the same key, inserting when
    /// absent. Returns the stored row and the event to broadcast.
    fn merge_in(&self, stored: &mut BTreeMap<Key, Row>, key: Key, row: Row, at: Timestamp) -> (Row, ChangeEvent) {
        let (merged, existed) = match stored.get(&key) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.merge(&row);
                (merged, true)
            }
            None => (row, false),
        };
        let merged = self.stamp(merged, at);
        stored.insert(key, merged.clone());
        let event = if existed {
            ChangeEvent::update(self.name.clone(), at, merged.clone())
        } else {
            ChangeEvent::insert(self.name.clone(), at, merged.clone())
        };
        (merged, event)
    }

    async fn broadcast(&self, events: Vec<ChangeEvent>) {
        if let Some(channel) = &self.channel {
            for event in events {
                channel.publish(event).await;
            }
        }
    }
}

#[async_trait]
impl RemoteTable for MemoryTable {
    async fn select(&self, filter: &Filter) -> anyhow::Result<Vec<Row>> {
        self.check(|c| c.select += 1)?;
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn insert(&self, rows: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        self.check(|c| c.insert += 1)?;
        let now = self.clock.now();
        let (out, events) = {
            let mut stored = self.rows.lock();
            let mut out = Vec::with_capacity(rows.len());
            let mut events = Vec::with_capacity(rows.len());
            for mut row in rows {
                let key = match self.key_of(&row) {
                    Some(key) => key,
                    None => {
                        let key = Self::next_id(&stored);
                        row.insert(self.primary_key.clone(), Value::from(key.clone()));
                        key
                    }
                };
                if stored.contains_key(&key) {
                    anyhow::bail!("duplicate key {key} in `{}`", self.name);
                }
                let (row, event) = self.merge_in(&mut stored, key, row, now);
                out.push(row);
                events.push(event);
            }
            (out, events)
        };
        self.broadcast(events).await;
        Ok(out)
    }

    async fn update(&self, row: Row, key: &Key) -> anyhow::Result<Row> {
        self.check(|c| c.update += 1)?;
        let now = self.clock.now();
        let (merged, event) = {
            let mut stored = self.rows.lock();
            if !stored.contains_key(key) {
                anyhow::bail!("no row {key} in `{}`", self.name);
            }
            self.merge_in(&mut stored, key.clone(), row, now)
        };
        self.broadcast(vec![event]).await;
        Ok(merged)
    }

    async fn upsert(&self, rows: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        self.check(|c| c.upsert += 1)?;
        self.upserts.lock().push(rows.clone());
        let now = self.clock.now();
        let (out, events) = {
            let mut stored = self.rows.lock();
            let mut out = Vec::with_capacity(rows.len());
            let mut events = Vec::with_capacity(rows.len());
            for row in rows {
                let Some(key) = self.key_of(&row) else {
                    anyhow::bail!("upsert into `{}` without primary key", self.name);
                };
                let (row, event) = self.merge_in(&mut stored, key, row, now);
                out.push(row);
                events.push(event);
            }
            (out, events)
        };
        self.broadcast(events).await;
        Ok(out)
    }

    async fn delete(&self, key: &Key) -> anyhow::Result<()> {
        self.check(|c| c.delete += 1)?;
        let now = self.clock.now();
        let removed = self.rows.lock().remove(key);
        if let Some(old) = removed {
            self.broadcast(vec![ChangeEvent::delete(self.name.clone(), now, old)]).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTable")
            .field("name", &self.name)
            .field("rows", &self.rows.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use replica_core::{Condition, EventType, ManualClock};

    use super::*;
    use crate::traits::{ChangeChannel, ChannelMessage};

    fn tasks() -> TableInfo {
        TableInfo::new("tasks", "id")
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Timestamp::from_millis(1_000)))
    }

    #[tokio::test]
    async fn select_filters_by_updated_at() {
        let clock = clock();
        let remote = MemoryRemote::new(clock.clone());
        let table = remote.register(&tasks());
        table.seed([Row::new().with("id", 1)]);
        clock.advance(Duration::from_secs(1));
        table.seed([Row::new().with("id", 2)]);

        let filter = Filter::new()
            .and("updated_at", Condition::Gt(Timestamp::from_millis(1_500).to_value()))
            .unwrap();
        let rows = table.select(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn upsert_merges_and_records_payload() {
        let remote = MemoryRemote::new(clock());
        let table = remote.register(&tasks());
        table.seed([Row::new().with("id", 1).with("a", 1).with("b", 1)]);

        table
            .upsert(vec![Row::new().with("id", 1).with("b", 2)])
            .await
            .unwrap();
        let row = table.row(&Key::Int(1)).unwrap();
        assert_eq!(row.get("a"), Some(&Value::Int(1)));
        assert_eq!(row.get("b"), Some(&Value::Int(2)));
        assert_eq!(table.upserts().len(), 1);
        assert_eq!(table.calls().upsert, 1);
    }

    #[tokio::test]
    async fn insert_assigns_missing_ids() {
        let remote = MemoryRemote::new(clock());
        let table = remote.register(&tasks());
        table.seed([Row::new().with("id", 4)]);
        let rows = table.insert(vec![Row::new().with("title", "x")]).await.unwrap();
        assert_eq!(rows[0].get("id"), Some(&Value::Int(5)));
        assert!(rows[0].contains("updated_at"));
    }

    #[tokio::test]
    async fn failures_are_injectable() {
        let remote = MemoryRemote::new(clock());
        let table = remote.register(&tasks());
        table.fail_next(1);
        assert!(table.select(&Filter::new()).await.is_err());
        assert!(table.select(&Filter::new()).await.is_ok());

        table.set_down(true);
        assert!(table.delete(&Key::Int(1)).await.is_err());
        assert_eq!(table.calls().select, 2);
        assert_eq!(table.calls().delete, 1);
    }

    #[tokio::test]
    async fn writes_are_broadcast() {
        let channel = Arc::new(MemoryChannel::new());
        let remote = MemoryRemote::new(clock()).with_channel(Arc::clone(&channel));
        let table = remote.register(&tasks());
        let mut sub = channel.subscribe().await.unwrap();
        sub.messages.recv().await;

        table.insert(vec![Row::new().with("id", 1)]).await.unwrap();
        table.delete(&Key::Int(1)).await.unwrap();

        let kinds: Vec<EventType> = [sub.messages.recv().await, sub.messages.recv().await]
            .into_iter()
            .filter_map(|m| match m {
                Some(ChannelMessage::Event(e)) => Some(e.event_type),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![EventType::Insert, EventType::Delete]);
    }
}
