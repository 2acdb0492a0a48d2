use std::sync::Arc;

use async_trait::async_trait;
use replica_core::{ChangeEvent, Filter, Key, Row, TableInfo};
use tokio::sync::mpsc;

/// Access to one table of the remote source of truth.
/// Implementations: PostgREST-style HTTP (`RestRemote`), memory (tests).
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Fetch every row matching the filter.
    async fn select(&self, filter: &Filter) -> anyhow::Result<Vec<Row>>;

    /// Insert rows, returning them as stored by the remote.
    async fn insert(&self, rows: Vec<Row>) -> anyhow::Result<Vec<Row>>;

    /// Apply a partial update to the row with the given key.
    async fn update(&self, row: Row, key: &Key) -> anyhow::Result<Row>;

    /// Insert rows, or merge their fields into existing rows with equal keys.
    async fn upsert(&self, rows: Vec<Row>) -> anyhow::Result<Vec<Row>>;

    /// Physically delete the row with the given key.
    async fn delete(&self, key: &Key) -> anyhow::Result<()>;
}

/// Hands out per-table remote access.
pub trait RemoteSource: Send + Sync {
    fn table(&self, info: &TableInfo) -> Arc<dyn RemoteTable>;
}

/// Lifecycle notifications of a channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Error(String),
    TimedOut,
    Closed,
}

/// One message delivered on a channel subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Event(ChangeEvent),
}

/// A live subscription to the change-notification channel.
#[derive(Debug)]
pub struct ChannelSubscription {
    pub id: u64,
    pub messages: mpsc::Receiver<ChannelMessage>,
}

/// Push-based change notifications for the whole dataset.
#[async_trait]
pub trait ChangeChannel: Send + Sync {
    /// Open a subscription. Its first message is normally
    /// `Status(Subscribed)`; a closed receiver means the subscription ended.
    async fn subscribe(&self) -> anyhow::Result<ChannelSubscription>;

    /// Release a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: u64) -> anyhow::Result<()>;
}
