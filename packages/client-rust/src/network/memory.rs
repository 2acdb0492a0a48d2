//! In-process change channel.
//!
//! Broadcasts [`ChangeEvent`]s to every live subscription and lets tests
//! inject lifecycle statuses and subscribe failures.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use replica_core::ChangeEvent;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{ChangeChannel, ChannelMessage, ChannelStatus, ChannelSubscription};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct MemoryChannel {
    subscribers: DashMap<u64, mpsc::Sender<ChannelMessage>>,
    next_id: AtomicU64,
    subscribe_calls: AtomicUsize,
    failing_subscribes: AtomicUsize,
    capacity: usize,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Channel whose subscriptions buffer at most `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            subscribe_calls: AtomicUsize::new(0),
            failing_subscribes: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Delivers `event` to every live subscription. Returns how many received
    /// it.
    pub async fn publish(&self, event: ChangeEvent) -> usize {
        let targets = self.targets();
        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(ChannelMessage::Event(event.clone())).await.is_ok() {
                delivered += 1;
            } else {
                self.subscribers.remove(&id);
            }
        }
        delivered
    }

    /// Sends `status` to every live subscription.
    pub async fn inject(&self, status: ChannelStatus) {
        for (id, tx) in self.targets() {
            if tx.send(ChannelMessage::Status(status.clone())).await.is_err() {
                self.subscribers.remove(&id);
            }
        }
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Subscribe calls made so far, failed ones included.
    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn targets(&self) -> Vec<(u64, mpsc::Sender<ChannelMessage>)> {
        self.subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl ChangeChannel for MemoryChannel {
    async fn subscribe(&self) -> anyhow::Result<ChannelSubscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            anyhow::bail!("channel unavailable");
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.capacity);
        tx.try_send(ChannelMessage::Status(ChannelStatus::Subscribed))?;
        self.subscribers.insert(id, tx);
        debug!(id, "memory channel subscribed");
        Ok(ChannelSubscription { id, messages: rx })
    }

    async fn unsubscribe(&self, id: u64) -> anyhow::Result<()> {
        self.subscribers.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use replica_core::{Row, Timestamp};

    use super::*;

    #[tokio::test]
    async fn subscription_starts_with_subscribed_status() {
        let channel = MemoryChannel::new();
        let mut sub = channel.subscribe().await.unwrap();
        assert_eq!(
            sub.messages.recv().await,
            Some(ChannelMessage::Status(ChannelStatus::Subscribed))
        );
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let channel = MemoryChannel::new();
        let mut a = channel.subscribe().await.unwrap();
        let mut b = channel.subscribe().await.unwrap();
        a.messages.recv().await;
        b.messages.recv().await;

        let event = ChangeEvent::insert("tasks", Timestamp::from_millis(5), Row::new().with("id", 1));
        assert_eq!(channel.publish(event.clone()).await, 2);
        assert_eq!(a.messages.recv().await, Some(ChannelMessage::Event(event.clone())));
        assert_eq!(b.messages.recv().await, Some(ChannelMessage::Event(event)));
    }

    #[tokio::test]
    async fn unsubscribe_and_dropped_receivers_stop_delivery() {
        let channel = MemoryChannel::new();
        let a = channel.subscribe().await.unwrap();
        let b = channel.subscribe().await.unwrap();
        channel.unsubscribe(a.id).await.unwrap();
        drop(b);

        let event = ChangeEvent::insert("tasks", Timestamp::EPOCH, Row::new().with("id", 1));
        assert_eq!(channel.publish(event).await, 0);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let channel = MemoryChannel::new();
        channel.fail_next_subscribes(2);
        assert!(channel.subscribe().await.is_err());
        assert!(channel.subscribe().await.is_err());
        assert!(channel.subscribe().await.is_ok());
        assert_eq!(channel.subscribe_calls(), 3);
    }
}
