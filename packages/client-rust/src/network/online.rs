//! Network-online state shared by the flush loops and the channel connection.

use std::sync::Arc;

use tokio::sync::watch;

/// Boolean online flag that tasks can await.
///
/// Cheap to clone; all clones observe the same flag.
#[derive(Debug, Clone)]
pub struct NetworkState {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkState {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is `true`, immediately if it already is.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail here.
        let _ = rx.wait_for(|online| *online).await;
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_online_returns_immediately_when_online() {
        let state = NetworkState::new(true);
        tokio::time::timeout(Duration::from_millis(50), state.wait_online())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_online_blocks_until_flag_flips() {
        let state = NetworkState::new(false);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_online().await })
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!waiter.is_finished());

        state.set_online(true);
        waiter.await.unwrap();
        assert!(state.is_online());
    }
}
