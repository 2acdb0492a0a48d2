//! Self-healing subscription to the shared change channel.
//!
//! State machine, looping until closed:
//!
//! ```text
//! Connecting -> Subscribed -> (error | timeout | closed) -> BackoffWait -> Connecting
//! ```
//!
//! `BackoffWait` sleeps the reconnect delay and then blocks until the network
//! is online. Events received while subscribed are forwarded to a bounded
//! sink in arrival order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use replica_core::ChangeEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::online::NetworkState;
use crate::traits::{ChangeChannel, ChannelMessage, ChannelStatus, ChannelSubscription};

/// Lifecycle state of a [`ChannelConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    BackoffWait,
    Closed,
}

/// How one subscription ended.
enum Ended {
    Closing,
    Lost(String),
}

/// Keeps exactly one channel subscription alive.
#[derive(Debug)]
pub struct ChannelConnection {
    state: watch::Receiver<ConnectionState>,
    closing: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelConnection {
    /// Spawns the connection loop. Events are sent to `sink`; the loop exits
    /// if the sink is dropped.
    #[must_use]
    pub fn open(
        channel: Arc<dyn ChangeChannel>,
        online: NetworkState,
        reconnect_delay: Duration,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let closing = CancellationToken::new();
        let handle = tokio::spawn(run(
            channel,
            online,
            reconnect_delay,
            sink,
            state_tx,
            closing.clone(),
        ));
        Self {
            state: state_rx,
            closing,
            handle: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    #[must_use]
    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stops reconnecting, releases the subscription and waits for the loop
    /// to finish.
    pub async fn close(&self) {
        self.closing.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

async fn run(
    channel: Arc<dyn ChangeChannel>,
    online: NetworkState,
    reconnect_delay: Duration,
    sink: mpsc::Sender<ChangeEvent>,
    state: watch::Sender<ConnectionState>,
    closing: CancellationToken,
) {
    loop {
        state.send_replace(ConnectionState::Connecting);
        let subscribed = tokio::select! {
            biased;
            () = closing.cancelled() => break,
            result = channel.subscribe() => result,
        };

        match subscribed {
            Ok(mut sub) => {
                let ended = pump(&mut sub, &sink, &state, &closing).await;
                if let Err(e) = channel.unsubscribe(sub.id).await {
                    warn!(id = sub.id, error = %e, "channel unsubscribe failed");
                }
                match ended {
                    Ended::Closing => break,
                    Ended::Lost(reason) => warn!(reason = %reason, "change channel lost"),
                }
            }
            Err(e) => warn!(error = %e, "change channel subscribe failed"),
        }

        state.send_replace(ConnectionState::BackoffWait);
        let resumed = async {
            tokio::time::sleep(reconnect_delay).await;
            online.wait_online().await;
        };
        tokio::select! {
            biased;
            () = closing.cancelled() => break,
            () = resumed => {}
        }
        debug!("reconnecting change channel");
    }
    state.send_replace(ConnectionState::Closed);
    info!("change channel closed");
}

async fn pump(
    sub: &mut ChannelSubscription,
    sink: &mpsc::Sender<ChangeEvent>,
    state: &watch::Sender<ConnectionState>,
    closing: &CancellationToken,
) -> Ended {
    loop {
        let message = tokio::select! {
            biased;
            () = closing.cancelled() => return Ended::Closing,
            message = sub.messages.recv() => message,
        };
        match message {
            Some(ChannelMessage::Status(ChannelStatus::Subscribed)) => {
                state.send_replace(ConnectionState::Subscribed);
                info!(id = sub.id, "change channel subscribed");
            }
            Some(ChannelMessage::Status(ChannelStatus::Error(e))) => return Ended::Lost(format!("error: {e}")),
            Some(ChannelMessage::Status(ChannelStatus::TimedOut)) => return Ended::Lost("timed out".to_string()),
            Some(ChannelMessage::Status(ChannelStatus::Closed)) => return Ended::Lost("closed by remote".to_string()),
            Some(ChannelMessage::Event(event)) => {
                let sent = tokio::select! {
                    biased;
                    () = closing.cancelled() => return Ended::Closing,
                    sent = sink.send(event) => sent,
                };
                if sent.is_err() {
                    return Ended::Closing;
                }
            }
            None => return Ended::Lost("subscription ended".to_string()),
        }
    }
}
