//! Single task applying queued items strictly in arrival order, with a
//! periodic tick between items.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Body of a [`PumpTask`].
#[async_trait]
pub trait Pump: Send + 'static {
    type Item: Send + 'static;

    async fn handle(&mut self, item: Self::Item);

    async fn tick(&mut self);
}

/// Handle of a spawned pump. The task ends when stopped or when every
/// sink has been dropped.
pub struct PumpTask<P: Pump> {
    sink: Option<mpsc::Sender<P::Item>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<P: Pump> PumpTask<P> {
    /// Spawns `pump` behind a queue of `capacity` items.
    #[must_use]
    pub fn spawn(mut pump: P, capacity: usize, tick: Duration) -> Self {
        let (sink, mut rx) = mpsc::channel::<P::Item>(capacity.max(1));
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick);
            ticks.tick().await;
            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => pump.handle(item).await,
                        None => break,
                    },
                    _ = ticks.tick() => pump.tick().await,
                }
            }
        });

        Self {
            sink: Some(sink),
            stop,
            handle: Some(handle),
        }
    }

    /// A producer handle for the queue, or `None` once stopped.
    #[must_use]
    pub fn sink(&self) -> Option<mpsc::Sender<P::Item>> {
        self.sink.clone()
    }

    /// Stops the task and waits for it. Items still queued are dropped.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        self.sink.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<P: Pump> std::fmt::Debug for PumpTask<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpTask")
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default, Clone)]
    struct Recording {
        seen: Arc<Mutex<Vec<u32>>>,
        ticks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Pump for Recording {
        type Item = u32;

        async fn handle(&mut self, item: u32) {
            // Later items would overtake earlier ones if handling overlapped.
            tokio::time::sleep(Duration::from_millis(u64::from(10 - item))).await;
            self.seen.lock().push(item);
        }

        async fn tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_handled_in_arrival_order() {
        let recording = Recording::default();
        let mut pump = PumpTask::spawn(recording.clone(), 8, Duration::from_secs(60));
        let sink = pump.sink().unwrap();
        for item in 1..=5 {
            sink.send(item).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*recording.seen.lock(), vec![1, 2, 3, 4, 5]);
        pump.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_periodically() {
        let recording = Recording::default();
        let mut pump = PumpTask::spawn(recording.clone(), 8, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(70)).await;
        pump.stop().await;
        assert!(recording.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn stop_closes_the_queue() {
        let mut pump = PumpTask::spawn(Recording::default(), 8, Duration::from_secs(60));
        let sink = pump.sink().unwrap();
        pump.stop().await;
        assert!(pump.sink().is_none());
        assert!(sink.send(1).await.is_err());
    }
}
