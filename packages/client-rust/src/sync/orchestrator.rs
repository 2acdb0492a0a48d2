//! Top-level coordinator of every table controller.
//!
//! Startup opens (and upgrades) the local store, validates the calculated
//! field graph, and builds one [`TableSync`] per table. `start` subscribes
//! the shared change channel, runs catch-up from the last watermark and
//! switches to live processing. Channel events are applied one at a time, in
//! arrival order, by a single worker task under a global apply lock.
//!
//! Reconciliation trouble (failed applications, long waits for the apply
//! lock) is counted; too much of it within the drift window triggers a full
//! resync from epoch.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use replica_core::{ChangeEvent, ClockSource, Row, SystemClock, TableInfo, Timestamp};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::calculated::CalculatedFields;
use super::controller::{SyncContext, TableSync};
use super::drift::DriftDetector;
use super::echo::EchoRegistry;
use super::graph::DependencyGraph;
use super::status::{StatusCell, SyncStatus};
use super::watermark::Watermark;
use super::pump::{Pump, PumpTask};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::network::{ChannelConnection, ConnectionState, NetworkState};
use crate::search::SearchIndex;
use crate::storage::LocalStore;
use crate::traits::{ChangeChannel, RemoteSource};

pub struct SyncEngine {
    config: SyncConfig,
    store: LocalStore,
    graph: Arc<DependencyGraph>,
    tables: BTreeMap<String, Arc<TableSync>>,
    channel: Arc<dyn ChangeChannel>,
    online: NetworkState,
    clock: Arc<dyn ClockSource>,
    watermark: Watermark,
    drift: DriftDetector,
    status: StatusCell,
    echoes: Arc<EchoRegistry>,
    apply_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<ChannelConnection>>,
    worker: tokio::sync::Mutex<Option<PumpTask<EventPump>>>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Opens the engine over the store at `config.database_path`.
    ///
    /// # Errors
    ///
    /// Misdeclared tables ([`SyncError::Schema`]) or a local-store failure.
    pub async fn open(
        config: SyncConfig,
        tables: Vec<TableInfo>,
        remote: Arc<dyn RemoteSource>,
        channel: Arc<dyn ChangeChannel>,
        online: NetworkState,
    ) -> Result<Arc<Self>, SyncError> {
        Self::open_with_clock(config, tables, remote, channel, online, Arc::new(SystemClock)).await
    }

    /// Like [`SyncEngine::open`], reading catch-up times from `clock`.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::open`].
    pub async fn open_with_clock(
        config: SyncConfig,
        tables: Vec<TableInfo>,
        remote: Arc<dyn RemoteSource>,
        channel: Arc<dyn ChangeChannel>,
        online: NetworkState,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Arc<Self>, SyncError> {
        let graph = Arc::new(DependencyGraph::build(&tables)?);
        let store = LocalStore::open(&config.database_path, &tables).await?;

        let mut stores = BTreeMap::new();
        for info in &tables {
            let Some(mut table_store) = store.table(&info.name) else {
                continue;
            };
            if let Some(search) = SearchIndex::load(Arc::clone(store.database()), info).await? {
                table_store = table_store.with_search(Arc::new(search));
            }
            stores.insert(info.name.clone(), table_store);
        }
        let calculated = Arc::new(CalculatedFields::new(
            Arc::clone(&graph),
            stores.clone(),
            config.lock_timeout,
        ));
        let echoes = Arc::new(EchoRegistry::new(config.echo_window));
        let shutdown = CancellationToken::new();
        let ctx = SyncContext {
            calculated,
            echoes: Arc::clone(&echoes),
            online: online.clone(),
            retry: config.retry.clone(),
            lock_timeout: config.lock_timeout,
            shutdown: shutdown.child_token(),
        };

        let mut controllers = BTreeMap::new();
        for info in &tables {
            let (Some(table_store), Some(pending)) = (stores.get(&info.name).cloned(), store.pending(&info.name)) else {
                continue;
            };
            let controller = TableSync::new(table_store, pending, remote.table(info), ctx.clone());
            if store.upgraded_tables().contains(&info.name) {
                controller.rebuild_search().await?;
            }
            controllers.insert(info.name.clone(), Arc::new(controller));
        }

        let watermark = Watermark::load(store.clone()).await?;
        info!(
            tables = controllers.len(),
            schema_version = store.schema_version(),
            watermark = %watermark.get(),
            "sync engine opened"
        );

        Ok(Arc::new(Self {
            drift: DriftDetector::new(config.drift.clone()),
            config,
            store,
            graph,
            tables: controllers,
            channel,
            online,
            clock,
            watermark,
            status: StatusCell::new(),
            echoes,
            apply_lock: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
            shutdown,
        }))
    }

    /// Subscribes the change channel, catches up and goes live. Events that
    /// arrive during catch-up wait and are applied afterwards. Calling it
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// [`SyncError::Closed`] if the engine closes during catch-up, or a
    /// local-store failure.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.status.get() == SyncStatus::Closed {
            return Err(SyncError::Closed);
        }
        {
            let mut worker = self.worker.lock().await;
            if worker.is_some() {
                return Ok(());
            }
            let pump = EventPump {
                engine: Arc::downgrade(self),
            };
            let started = PumpTask::spawn(pump, self.config.event_buffer, self.config.tick_interval);
            if let Some(sink) = started.sink() {
                let connection = ChannelConnection::open(
                    Arc::clone(&self.channel),
                    self.online.clone(),
                    self.config.reconnect_delay,
                    sink,
                );
                *self.connection.lock() = Some(connection);
            }
            *worker = Some(started);
        }

        self.catch_up().await?;
        self.status.set(SyncStatus::Live);
        for table in self.tables.values() {
            table.kick().await;
        }
        Ok(())
    }

    /// Fetches and applies every row changed since the watermark, table by
    /// table in dependency order, then advances the watermark to the time
    /// the fetch began. Returns the number of local rows that changed.
    ///
    /// # Errors
    ///
    /// [`SyncError::Closed`] if the engine closes while waiting for the
    /// remote, or a local-store failure.
    pub async fn catch_up(&self) -> Result<usize, SyncError> {
        let _guard = self.apply_lock.lock().await;
        self.catch_up_locked().await
    }

    /// Applies one change event. Echoes of this client's own writes are
    /// skipped. The watermark advances to the event's commit time once it
    /// is applied.
    ///
    /// # Errors
    ///
    /// [`SyncError::Closed`], or a failure of the resync the event
    /// triggered. Application failures count as drift and are logged.
    pub async fn process_event(&self, event: ChangeEvent) -> Result<(), SyncError> {
        let queued = Instant::now();
        let guard = self.apply_lock.lock().await;
        if self.status.get() == SyncStatus::Closed {
            return Err(SyncError::Closed);
        }
        let mut trouble = self.drift.is_slow(queued.elapsed());

        let Some(table) = self.tables.get(&event.table) else {
            debug!(table = %event.table, "event for undeclared table ignored");
            return Ok(());
        };

        let echo = event.new.as_ref().is_some_and(|row| {
            table
                .info()
                .key_of(row)
                .is_some_and(|key| self.echoes.is_echo(&event.table, &key, row))
        });
        let applied = if echo {
            debug!(table = %event.table, "echo of own write skipped");
            true
        } else {
            match table.apply_remote(&event).await {
                Ok(changes) => {
                    debug!(table = %event.table, kind = ?event.event_type, changed = changes.len(), "event applied");
                    true
                }
                Err(e) => {
                    error!(table = %event.table, kind = ?event.event_type, error = %e, "event application failed");
                    trouble = true;
                    false
                }
            }
        };
        if applied {
            if let Err(e) = self.watermark.advance(event.commit_timestamp).await {
                error!(error = %e, "watermark not advanced");
                trouble = true;
            }
        }
        drop(guard);

        if trouble && self.drift.record() {
            warn!("reconciliation trouble piled up; resyncing");
            return self.resync().await;
        }
        Ok(())
    }

    /// Rebuilds the replica from the remote: one best-effort flush of unsent
    /// mutations, then every table, queue and search index is cleared, the
    /// watermark reset to epoch and catch-up rerun. Mutations that still
    /// could not be sent are dropped.
    ///
    /// # Errors
    ///
    /// [`SyncError::Closed`] or a local-store failure.
    pub async fn resync(&self) -> Result<(), SyncError> {
        let _guard = self.apply_lock.lock().await;
        if self.status.get() == SyncStatus::Closed {
            return Err(SyncError::Closed);
        }
        self.status.set(SyncStatus::Resyncing);
        info!(tables = self.tables.len(), "full resync started");

        if self.online.is_online() {
            for table in self.tables.values() {
                if let Err(e) = table.flush_pending().await {
                    warn!(table = %table.name(), error = %e, "flush before resync failed");
                }
            }
        }
        for table in self.tables.values() {
            let dropped = table.reset().await?;
            if dropped > 0 {
                warn!(table = %table.name(), dropped, "unsent mutations dropped by resync");
            }
        }
        self.echoes.clear();
        self.drift.reset();
        self.watermark.reset().await?;

        self.catch_up_locked().await?;
        self.status.set(SyncStatus::Live);
        Ok(())
    }

    /// The controller of a declared table.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnknownTable`].
    pub fn table(&self, name: &str) -> Result<Arc<TableSync>, SyncError> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTable(name.to_string()))
    }

    /// Declared table names in dependency order.
    #[must_use]
    pub fn table_names(&self) -> &[String] {
        self.graph.order()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn watermark(&self) -> Timestamp {
        self.watermark.get()
    }

    /// State of the channel connection, once started.
    #[must_use]
    pub fn connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.connection.lock().as_ref().map(ChannelConnection::state)
    }

    #[must_use]
    pub fn online(&self) -> &NetworkState {
        &self.online
    }

    #[must_use]
    pub fn local_store(&self) -> &LocalStore {
        &self.store
    }

    /// Stops the channel, the event worker and every flush loop.
    pub async fn close(&self) {
        self.status.set(SyncStatus::Closed);
        self.shutdown.cancel();
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        let worker = self.worker.lock().await.take();
        if let Some(mut worker) = worker {
            worker.stop().await;
            debug!("event pump stopped");
        }
        info!("sync engine closed");
    }

    // -- internals ---------------------------------------------------------

    async fn catch_up_locked(&self) -> Result<usize, SyncError> {
        if self.status.get() != SyncStatus::Resyncing {
            self.status.set(SyncStatus::CatchingUp);
        }
        let since = self.watermark.get();
        let started = self.clock.now();
        let mut applied = 0;
        for name in self.graph.order() {
            let Some(table) = self.tables.get(name) else {
                continue;
            };
            let rows = self.fetch_with_retry(table, since).await?;
            let fetched = rows.len();
            applied += table.apply_snapshot(rows).await?;
            table.mark_initialized();
            debug!(table = %name, fetched, "table caught up");
        }
        self.watermark.advance(started).await?;
        info!(since = %since, applied, "catch-up finished");
        Ok(applied)
    }

    async fn fetch_with_retry(&self, table: &TableSync, since: Timestamp) -> Result<Vec<Row>, SyncError> {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(SyncError::Closed),
                () = self.online.wait_online() => {}
            }
            match table.fetch_changed(since).await {
                Ok(rows) => return Ok(rows),
                Err(e) if e.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.config.catch_up_retry.delay(attempt);
                    warn!(
                        table = %table.name(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "catch-up fetch failed, rescheduled"
                    );
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => return Err(SyncError::Closed),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("status", &self.status.get())
            .field("watermark", &self.watermark.get())
            .finish_non_exhaustive()
    }
}

/// Feeds channel events into [`SyncEngine::process_event`]. Each tick
/// restarts flush loops of tables with queued mutations.
struct EventPump {
    engine: Weak<SyncEngine>,
}

#[async_trait]
impl Pump for EventPump {
    type Item = ChangeEvent;

    async fn handle(&mut self, event: ChangeEvent) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Err(e) = engine.process_event(event).await {
            warn!(error = %e, "change event not processed");
        }
    }

    async fn tick(&mut self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        for table in engine.tables.values() {
            table.kick().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
