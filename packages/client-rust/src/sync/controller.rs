//! Offline-first CRUD for one table.
//!
//! Optimistic tables apply inserts and updates locally first and queue them
//! in the durable pending area; a single flush loop per table coalesces the
//! queue and pushes it to the remote, retrying with capped backoff while the
//! remote is unreachable. Synchronous tables round-trip before writing
//! locally. Deletes always round-trip.
//!
//! Every local write is one [`Commit`] under the table's named lock: the row,
//! its queued mutation and its search nodes land together or not at all.
//! Calculated-field propagation runs after the lock is released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use replica_core::{Change, ChangeEvent, Condition, EventType, Filter, Key, Row, TableInfo, Timestamp};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::calculated::CalculatedFields;
use super::echo::EchoRegistry;
use super::retry::{coalesce, RetryPolicy};
use crate::error::{StoreError, SyncError};
use crate::network::NetworkState;
use crate::query::{LiveQuery, Query};
use crate::search::{SearchIndex, SearchMode};
use crate::storage::{Commit, PendingQueue, TableStore};
use crate::traits::RemoteTable;

/// Engine-wide collaborators shared by every table controller.
#[derive(Clone)]
pub(crate) struct SyncContext {
    pub calculated: Arc<CalculatedFields>,
    pub echoes: Arc<EchoRegistry>,
    pub online: NetworkState,
    pub retry: RetryPolicy,
    pub lock_timeout: Duration,
    pub shutdown: CancellationToken,
}

pub struct TableSync {
    info: Arc<TableInfo>,
    store: TableStore,
    pending: PendingQueue,
    remote: Arc<dyn RemoteTable>,
    search: Option<Arc<SearchIndex>>,
    ctx: SyncContext,
    initialized: watch::Sender<bool>,
    flushing: AtomicBool,
    flush_attempts: AtomicU64,
}

impl TableSync {
    pub(crate) fn new(store: TableStore, pending: PendingQueue, remote: Arc<dyn RemoteTable>, ctx: SyncContext) -> Self {
        let (initialized, _rx) = watch::channel(false);
        Self {
            info: Arc::clone(store.info()),
            search: store.search().cloned(),
            store,
            pending,
            remote,
            ctx,
            initialized,
            flushing: AtomicBool::new(false),
            flush_attempts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The underlying local table.
    #[must_use]
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    #[must_use]
    pub fn search_index(&self) -> Option<&Arc<SearchIndex>> {
        self.search.as_ref()
    }

    // -- writes ------------------------------------------------------------

    /// Inserts a row and returns it as stored.
    ///
    /// Optimistic tables assign a UUID key when the row has none, write
    /// locally and queue the row for the remote. Synchronous tables insert
    /// remotely first and store the row the remote confirmed.
    ///
    /// # Errors
    ///
    /// Local-store failure, lock timeout, or (synchronous tables only) a
    /// remote failure.
    pub async fn insert(self: &Arc<Self>, row: Row) -> Result<Row, SyncError> {
        let mut row = row.without_calculated();

        if self.info.optimistic_insert {
            if self.info.key_of(&row).is_none() {
                row.insert(self.info.primary_key.clone(), Uuid::new_v4().to_string());
            }
            let commit = Commit::new().put(row.clone()).enqueue(row.clone());
            let committed = self.store.lock(self.ctx.lock_timeout, self.store.commit(commit)).await??;
            self.after_change(&committed.changes).await?;
            self.schedule_flush();
            return Ok(row);
        }

        let confirmed = self.remote.insert(vec![row]).await.map_err(SyncError::Remote)?;
        let Some(stored) = confirmed.into_iter().next() else {
            return Err(SyncError::MissingKey {
                table: self.info.name.clone(),
            });
        };
        let key = self.key_of(&stored)?;
        self.ctx.echoes.record(&self.info.name, key, stored.clone());
        let change = self
            .store
            .lock(self.ctx.lock_timeout, self.store.write(stored.clone()))
            .await??;
        self.after_change(change.as_slice()).await?;
        Ok(stored)
    }

    /// Merges `partial` into the stored row with the same key and returns
    /// the merged row.
    ///
    /// # Errors
    ///
    /// A partial row without a key, local-store failure, lock timeout, or
    /// (synchronous tables only) a remote failure.
    pub async fn update(self: &Arc<Self>, partial: Row) -> Result<Row, SyncError> {
        let key = self.key_of(&partial)?;
        let partial = partial.without_calculated();

        if self.info.optimistic_update {
            let commit = Commit::new().merge(key, partial.clone()).enqueue(partial);
            let mut committed = self.store.lock(self.ctx.lock_timeout, self.store.commit(commit)).await??;
            self.after_change(&committed.changes).await?;
            self.schedule_flush();
            return Ok(committed.rows.pop().unwrap_or_default());
        }

        let confirmed = self.remote.update(partial, &key).await.map_err(SyncError::Remote)?;
        self.ctx.echoes.record(&self.info.name, key.clone(), confirmed.clone());
        let commit = Commit::new().merge(key, confirmed);
        let mut committed = self.store.lock(self.ctx.lock_timeout, self.store.commit(commit)).await??;
        self.after_change(&committed.changes).await?;
        Ok(committed.rows.pop().unwrap_or_default())
    }

    /// Deletes a row remotely, then locally. Soft-deletable tables set the
    /// delete flag remotely instead of removing the row. Unsent mutations of
    /// the row are discarded. Returns whether a local row was removed.
    ///
    /// # Errors
    ///
    /// Remote failure (nothing changes locally then), local-store failure or
    /// lock timeout.
    pub async fn delete(&self, key: &Key) -> Result<bool, SyncError> {
        match &self.info.soft_delete {
            Some(flag) => {
                let marker = Row::new()
                    .with(self.info.primary_key.clone(), key.clone())
                    .with(flag.clone(), true);
                self.remote.update(marker, key).await.map_err(SyncError::Remote)?;
            }
            None => self.remote.delete(key).await.map_err(SyncError::Remote)?,
        }
        let changes = self.remove_local(key).await?;
        self.after_change(&changes).await?;
        debug!(table = %self.info.name, key = %key, "row deleted");
        Ok(!changes.is_empty())
    }

    // -- reads -------------------------------------------------------------

    /// The stored row, waiting for the first catch-up if the table is still
    /// empty.
    ///
    /// # Errors
    ///
    /// Cancelled read or local-store failure.
    pub async fn read(&self, key: &Key, cancel: Option<&CancellationToken>) -> Result<Option<Row>, SyncError> {
        self.wait_ready(cancel).await?;
        Ok(self.store.read(key, cancel).await?)
    }

    /// Calls `callback` with the row's current value, then again whenever it
    /// changes. `None` means absent or deleted.
    ///
    /// # Errors
    ///
    /// See [`Query::subscribe`].
    pub fn observe<F>(&self, key: &Key, callback: F) -> Result<LiveQuery, SyncError>
    where
        F: Fn(Option<Row>) + Send + Sync + 'static,
    {
        self.find()
            .eq(&self.info.primary_key, key.clone())
            .subscribe(move |update| callback(update.result.into_iter().next()))
    }

    /// A query over this table, gated on the first catch-up.
    #[must_use]
    pub fn find(&self) -> Query {
        Query::new(self.store.clone()).gated(self.initialized.subscribe())
    }

    /// First row of the query built by `build`.
    ///
    /// # Errors
    ///
    /// See [`Query::first`].
    pub async fn find_one<F>(&self, build: F, cancel: Option<&CancellationToken>) -> Result<Option<Row>, SyncError>
    where
        F: FnOnce(Query) -> Query,
    {
        build(self.find()).first(cancel).await
    }

    /// # Errors
    ///
    /// Cancelled read or local-store failure.
    pub async fn find_largest_id(&self, cancel: Option<&CancellationToken>) -> Result<Option<i64>, SyncError> {
        self.wait_ready(cancel).await?;
        Ok(self.store.find_largest_id(cancel).await?)
    }

    /// Rows whose search field matches `query` in `mode`.
    ///
    /// # Errors
    ///
    /// [`SyncError::NoSearchField`] if the table declares no search field,
    /// cancelled read or local-store failure.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Row>, SyncError> {
        let Some(index) = &self.search else {
            return Err(SyncError::NoSearchField(self.info.name.clone()));
        };
        self.wait_ready(cancel).await?;
        let keys = index.search(query, mode, limit).await;
        let rows = self.store.read_many(&keys, cancel).await?;
        Ok(rows.into_iter().flatten().collect())
    }

    // -- pending flush -----------------------------------------------------

    /// Sends every queued mutation, coalesced per key, in one upsert. Only
    /// the entries that were sent are removed. Returns the number of rows
    /// sent.
    ///
    /// # Errors
    ///
    /// Remote failure (the queue is left intact), local-store failure or
    /// lock timeout.
    pub async fn flush_pending(&self) -> Result<usize, SyncError> {
        self.flush_attempts.fetch_add(1, Ordering::Relaxed);
        self.store
            .lock(self.ctx.lock_timeout, async {
                let entries = self.pending.entries().await?;
                if entries.is_empty() {
                    return Ok::<_, SyncError>(0);
                }
                let batch = coalesce(&self.info, &entries);
                if !batch.rows.is_empty() {
                    let sent: Vec<(Key, &Row)> = batch
                        .rows
                        .iter()
                        .filter_map(|row| Some((self.info.key_of(row)?, row)))
                        .collect();
                    for (key, row) in &sent {
                        self.ctx.echoes.record(&self.info.name, key.clone(), (*row).clone());
                    }
                    if let Err(e) = self.remote.upsert(batch.rows.clone()).await {
                        for (key, row) in &sent {
                            self.ctx.echoes.forget(&self.info.name, key, row);
                        }
                        return Err(SyncError::Remote(e));
                    }
                }
                self.pending.remove(&batch.seqs).await?;
                debug!(
                    table = %self.info.name,
                    rows = batch.rows.len(),
                    entries = batch.seqs.len(),
                    "pending mutations flushed"
                );
                Ok::<_, SyncError>(batch.rows.len())
            })
            .await?
    }

    /// Starts the flush loop unless one is already running.
    ///
    /// The loop waits for the network before every attempt and backs off
    /// per the retry policy after each failure, until the queue is empty or
    /// the engine shuts down.
    pub fn schedule_flush(self: &Arc<Self>) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.flush_loop().await });
    }

    /// Schedules a flush if anything is queued.
    pub async fn kick(self: &Arc<Self>) {
        match self.pending.is_empty().await {
            Ok(false) => self.schedule_flush(),
            Ok(true) => {}
            Err(e) => warn!(table = %self.info.name, error = %e, "pending queue unreadable"),
        }
    }

    /// # Errors
    ///
    /// Local-store failure.
    pub async fn pending_len(&self) -> Result<usize, SyncError> {
        Ok(self.pending.len().await?)
    }

    /// Flush attempts made so far, successful or not.
    #[must_use]
    pub fn flush_attempts(&self) -> u64 {
        self.flush_attempts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    // -- remote changes ----------------------------------------------------

    /// Rows changed remotely after `since`. From epoch, soft-deleted rows
    /// are left out; a row whose delete flag is absent or null counts as
    /// live. After epoch, deleted rows are fetched too so their deletion
    /// reaches the replica.
    ///
    /// # Errors
    ///
    /// Remote failure.
    pub async fn fetch_changed(&self, since: Timestamp) -> Result<Vec<Row>, SyncError> {
        if since.is_epoch() {
            let mut rows = self.remote.select(&Filter::new()).await.map_err(SyncError::Remote)?;
            rows.retain(|row| !self.info.is_deleted(row));
            return Ok(rows);
        }
        let filter = Filter::new().and(self.info.updated_at.clone(), Condition::Gt(since.to_value()))?;
        self.remote.select(&filter).await.map_err(SyncError::Remote)
    }

    /// Applies one change event of this table. A row whose soft-delete flag
    /// is set is removed locally.
    ///
    /// # Errors
    ///
    /// An event row without a key, local-store failure or lock timeout.
    pub async fn apply_remote(&self, event: &ChangeEvent) -> Result<Vec<Change>, SyncError> {
        let changes = match event.event_type {
            EventType::Insert | EventType::Update => {
                let Some(row) = event.new.clone() else {
                    debug!(table = %self.info.name, "event without new row ignored");
                    return Ok(Vec::new());
                };
                let key = self.key_of(&row)?;
                if self.info.is_deleted(&row) {
                    self.remove_local(&key).await?
                } else {
                    let commit = Commit::new().remote(key, row);
                    self.store.lock(self.ctx.lock_timeout, self.store.commit(commit)).await??.changes
                }
            }
            EventType::Delete => {
                let Some(key) = event.old.as_ref().and_then(|row| self.info.key_of(row)) else {
                    debug!(table = %self.info.name, "delete event without key ignored");
                    return Ok(Vec::new());
                };
                self.remove_local(&key).await?
            }
        };
        self.after_change(&changes).await?;
        Ok(changes)
    }

    /// Applies a catch-up batch in one transaction. Remote rows keep local
    /// derived values and unsent mutations; deleted rows are dropped along
    /// with their unsent mutations. Returns the number of local rows that
    /// changed.
    ///
    /// # Errors
    ///
    /// Local-store failure or lock timeout.
    pub async fn apply_snapshot(&self, rows: Vec<Row>) -> Result<usize, SyncError> {
        let mut commit = Commit::new();
        for row in rows {
            match self.info.key_of(&row) {
                Some(key) if self.info.is_deleted(&row) => commit = commit.discard(key.clone()).delete(key),
                Some(key) => commit = commit.remote(key, row),
                None => warn!(table = %self.info.name, "fetched row without key skipped"),
            }
        }

        let committed = self.store.lock(self.ctx.lock_timeout, self.store.commit(commit)).await??;
        self.after_change(&committed.changes).await?;
        Ok(committed.changes.len())
    }

    // -- lifecycle ---------------------------------------------------------

    /// Opens the read gate.
    pub fn mark_initialized(&self) {
        self.initialized.send_replace(true);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Resolves once the first catch-up of this table has been applied.
    ///
    /// # Errors
    ///
    /// [`StoreError::Aborted`] if `cancel` fires first.
    pub async fn wait_initialized(&self, cancel: Option<&CancellationToken>) -> Result<(), SyncError> {
        let mut rx = self.initialized.subscribe();
        let wait = rx.wait_for(|ready| *ready);
        match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(self.aborted()),
                _ = wait => Ok(()),
            },
            None => {
                let _ = wait.await;
                Ok(())
            }
        }
    }

    /// Drops every local row, queued mutation and search node, and closes
    /// the read gate. Returns the number of queued mutations dropped.
    ///
    /// # Errors
    ///
    /// Local-store failure or lock timeout.
    pub async fn reset(&self) -> Result<usize, SyncError> {
        let committed = self
            .store
            .lock(self.ctx.lock_timeout, self.store.commit(Commit::new().reset()))
            .await??;
        self.initialized.send_replace(false);
        Ok(committed.discarded)
    }

    /// Rebuilds the search index from the stored rows.
    ///
    /// # Errors
    ///
    /// Local-store failure.
    pub async fn rebuild_search(&self) -> Result<(), SyncError> {
        if let Some(search) = &self.search {
            search.rebuild().await?;
        }
        Ok(())
    }

    // -- internals ---------------------------------------------------------

    async fn flush_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                biased;
                () = self.ctx.shutdown.cancelled() => break,
                () = self.ctx.online.wait_online() => {}
            }

            match self.flush_pending().await {
                Ok(_) => {
                    attempt = 0;
                    if matches!(self.pending.is_empty().await, Ok(false)) {
                        continue;
                    }
                    self.flushing.store(false, Ordering::Release);
                    // Entries queued between the check and the release.
                    if matches!(self.pending.is_empty().await, Ok(false))
                        && !self.flushing.swap(true, Ordering::AcqRel)
                    {
                        continue;
                    }
                    return;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.ctx.retry.delay(attempt);
                    warn!(
                        table = %self.info.name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "pending flush failed, rescheduled"
                    );
                    tokio::select! {
                        biased;
                        () = self.ctx.shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.flushing.store(false, Ordering::Release);
    }

    /// Calculated-field upkeep for committed changes.
    async fn after_change(&self, changes: &[Change]) -> Result<(), SyncError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.ctx.calculated.propagate(&self.info.name, changes).await?;
        Ok(())
    }

    async fn remove_local(&self, key: &Key) -> Result<Vec<Change>, SyncError> {
        let commit = Commit::new().discard(key.clone()).delete(key.clone());
        let committed = self.store.lock(self.ctx.lock_timeout, self.store.commit(commit)).await??;
        Ok(committed.changes)
    }

    async fn wait_ready(&self, cancel: Option<&CancellationToken>) -> Result<(), SyncError> {
        if self.is_initialized() || !self.store.is_empty().await? {
            return Ok(());
        }
        self.wait_initialized(cancel).await
    }

    fn key_of(&self, row: &Row) -> Result<Key, SyncError> {
        self.info.key_of(row).ok_or_else(|| SyncError::MissingKey {
            table: self.info.name.clone(),
        })
    }

    fn aborted(&self) -> SyncError {
        SyncError::Store(StoreError::Aborted {
            table: self.info.name.clone(),
        })
    }
}

impl std::fmt::Debug for TableSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSync")
            .field("table", &self.info.name)
            .field("initialized", &self.is_initialized())
            .field("flushing", &self.is_flushing())
            .finish_non_exhaustive()
    }
}
