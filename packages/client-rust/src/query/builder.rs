//! Condition builder bound to one table, with once-off and live modes.

use replica_core::{Condition, ConditionError, FieldCondition, Filter, Key, Row, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::read::{evaluate, read_rows, resolve_keys, QueryUpdate};
use crate::emitter::Subscription;
use crate::error::{StoreError, SyncError};
use crate::storage::TableStore;

/// A query over one table.
///
/// Conditions combine by intersection. The first invalid condition is
/// remembered and reported when the query runs.
#[derive(Debug, Clone)]
pub struct Query {
    store: TableStore,
    filter: Filter,
    error: Option<ConditionError>,
    ready: Option<watch::Receiver<bool>>,
}

impl Query {
    #[must_use]
    pub fn new(store: TableStore) -> Self {
        Self {
            store,
            filter: Filter::new(),
            error: None,
            ready: None,
        }
    }

    /// Makes reads of a still-empty table wait until `ready` turns true.
    #[must_use]
    pub fn gated(mut self, ready: watch::Receiver<bool>) -> Self {
        self.ready = Some(ready);
        self
    }

    #[must_use]
    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    #[must_use]
    pub fn not(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Not(value.into()))
    }

    #[must_use]
    pub fn is_in<V: Into<Value>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.with(field, Condition::In(values))
    }

    #[must_use]
    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gt(value.into()))
    }

    #[must_use]
    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lt(value.into()))
    }

    #[must_use]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Matching rows in key order.
    ///
    /// # Errors
    ///
    /// An invalid condition, an undeclared index, a cancelled read or a
    /// storage failure.
    pub async fn rows(&self, cancel: Option<&CancellationToken>) -> Result<Vec<Row>, SyncError> {
        self.check()?;
        self.wait_ready(cancel).await?;
        Ok(read_rows(&self.store, &self.filter, cancel).await?)
    }

    /// Matching keys in key order, without reading rows.
    ///
    /// # Errors
    ///
    /// See [`Query::rows`].
    pub async fn keys(&self, cancel: Option<&CancellationToken>) -> Result<Vec<Key>, SyncError> {
        self.check()?;
        self.wait_ready(cancel).await?;
        Ok(resolve_keys(&self.store, &self.filter, cancel).await?)
    }

    /// First matching row in key order.
    ///
    /// # Errors
    ///
    /// See [`Query::rows`].
    pub async fn first(&self, cancel: Option<&CancellationToken>) -> Result<Option<Row>, SyncError> {
        let keys = self.keys(cancel).await?;
        for key in keys {
            if let Some(row) = self.store.read(&key, cancel).await? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Emits the current result, then one incremental update per committed
    /// change that affects it. Changes are tested against the in-memory
    /// predicate; the store is never rescanned.
    ///
    /// # Errors
    ///
    /// An invalid condition or an undeclared index. Failures of the initial
    /// read are logged and the subscription continues with later changes.
    pub fn subscribe<F>(&self, callback: F) -> Result<LiveQuery, SyncError>
    where
        F: Fn(QueryUpdate) + Send + Sync + 'static,
    {
        self.check()?;
        for condition in self.filter.conditions() {
            self.store.index(condition.field())?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.store.changes().subscribe(move |change| {
            let _ = tx.send(change.clone());
        });

        let query = self.clone();
        let task = tokio::spawn(async move {
            match query.rows(None).await {
                Ok(rows) => callback(QueryUpdate {
                    result: rows,
                    deletions: Vec::new(),
                }),
                Err(e) => warn!(table = %query.store.name(), error = %e, "live query initial read failed"),
            }
            while let Some(change) = rx.recv().await {
                if let Some(update) = evaluate(&query.filter, &change) {
                    callback(update);
                }
            }
        });

        Ok(LiveQuery {
            _subscription: subscription,
            task,
        })
    }

    fn with(mut self, field: &str, condition: Condition) -> Self {
        if self.error.is_none() {
            match FieldCondition::new(field, condition) {
                Ok(c) => self.filter.push(c),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    fn check(&self) -> Result<(), SyncError> {
        match &self.error {
            Some(e) => Err(e.clone().into()),
            None => Ok(()),
        }
    }

    async fn wait_ready(&self, cancel: Option<&CancellationToken>) -> Result<(), StoreError> {
        let Some(ready) = &self.ready else {
            return Ok(());
        };
        if *ready.borrow() || !self.store.is_empty().await? {
            return Ok(());
        }
        let mut ready = ready.clone();
        let wait = ready.wait_for(|initialized| *initialized);
        match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(StoreError::Aborted {
                    table: self.store.name().to_string(),
                }),
                _ = wait => Ok(()),
            },
            None => {
                let _ = wait.await;
                Ok(())
            }
        }
    }
}

/// A running live query. Dropping it stops updates.
#[must_use = "dropping a LiveQuery stops its updates"]
#[derive(Debug)]
pub struct LiveQuery {
    _subscription: Subscription,
    task: JoinHandle<()>,
}

impl LiveQuery {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.task.abort();
    }
}
