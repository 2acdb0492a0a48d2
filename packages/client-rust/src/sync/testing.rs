//! Single-table controller over a temporary store and an in-memory remote.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use replica_core::{ManualClock, TableInfo, Timestamp};
use tokio_util::sync::CancellationToken;

use super::calculated::CalculatedFields;
use super::controller::{SyncContext, TableSync};
use super::echo::EchoRegistry;
use super::graph::DependencyGraph;
use super::retry::RetryPolicy;
use crate::network::NetworkState;
use crate::remote::{MemoryRemote, MemoryTable};
use crate::search::SearchIndex;
use crate::storage::LocalStore;
use crate::traits::RemoteTable;

pub(crate) struct Fixture {
    pub _dir: tempfile::TempDir,
    pub local: LocalStore,
    pub table: Arc<TableSync>,
    pub remote: Arc<MemoryTable>,
    pub online: NetworkState,
}

pub(crate) async fn fixture(info: TableInfo, online: bool, retry: RetryPolicy) -> Fixture {
    fixture_with(info, online, retry, Duration::from_secs(5)).await
}

pub(crate) async fn fixture_with(info: TableInfo, online: bool, retry: RetryPolicy, lock_timeout: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let infos = vec![info.clone()];
    let local = LocalStore::open(dir.path().join("t.redb"), &infos).await.unwrap();
    let mut store = local.table(&info.name).unwrap();
    if let Some(search) = SearchIndex::load(Arc::clone(local.database()), &info).await.unwrap() {
        store = store.with_search(Arc::new(search));
    }
    let pending = local.pending(&info.name).unwrap();

    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let remote = MemoryRemote::new(clock);
    let remote_table = remote.register(&info);

    let graph = Arc::new(DependencyGraph::build(&infos).unwrap());
    let mut stores = BTreeMap::new();
    stores.insert(info.name.clone(), store.clone());
    let network = NetworkState::new(online);
    let ctx = SyncContext {
        calculated: Arc::new(CalculatedFields::new(graph, stores, lock_timeout)),
        echoes: Arc::new(EchoRegistry::new(Duration::from_secs(10))),
        online: network.clone(),
        retry,
        lock_timeout,
        shutdown: CancellationToken::new(),
    };
    let table = Arc::new(TableSync::new(
        store,
        pending,
        Arc::clone(&remote_table) as Arc<dyn RemoteTable>,
        ctx,
    ));
    table.mark_initialized();
    Fixture {
        _dir: dir,
        local,
        table,
        remote: remote_table,
        online: network,
    }
}
