//! End-to-end behavior of a replica against the in-memory remote and
//! change channel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use replica_client::{
    ConnectionState, MemoryChannel, MemoryRemote, NetworkState, RemoteTable, SearchMode, SyncConfig, SyncEngine,
    SyncError, SyncStatus, SyncedRow,
};
use replica_core::{Key, ManualClock, Row, TableInfo, Timestamp, Value};

fn schema() -> Vec<TableInfo> {
    vec![
        TableInfo::new("notes", "id").index("folder").search("body"),
        TableInfo::new("folders", "id").synchronous(),
    ]
}

struct Replica {
    engine: Arc<SyncEngine>,
    remote: Arc<MemoryRemote>,
    online: NetworkState,
}

fn remote_with_channel() -> (Arc<MemoryRemote>, Arc<MemoryChannel>) {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let channel = Arc::new(MemoryChannel::new());
    let remote = Arc::new(MemoryRemote::new(clock).with_channel(Arc::clone(&channel)));
    for info in schema() {
        remote.register(&info);
    }
    (remote, channel)
}

async fn open(path: &Path, remote: Arc<MemoryRemote>, channel: Arc<MemoryChannel>, online: bool) -> Replica {
    let online = NetworkState::new(online);
    let config = SyncConfig {
        database_path: path.to_path_buf(),
        ..SyncConfig::default()
    };
    // A previous engine on the same file may still be winding down.
    for _ in 0..200 {
        match SyncEngine::open(config.clone(), schema(), remote.clone(), channel.clone(), online.clone()).await {
            Ok(engine) => {
                return Replica {
                    engine,
                    remote,
                    online,
                }
            }
            Err(SyncError::Store(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("open failed: {e}"),
        }
    }
    panic!("database never became available");
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{what} never happened");
}

async fn subscribed(engine: &SyncEngine) {
    let mut state = engine.connection_state().unwrap();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Subscribed))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn offline_edits_reach_the_remote_as_one_upsert() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, channel) = remote_with_channel();
    let replica = open(&dir.path().join("db"), remote, channel, true).await;
    replica.engine.start().await.unwrap();

    replica.online.set_online(false);
    let notes = replica.engine.table("notes").unwrap();
    notes
        .insert(Row::new().with("id", 1).with("body", "draft"))
        .await
        .unwrap();
    notes.update(Row::new().with("id", 1).with("folder", 7)).await.unwrap();
    notes.update(Row::new().with("id", 1).with("body", "final")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let remote_notes = replica.remote.get("notes").unwrap();
    assert_eq!(remote_notes.calls().upsert, 0);
    assert!(notes.pending_len().await.unwrap() > 0);

    replica.online.set_online(true);
    eventually("flush", || remote_notes.calls().upsert == 1).await;
    let sent = remote_notes.upserts();
    assert_eq!(sent[0].len(), 1);
    let row = remote_notes.row(&Key::Int(1)).unwrap();
    assert_eq!(row.get("body").and_then(|v| v.as_str()), Some("final"));
    assert!(row.get("folder").is_some());
    replica.engine.close().await;
}

#[tokio::test]
async fn queued_writes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let (remote, channel) = remote_with_channel();
    {
        let replica = open(&path, remote.clone(), channel.clone(), true).await;
        replica.engine.start().await.unwrap();
        replica.online.set_online(false);
        replica
            .engine
            .table("notes")
            .unwrap()
            .insert(Row::new().with("id", 5).with("body", "kept"))
            .await
            .unwrap();
        replica.engine.close().await;
    }
    assert!(remote.get("notes").unwrap().row(&Key::Int(5)).is_none());

    let replica = open(&path, remote, channel, true).await;
    replica.engine.start().await.unwrap();
    let remote_notes = replica.remote.get("notes").unwrap();
    eventually("restart flush", || remote_notes.row(&Key::Int(5)).is_some()).await;
    replica.engine.close().await;
}

#[tokio::test]
async fn remote_inserts_reach_live_queries_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, channel) = remote_with_channel();
    let replica = open(&dir.path().join("db"), remote, channel, true).await;
    replica.engine.start().await.unwrap();
    subscribed(&replica.engine).await;

    let notes = replica.engine.table("notes").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let live = {
        let seen = Arc::clone(&seen);
        notes
            .find()
            .eq("folder", 3)
            .subscribe(move |update| seen.lock().extend(update.result))
            .unwrap()
    };

    replica
        .remote
        .get("notes")
        .unwrap()
        .insert(vec![
            Row::new().with("id", 10).with("folder", 3).with("body", "harbor lights"),
            Row::new().with("id", 11).with("folder", 4).with("body", "mountain pass"),
        ])
        .await
        .unwrap();

    eventually("live update", || seen.lock().len() == 1).await;
    assert_eq!(seen.lock()[0].get("id"), Some(&Value::Int(10)));

    let mut hits = Vec::new();
    for _ in 0..300 {
        hits = notes.search("arbo", SearchMode::Contains, 10, None).await.unwrap();
        if !hits.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].get("id"), Some(&Value::Int(10)));
    live.stop();
    replica.engine.close().await;
}

#[tokio::test]
async fn synced_row_follows_local_and_remote_writes() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, channel) = remote_with_channel();
    let replica = open(&dir.path().join("db"), remote, channel, true).await;
    replica
        .remote
        .get("notes")
        .unwrap()
        .seed([Row::new().with("id", 2).with("body", "seeded")]);
    replica.engine.start().await.unwrap();
    subscribed(&replica.engine).await;

    let notes = replica.engine.table("notes").unwrap();
    let row = SyncedRow::bind(&notes, Key::Int(2)).unwrap();
    eventually("initial value", || row.current().is_some()).await;

    row.write(Row::new().with("body", "edited")).await.unwrap();
    eventually("local edit", || {
        row.current()
            .is_some_and(|r| r.get("body").and_then(|v| v.as_str()) == Some("edited"))
    })
    .await;

    let remote_notes = replica.remote.get("notes").unwrap();
    eventually("edit flushed", || remote_notes.calls().upsert == 1).await;

    remote_notes.delete(&Key::Int(2)).await.unwrap();
    eventually("remote delete", || row.current().is_none()).await;
    replica.engine.close().await;
}

#[tokio::test]
async fn synchronous_tables_refuse_writes_the_remote_rejects() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, channel) = remote_with_channel();
    let replica = open(&dir.path().join("db"), remote, channel, true).await;
    replica.engine.start().await.unwrap();

    let folders = replica.engine.table("folders").unwrap();
    replica.remote.get("folders").unwrap().fail_next(1);
    let err = folders
        .insert(Row::new().with("id", 1).with("name", "inbox"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(folders.read(&Key::Int(1), None).await.unwrap().is_none());

    folders
        .insert(Row::new().with("id", 1).with("name", "inbox"))
        .await
        .unwrap();
    assert!(folders.read(&Key::Int(1), None).await.unwrap().is_some());
    replica.engine.close().await;
}

#[tokio::test]
async fn closing_stops_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, channel) = remote_with_channel();
    let replica = open(&dir.path().join("db"), remote, channel, true).await;
    replica.engine.start().await.unwrap();
    assert_eq!(replica.engine.status(), SyncStatus::Live);

    replica.engine.close().await;
    assert_eq!(replica.engine.status(), SyncStatus::Closed);
    assert!(matches!(replica.engine.start().await, Err(SyncError::Closed)));
}
