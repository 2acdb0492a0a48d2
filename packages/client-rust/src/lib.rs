//! Replica Client — local-first replica of remote tables: redb-backed local
//! store, index-backed queries, incremental search, and the sync engine that
//! reconciles the replica with the remote source of truth.

pub mod config;
pub mod emitter;
pub mod error;
pub mod network;
pub mod query;
pub mod remote;
pub mod search;
pub mod storage;
pub mod sync;
pub mod traits;

pub use config::{DriftConfig, RestConfig, SyncConfig};
pub use emitter::{EventEmitter, Subscription};
pub use error::{SchemaError, StoreError, SyncError};
pub use network::{ChannelConnection, ConnectionState, MemoryChannel, NetworkState};
pub use query::{LiveQuery, Query, QueryUpdate};
pub use remote::{MemoryRemote, MemoryTable, RestRemote};
pub use search::{SearchIndex, SearchMode};
pub use storage::{LocalStore, TableStore};
pub use sync::{RetryPolicy, SyncEngine, SyncStatus, SyncedRow, TableSync};
pub use traits::{ChangeChannel, ChannelMessage, ChannelStatus, ChannelSubscription, RemoteSource, RemoteTable};
