//! Condition-based queries over local secondary indexes.

pub mod builder;
pub mod read;

pub use builder::{LiveQuery, Query};
pub use read::{evaluate, read_rows, resolve_keys, QueryUpdate};
