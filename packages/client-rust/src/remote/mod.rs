//! Implementations of the remote table interface.

pub mod memory;
pub mod rest;

pub use memory::{CallCounts, MemoryRemote, MemoryTable};
pub use rest::{render_filter, RestRemote};
