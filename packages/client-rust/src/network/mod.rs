//! Network-facing plumbing: online state, the reconnecting change-channel
//! connection, and an in-process channel.

pub mod connection;
pub mod memory;
pub mod online;

pub use connection::{ChannelConnection, ConnectionState};
pub use memory::MemoryChannel;
pub use online::NetworkState;
