//! Table sync controllers, the orchestrator that owns them, and their
//! supporting state.

pub mod calculated;
pub mod controller;
pub mod drift;
pub mod echo;
pub mod graph;
pub mod orchestrator;
pub mod pump;
pub mod retry;
pub mod status;
pub mod synced_row;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use calculated::CalculatedFields;
pub use controller::TableSync;
pub use drift::DriftDetector;
pub use echo::EchoRegistry;
pub use graph::{DependencyGraph, DependentEdge};
pub use orchestrator::SyncEngine;
pub use pump::{Pump, PumpTask};
pub use retry::{coalesce, Coalesced, RetryPolicy};
pub use status::{StatusCell, SyncStatus};
pub use synced_row::SyncedRow;
pub use watermark::Watermark;
