//! The sync orchestrator and its per-pair reporting.

pub mod orchestrator;
pub mod report;

pub use orchestrator::{SyncError, SyncOrchestrator, SyncRequest};
pub use report::{PairOutcome, SyncReport};
