//! drivesync: bidirectional cloud-drive synchronization
//!
//! Re-exports the workspace crates for embedding; the binary in `main.rs`
//! wraps the same API in a CLI.

pub use drivesync_core::{Result, SyncConfig, SyncError};
pub use drivesync_engine::{EngineEvent, SyncController, SyncStatus};

pub mod logging;
