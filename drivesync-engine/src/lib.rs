//! Bidirectional synchronization engine between a cloud file store and a
//! local directory tree.
//!
//! The remote namespace is a multi-parent DAG with soft-trashing and an
//! incremental change feed; the local namespace is an ordinary filesystem
//! tree. The engine mirrors a designated remote root into a local folder
//! and propagates additions, deletions, content changes, renames, and
//! moves in both directions, with echo suppression so neither side
//! re-applies its own writes.

pub mod checkpoint;
pub mod controller;
pub mod events;
pub mod ignore;
pub mod metadata;
pub mod paths;
pub mod poller;
pub mod queue;
pub mod reconciler;
pub mod record;
pub mod remote;
pub mod state;
pub mod watcher;

pub use checkpoint::{Checkpoint, CheckpointStore, JsonCheckpointStore};
pub use controller::SyncController;
pub use events::{ChangeSummary, EngineEvent, SyncStats, SyncStatus};
pub use record::{Change, FileRecord};
pub use remote::{DriveClient, RemoteDrive};
pub use watcher::LocalEvent;
