//! Shared foundation for the drivesync workspace: error taxonomy, engine
//! configuration, and content checksumming.

pub mod checksum;
pub mod config;
pub mod error;

pub use checksum::{md5_of_bytes, md5_of_file};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
