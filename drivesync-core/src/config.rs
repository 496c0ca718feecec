//! Engine configuration
//!
//! Loaded from a TOML file by the binary; every field has a default so a
//! minimal config only needs the account, token, and local root.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default change-feed page size
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Default number of concurrent downloads / remote-change applications
pub const DEFAULT_PARALLEL_WINDOW: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Account identifier, used to key the persisted checkpoint
    pub account_id: String,

    /// OAuth bearer token for the remote service (acquisition is out of
    /// scope; the enclosing application refreshes it)
    pub access_token: String,

    /// Local folder the remote root is mirrored into
    pub local_root: PathBuf,

    /// Remote folder id to mirror; `None` means the account's root alias
    pub remote_root_id: Option<String>,

    /// Permanently delete remote records for local removals instead of
    /// trashing them
    pub permanently_delete: bool,

    /// REST endpoint for metadata and change-feed calls
    pub api_base_url: String,

    /// REST endpoint for content uploads
    pub upload_base_url: String,

    /// Page size for listings and the change feed
    pub page_size: u32,

    /// Concurrent downloads during initial sync and concurrent remote-change
    /// applications in the poller
    pub parallel_window: usize,

    /// Change poller: starting interval in seconds
    pub poll_initial_secs: u64,
    /// Change poller: interval floor in seconds
    pub poll_min_secs: u64,
    /// Change poller: interval ceiling in seconds
    pub poll_max_secs: u64,
    /// Change poller: multiplicative backoff factor
    pub poll_backoff_factor: f64,

    /// Directory for the checkpoint file; `None` resolves to the platform
    /// data dir
    pub checkpoint_dir: Option<PathBuf>,

    /// Minimum seconds between checkpoint writes during heavy change streams
    pub checkpoint_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            access_token: String::new(),
            local_root: PathBuf::new(),
            remote_root_id: None,
            permanently_delete: false,
            api_base_url: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base_url: "https://www.googleapis.com/upload/drive/v3".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            parallel_window: DEFAULT_PARALLEL_WINDOW,
            poll_initial_secs: 8,
            poll_min_secs: 2,
            poll_max_secs: 30,
            poll_backoff_factor: 1.5,
            checkpoint_dir: None,
            checkpoint_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn poll_initial(&self) -> Duration {
        Duration::from_secs(self.poll_initial_secs)
    }

    pub fn poll_min(&self) -> Duration {
        Duration::from_secs(self.poll_min_secs)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_secs(self.poll_max_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Validate the parts the engine cannot default
    pub fn validate(&self) -> crate::Result<()> {
        if self.account_id.is_empty() {
            return Err(crate::SyncError::Config("account_id is required".into()));
        }
        if self.local_root.as_os_str().is_empty() {
            return Err(crate::SyncError::Config("local_root is required".into()));
        }
        if self.parallel_window == 0 {
            return Err(crate::SyncError::Config(
                "parallel_window must be at least 1".into(),
            ));
        }
        if self.poll_min_secs == 0 || self.poll_max_secs < self.poll_min_secs {
            return Err(crate::SyncError::Config(
                "poll interval bounds are inverted".into(),
            ));
        }
        Ok(())
    }
}
