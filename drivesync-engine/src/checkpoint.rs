//! Durable sync checkpoint
//!
//! Snapshots everything needed to reconstruct the reconciler without
//! re-walking the remote tree: change token, metadata cache, materialized
//! set, root id, and the changes fetched but not yet applied. One record
//! per account, keyed `{type: "sync", accountId}`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use drivesync_core::{Result, SyncError};

use crate::metadata::MetadataCache;
use crate::paths::PathResolver;
use crate::record::{Change, FileRecord};
use crate::reconciler::Reconciler;
use crate::state::SyncState;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(rename = "type")]
    pub kind: String,

    pub account_id: String,

    pub change_token: Option<String>,

    /// The metadata cache, id -> record
    pub file_info: HashMap<String, FileRecord>,

    pub synced: bool,

    pub root_id: String,

    /// Changes fetched but not applied when the engine last stopped
    pub changes_to_execute: Vec<Change>,

    /// Materialized set. Keys are base64 (url-safe, unpadded) encoded
    /// absolute paths: the underlying store disallows path separators in
    /// keys.
    pub on_local_drive: HashMap<String, bool>,
}

impl Checkpoint {
    pub fn new(account_id: &str) -> Self {
        Self {
            kind: "sync".to_string(),
            account_id: account_id.to_string(),
            ..Default::default()
        }
    }

    pub fn set_materialized(&mut self, paths: &HashSet<PathBuf>) {
        self.on_local_drive = paths
            .iter()
            .map(|p| (URL_SAFE_NO_PAD.encode(p.to_string_lossy().as_bytes()), true))
            .collect();
    }

    pub fn materialized(&self) -> HashSet<PathBuf> {
        self.on_local_drive
            .keys()
            .filter_map(|key| {
                URL_SAFE_NO_PAD
                    .decode(key)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .map(PathBuf::from)
            .collect()
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<Checkpoint>>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn erase(&self, account_id: &str) -> Result<()>;
}

/// JSON-file implementation. Saves are serialized behind a mutex and
/// written atomically (temp file, fsync, rename).
pub struct JsonCheckpointStore {
    dir: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
}

impl JsonCheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Platform data dir fallback when the config names no directory
    pub fn default_dir() -> PathBuf {
        directories::ProjectDirs::from("com", "drivesync", "drivesync")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("checkpoints")
    }

    fn file_for(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("sync-{}.json", account_id))
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn load(&self, account_id: &str) -> Result<Option<Checkpoint>> {
        let _guard = self.io_lock.lock().await;
        let path = self.file_for(account_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| SyncError::Persistence(format!("read checkpoint: {}", e)))?;
        let checkpoint = serde_json::from_str(&json)
            .map_err(|e| SyncError::Persistence(format!("parse checkpoint: {}", e)))?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.io_lock.lock().await;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncError::Persistence(format!("create checkpoint dir: {}", e)))?;

        let path = self.file_for(&checkpoint.account_id);
        let temp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| SyncError::Persistence(format!("serialize checkpoint: {}", e)))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await
            .map_err(|e| SyncError::Persistence(format!("create temp checkpoint: {}", e)))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| SyncError::Persistence(format!("write checkpoint: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| SyncError::Persistence(format!("sync checkpoint: {}", e)))?;
        drop(file);

        fs::rename(&temp, &path)
            .await
            .map_err(|e| SyncError::Persistence(format!("rename checkpoint: {}", e)))?;

        debug!(account = %checkpoint.account_id, "Checkpoint saved");
        Ok(())
    }

    async fn erase(&self, account_id: &str) -> Result<()> {
        let _guard = self.io_lock.lock().await;
        let path = self.file_for(account_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Persistence(format!("erase checkpoint: {}", e))),
        }
    }
}

/// Assembles checkpoints from the live engine state and writes them
/// through the store, honoring the write throttle. Shared by the
/// controller, the poller, and the local event queue.
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    account_id: String,
    state: Arc<SyncState>,
    cache: Arc<MetadataCache>,
    resolver: Arc<PathResolver>,
    reconciler: Arc<Reconciler>,
    throttle: CheckpointThrottle,
}

impl CheckpointWriter {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        account_id: String,
        state: Arc<SyncState>,
        cache: Arc<MetadataCache>,
        resolver: Arc<PathResolver>,
        reconciler: Arc<Reconciler>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            account_id,
            state,
            cache,
            resolver,
            reconciler,
            throttle: CheckpointThrottle::new(interval),
        }
    }

    fn capture(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(&self.account_id);
        checkpoint.change_token = self.state.token();
        checkpoint.file_info = self.cache.snapshot();
        checkpoint.synced = self.state.is_synced();
        checkpoint.root_id = self.resolver.root_id();
        checkpoint.changes_to_execute = self.state.pending_snapshot();
        checkpoint.set_materialized(&self.reconciler.materialized_snapshot());
        checkpoint
    }

    pub fn note_changes(&self, n: u64) {
        self.throttle.note_changes(n);
    }

    /// Unconditional write; used where the change token is about to
    /// advance and at shutdown
    pub async fn save_now(&self) -> Result<()> {
        let checkpoint = self.capture();
        self.store.save(&checkpoint).await?;
        self.throttle.mark_saved();
        Ok(())
    }

    /// Throttled write; persistence errors are reported, not propagated,
    /// so a flaky disk cannot stall the apply path
    pub async fn save_if_due(&self) {
        if !self.throttle.is_due() {
            return;
        }
        if let Err(e) = self.save_now().await {
            warn!("Throttled checkpoint write failed: {}", e);
        }
    }
}

/// Throttles checkpoint writes during heavy change streams: a write is due
/// only when changes have accumulated and the interval has elapsed.
pub struct CheckpointThrottle {
    interval: Duration,
    last_save: Mutex<Instant>,
    pending: Mutex<u64>,
}

impl CheckpointThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_save: Mutex::new(Instant::now()),
            pending: Mutex::new(0),
        }
    }

    pub fn note_changes(&self, n: u64) {
        *self.pending.lock() += n;
    }

    pub fn is_due(&self) -> bool {
        *self.pending.lock() > 0 && self.last_save.lock().elapsed() >= self.interval
    }

    pub fn mark_saved(&self) {
        *self.pending.lock() = 0;
        *self.last_save.lock() = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> FileRecord {
        FileRecord {
            id: "f1".into(),
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            md5_checksum: Some("h1".into()),
            size: Some(3),
            modified_time: "2024-05-01T10:00:00.000Z".into(),
            parents: vec!["root-1".into()],
            trashed: false,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path().to_path_buf());

        let mut checkpoint = Checkpoint::new("acct");
        checkpoint.change_token = Some("42".into());
        checkpoint.root_id = "root-1".into();
        checkpoint.synced = true;
        checkpoint.file_info.insert("f1".into(), sample_record());
        let mut paths = HashSet::new();
        paths.insert(PathBuf::from("/sync/F/a.txt"));
        checkpoint.set_materialized(&paths);

        store.save(&checkpoint).await.unwrap();
        let loaded = store.load("acct").await.unwrap().unwrap();

        assert_eq!(loaded.kind, "sync");
        assert_eq!(loaded.change_token.as_deref(), Some("42"));
        assert_eq!(loaded.root_id, "root-1");
        assert!(loaded.synced);
        assert_eq!(loaded.file_info.len(), 1);
        assert_eq!(loaded.materialized(), paths);
    }

    #[tokio::test]
    async fn load_missing_account_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path().to_path_buf());
        assert!(store.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn erase_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path().to_path_buf());

        let checkpoint = Checkpoint::new("acct");
        store.save(&checkpoint).await.unwrap();
        store.erase("acct").await.unwrap();
        store.erase("acct").await.unwrap();
        assert!(store.load("acct").await.unwrap().is_none());
    }

    #[test]
    fn materialized_keys_avoid_path_separators() {
        let mut checkpoint = Checkpoint::new("acct");
        let mut paths = HashSet::new();
        paths.insert(PathBuf::from("/sync/F/a.txt"));
        checkpoint.set_materialized(&paths);

        for key in checkpoint.on_local_drive.keys() {
            assert!(!key.contains('/'), "key {} contains a separator", key);
        }
    }

    #[test]
    fn throttle_requires_pending_changes() {
        let throttle = CheckpointThrottle::new(Duration::from_secs(0));
        assert!(!throttle.is_due());
        throttle.note_changes(1);
        assert!(throttle.is_due());
        throttle.mark_saved();
        assert!(!throttle.is_due());
    }

    #[test]
    fn throttle_respects_interval() {
        let throttle = CheckpointThrottle::new(Duration::from_secs(3600));
        throttle.note_changes(5);
        assert!(!throttle.is_due());
    }
}
