//! Sync controller
//!
//! Orchestrates the engine lifecycle: loads the checkpoint, starts the
//! watcher, re-applies changes that survived the last shutdown, walks the
//! remote tree on first start, downloads in bounded windows, then hands
//! steady state to the change poller and the local event queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use drivesync_core::{Result, SyncConfig, SyncError};

use crate::checkpoint::{CheckpointStore, CheckpointWriter, JsonCheckpointStore};
use crate::events::{EngineEvent, StatusHub, SyncStats, SyncStatus};
use crate::ignore::IgnoreRegistry;
use crate::metadata::MetadataCache;
use crate::paths::PathResolver;
use crate::poller::{ChangePoller, PollerParams};
use crate::queue::LocalEventQueue;
use crate::reconciler::Reconciler;
use crate::record::FileRecord;
use crate::remote::{DriveClient, RemoteDrive};
use crate::state::SyncState;
use crate::watcher::{LocalEvent, LocalWatcher};

pub struct SyncController {
    config: SyncConfig,
    client: Arc<dyn RemoteDrive>,
    store: Arc<dyn CheckpointStore>,
    cache: Arc<MetadataCache>,
    resolver: Arc<PathResolver>,
    ignore: Arc<IgnoreRegistry>,
    reconciler: Arc<Reconciler>,
    hub: Arc<StatusHub>,
    state: Arc<SyncState>,
    writer: Arc<CheckpointWriter>,
    shutdown_tx: broadcast::Sender<()>,
    event_tx: mpsc::UnboundedSender<LocalEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<LocalEvent>>>,
    watcher: Mutex<Option<LocalWatcher>>,
}

impl SyncController {
    /// Wire the engine around explicit collaborators; tests inject fakes
    /// here.
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn RemoteDrive>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(MetadataCache::new(client.clone()));
        let resolver = Arc::new(PathResolver::new(cache.clone(), config.local_root.clone()));
        let ignore = Arc::new(IgnoreRegistry::new());
        let hub = Arc::new(StatusHub::new());
        let state = Arc::new(SyncState::new());
        let reconciler = Arc::new(Reconciler::new(
            client.clone(),
            cache.clone(),
            resolver.clone(),
            ignore.clone(),
            hub.clone(),
            config.permanently_delete,
        ));
        let writer = Arc::new(CheckpointWriter::new(
            store.clone(),
            config.account_id.clone(),
            state.clone(),
            cache.clone(),
            resolver.clone(),
            reconciler.clone(),
            config.checkpoint_interval(),
        ));
        let (shutdown_tx, _) = broadcast::channel(4);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            client,
            store,
            cache,
            resolver,
            ignore,
            reconciler,
            hub,
            state,
            writer,
            shutdown_tx,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            watcher: Mutex::new(None),
        })
    }

    /// Production wiring: REST client plus the JSON checkpoint store
    pub fn with_defaults(config: SyncConfig) -> Result<Self> {
        let client: Arc<dyn RemoteDrive> = Arc::new(DriveClient::new(&config)?);
        let dir = config
            .checkpoint_dir
            .clone()
            .unwrap_or_else(JsonCheckpointStore::default_dir);
        let store: Arc<dyn CheckpointStore> = Arc::new(JsonCheckpointStore::new(dir));
        Self::new(config, client, store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.hub.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.hub.status()
    }

    pub fn stats(&self) -> SyncStats {
        self.hub.stats()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    /// Run the startup sequence and return once the initial download has
    /// completed and steady state is running. `notify` receives
    /// human-readable progress strings.
    pub async fn start<F>(&self, notify: F) -> Result<()>
    where
        F: Fn(String) + Send + Sync,
    {
        notify("Loading sync checkpoint".to_string());
        if let Some(checkpoint) = self.store.load(&self.config.account_id).await? {
            self.cache.restore(checkpoint.file_info.clone());
            self.reconciler
                .restore_materialized(checkpoint.materialized());
            if let Some(token) = checkpoint.change_token.clone() {
                self.state.set_token(token);
            }
            self.state.set_pending(checkpoint.changes_to_execute.clone());
            if !checkpoint.root_id.is_empty() {
                self.resolver.set_root_id(checkpoint.root_id.clone());
            }
            self.state.set_synced(checkpoint.synced);
            info!(
                records = self.cache.len(),
                pending = checkpoint.changes_to_execute.len(),
                "Checkpoint restored"
            );
        }

        self.resolve_root_id().await?;
        tokio::fs::create_dir_all(&self.config.local_root).await?;

        // Watcher comes up before any mutation; its events buffer in the
        // unbounded channel until the queue consumer starts
        {
            let watcher = LocalWatcher::start(
                &self.config.local_root,
                self.ignore.clone(),
                self.event_tx.clone(),
            )?;
            *self.watcher.lock() = Some(watcher);
        }

        // Changes that were fetched but unapplied when we last stopped.
        // They stay pending until every one has re-applied, so a crash here
        // repeats the same recovery.
        let survivors = self.state.pending_snapshot();
        if !survivors.is_empty() {
            notify(format!("Re-applying {} pending changes", survivors.len()));
            self.hub.set_status(SyncStatus::ApplyingRemoteChange);
            for change in &survivors {
                self.reconciler.apply_remote_change(change).await?;
            }
            self.state.take_pending();
            self.hub.set_status(SyncStatus::Idle);
            self.writer.save_now().await?;
        }

        // Adopt a start token before walking so changes racing the walk
        // land in the feed
        if self.state.token().is_none() {
            let token = self.client.start_page_token().await?;
            self.state.set_token(token);
        }

        if !self.state.is_synced() {
            self.initial_sync(&notify).await?;
        }

        self.state.set_synced(true);
        self.writer.save_now().await?;
        self.hub.set_status(SyncStatus::Idle);

        self.spawn_steady_state();
        notify("Sync engine ready".to_string());
        Ok(())
    }

    /// Terminate the poller and queue at their next suspension point and
    /// write a final checkpoint.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.writer.save_now().await {
            warn!("Final checkpoint write failed: {}", e);
        }
        *self.watcher.lock() = None;
        info!("Sync engine closed");
    }

    /// Drop the persisted checkpoint; the next start performs a full
    /// initial sync.
    pub async fn erase(&self) -> Result<()> {
        self.store.erase(&self.config.account_id).await
    }

    async fn resolve_root_id(&self) -> Result<()> {
        if !self.resolver.root_id().is_empty() {
            return Ok(());
        }
        let root_id = match &self.config.remote_root_id {
            Some(id) => id.clone(),
            // The service resolves the "root" alias to the real folder id
            None => match self.client.get_record("root").await? {
                Some(record) => record.id,
                None => {
                    return Err(SyncError::Config(
                        "remote root folder could not be resolved".into(),
                    ))
                }
            },
        };
        self.resolver.set_root_id(root_id.clone());
        // Warm the root record so the cache holds the full parent chain
        let _ = self.cache.get(&root_id).await;
        Ok(())
    }

    /// Walk the remote tree, materialize every path, download missing
    /// content in bounded windows.
    async fn initial_sync<F>(&self, notify: &F) -> Result<()>
    where
        F: Fn(String) + Send + Sync,
    {
        self.hub.set_status(SyncStatus::InitialSync);
        notify("Walking remote folder tree".to_string());

        let mut folders = vec![self.resolver.root_id()];
        let mut downloads: Vec<FileRecord> = Vec::new();
        let mut folder_records: Vec<FileRecord> = Vec::new();
        let mut contentless: Vec<FileRecord> = Vec::new();

        while let Some(folder_id) = folders.pop() {
            let mut page_token: Option<String> = None;
            loop {
                let list = self
                    .client
                    .list_children(&folder_id, page_token.as_deref())
                    .await?;
                for record in list.files {
                    self.cache.store(record.clone());
                    if record.is_folder() {
                        folders.push(record.id.clone());
                        folder_records.push(record);
                    } else if record.is_downloadable() {
                        downloads.push(record);
                    } else {
                        contentless.push(record);
                    }
                }
                match list.next_page_token {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }
        }
        notify(format!(
            "Found {} folders and {} files",
            folder_records.len(),
            downloads.len()
        ));

        // One bulk parent prefetch so the path walks below stay cache-only
        let everything: Vec<FileRecord> = self.cache.snapshot().into_values().collect();
        self.resolver.prefetch_parents(&everything).await?;

        for record in &folder_records {
            self.reconciler.add_locally(record).await?;
        }
        // Contentless records land in the index but own no bytes on disk
        for record in &contentless {
            self.reconciler.add_locally(record).await?;
        }

        let total = downloads.len();
        let mut done = 0usize;
        for window in downloads.chunks(self.config.parallel_window) {
            // Prefetch this window's parents in one batch; cache-only after
            // the bulk pass, but a changed feed entry may have widened the
            // closure
            self.resolver.prefetch_parents(window).await?;
            let results =
                futures::future::join_all(window.iter().map(|r| self.reconciler.add_locally(r)))
                    .await;
            for result in results {
                result?;
            }
            done += window.len();
            notify(format!("Downloaded {}/{} files", done, total));
        }

        self.writer.note_changes(1);
        info!(
            records = self.cache.len(),
            downloads = total,
            "Initial sync finished"
        );
        Ok(())
    }

    fn spawn_steady_state(&self) {
        if let Some(event_rx) = self.event_rx.lock().take() {
            let queue = LocalEventQueue::new(
                event_rx,
                self.reconciler.clone(),
                self.hub.clone(),
                self.writer.clone(),
                self.shutdown_tx.clone(),
            );
            tokio::spawn(queue.run());

            let poller = ChangePoller::new(
                self.client.clone(),
                self.reconciler.clone(),
                self.hub.clone(),
                self.state.clone(),
                self.writer.clone(),
                PollerParams::from_config(&self.config),
                self.config.parallel_window,
                self.shutdown_tx.subscribe(),
            );
            tokio::spawn(poller.run());
        }
    }

    /// Test and diagnostic access to the engine internals
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    pub fn change_token(&self) -> Option<String> {
        self.state.token()
    }
}
