//! Shared test fixtures: an in-memory drive and a wired engine harness.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use drivesync_core::{md5_of_bytes, Result, SyncError};
use drivesync_engine::events::StatusHub;
use drivesync_engine::ignore::IgnoreRegistry;
use drivesync_engine::metadata::MetadataCache;
use drivesync_engine::paths::PathResolver;
use drivesync_engine::reconciler::Reconciler;
use drivesync_engine::record::{Change, ChangePage, FileList, FileRecord, RecordPatch};
use drivesync_engine::remote::RemoteDrive;

pub const ROOT_ID: &str = "root-1";

#[derive(Default)]
struct DriveState {
    records: HashMap<String, FileRecord>,
    contents: HashMap<String, Vec<u8>>,
    /// Full change log; tokens index into it
    changes: Vec<Change>,
    next_id: u64,
    clock: u64,
    pub downloads: u64,
    pub content_updates: u64,
    pub creates: u64,
}

impl DriveState {
    fn timestamp(&mut self) -> String {
        self.clock += 1;
        format!("2024-07-01T00:00:{:02}.000Z", self.clock.min(59))
    }

    fn log_change(&mut self, record: &FileRecord) {
        self.changes.push(Change {
            file_id: record.id.clone(),
            removed: false,
            file: Some(record.clone()),
        });
    }
}

/// In-memory stand-in for the cloud service. Mutations append to a change
/// log the same way the real feed would report them.
pub struct FakeDrive {
    state: Mutex<DriveState>,
}

impl FakeDrive {
    pub fn new() -> Arc<Self> {
        let mut state = DriveState::default();
        state.records.insert(
            ROOT_ID.to_string(),
            FileRecord {
                id: ROOT_ID.to_string(),
                name: "My Drive".to_string(),
                mime_type: "application/vnd.google-apps.folder".to_string(),
                md5_checksum: None,
                size: None,
                modified_time: "2024-07-01T00:00:00.000Z".to_string(),
                parents: Vec::new(),
                trashed: false,
            },
        );
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn seed_folder(&self, id: &str, name: &str, parents: &[&str]) -> FileRecord {
        let mut state = self.state.lock();
        let record = FileRecord {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: "application/vnd.google-apps.folder".to_string(),
            md5_checksum: None,
            size: None,
            modified_time: state.timestamp(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            trashed: false,
        };
        state.records.insert(id.to_string(), record.clone());
        record
    }

    pub fn seed_file(&self, id: &str, name: &str, parents: &[&str], content: &[u8]) -> FileRecord {
        let mut state = self.state.lock();
        let record = FileRecord {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
            md5_checksum: Some(md5_of_bytes(content)),
            size: Some(content.len() as u64),
            modified_time: state.timestamp(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            trashed: false,
        };
        state.records.insert(id.to_string(), record.clone());
        state.contents.insert(id.to_string(), content.to_vec());
        record
    }

    /// Server-side mutations, each reported through the change feed

    pub fn push_add(&self, id: &str, name: &str, parents: &[&str], content: &[u8]) -> Change {
        let record = self.seed_file(id, name, parents, content);
        let mut state = self.state.lock();
        state.log_change(&record);
        state.changes.last().unwrap().clone()
    }

    pub fn push_rename(&self, id: &str, new_name: &str) -> Change {
        let mut state = self.state.lock();
        let timestamp = state.timestamp();
        let record = state.records.get_mut(id).expect("record exists");
        record.name = new_name.to_string();
        record.modified_time = timestamp;
        let record = record.clone();
        state.log_change(&record);
        state.changes.last().unwrap().clone()
    }

    pub fn push_move(&self, id: &str, parents: &[&str]) -> Change {
        let mut state = self.state.lock();
        let timestamp = state.timestamp();
        let record = state.records.get_mut(id).expect("record exists");
        record.parents = parents.iter().map(|p| p.to_string()).collect();
        record.modified_time = timestamp;
        let record = record.clone();
        state.log_change(&record);
        state.changes.last().unwrap().clone()
    }

    pub fn push_content(&self, id: &str, content: &[u8]) -> Change {
        let mut state = self.state.lock();
        let timestamp = state.timestamp();
        let record = state.records.get_mut(id).expect("record exists");
        record.md5_checksum = Some(md5_of_bytes(content));
        record.size = Some(content.len() as u64);
        record.modified_time = timestamp;
        let record = record.clone();
        state.contents.insert(id.to_string(), content.to_vec());
        state.log_change(&record);
        state.changes.last().unwrap().clone()
    }

    pub fn push_trash(&self, id: &str) -> Change {
        let mut state = self.state.lock();
        let timestamp = state.timestamp();
        let record = state.records.get_mut(id).expect("record exists");
        record.trashed = true;
        record.modified_time = timestamp;
        let record = record.clone();
        state.log_change(&record);
        state.changes.last().unwrap().clone()
    }

    pub fn push_remove(&self, id: &str) -> Change {
        let mut state = self.state.lock();
        state.records.remove(id);
        state.contents.remove(id);
        state.changes.push(Change {
            file_id: id.to_string(),
            removed: true,
            file: None,
        });
        state.changes.last().unwrap().clone()
    }

    /// Observation helpers

    pub fn record(&self, id: &str) -> Option<FileRecord> {
        self.state.lock().records.get(id).cloned()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().contents.get(id).cloned()
    }

    pub fn downloads(&self) -> u64 {
        self.state.lock().downloads
    }

    pub fn content_updates(&self) -> u64 {
        self.state.lock().content_updates
    }

    pub fn creates(&self) -> u64 {
        self.state.lock().creates
    }

    pub fn record_by_name(&self, name: &str) -> Option<FileRecord> {
        self.state
            .lock()
            .records
            .values()
            .find(|r| r.name == name)
            .cloned()
    }
}

#[async_trait]
impl RemoteDrive for FakeDrive {
    async fn get_record(&self, id: &str) -> Result<Option<FileRecord>> {
        let state = self.state.lock();
        if id == "root" {
            return Ok(state.records.get(ROOT_ID).cloned());
        }
        Ok(state.records.get(id).cloned())
    }

    async fn list_children(&self, parent_id: &str, _page_token: Option<&str>) -> Result<FileList> {
        let state = self.state.lock();
        let files = state
            .records
            .values()
            .filter(|r| !r.trashed && r.parents.iter().any(|p| p == parent_id))
            .cloned()
            .collect();
        Ok(FileList {
            files,
            next_page_token: None,
        })
    }

    async fn create_file(
        &self,
        metadata: RecordPatch,
        content: Option<Vec<u8>>,
    ) -> Result<FileRecord> {
        let mut state = self.state.lock();
        state.creates += 1;
        state.next_id += 1;
        let id = format!("gen-{}", state.next_id);
        let timestamp = state.timestamp();

        let bytes = content.unwrap_or_default();
        let is_folder = metadata
            .mime_type
            .as_deref()
            .map(|m| m.contains("folder"))
            .unwrap_or(false);

        let record = FileRecord {
            id: id.clone(),
            name: metadata.name.unwrap_or_default(),
            mime_type: metadata
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            md5_checksum: (!is_folder).then(|| md5_of_bytes(&bytes)),
            size: (!is_folder).then(|| bytes.len() as u64),
            modified_time: timestamp,
            parents: metadata.parents,
            trashed: false,
        };
        state.records.insert(id.clone(), record.clone());
        if !is_folder {
            state.contents.insert(id, bytes);
        }
        state.log_change(&record);
        Ok(record)
    }

    async fn update_content(&self, id: &str, content: Vec<u8>) -> Result<FileRecord> {
        let mut state = self.state.lock();
        state.content_updates += 1;
        let timestamp = state.timestamp();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        record.md5_checksum = Some(md5_of_bytes(&content));
        record.size = Some(content.len() as u64);
        record.modified_time = timestamp;
        let record = record.clone();
        state.contents.insert(id.to_string(), content);
        state.log_change(&record);
        Ok(record)
    }

    async fn update_metadata(&self, id: &str, patch: RecordPatch) -> Result<FileRecord> {
        let mut state = self.state.lock();
        let timestamp = state.timestamp();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        if let Some(name) = patch.name {
            record.name = name;
        }
        if !patch.parents.is_empty() {
            record.parents = patch.parents;
        }
        if let Some(trashed) = patch.trashed {
            record.trashed = trashed;
        }
        record.modified_time = timestamp;
        let record = record.clone();
        state.log_change(&record);
        Ok(record)
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.records.remove(id);
        state.contents.remove(id);
        state.changes.push(Change {
            file_id: id.to_string(),
            removed: true,
            file: None,
        });
        Ok(())
    }

    async fn trash_record(&self, id: &str) -> Result<FileRecord> {
        let mut state = self.state.lock();
        let timestamp = state.timestamp();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        record.trashed = true;
        record.modified_time = timestamp;
        let record = record.clone();
        state.log_change(&record);
        Ok(record)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.downloads += 1;
        state
            .contents
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    async fn changes_since(&self, token: &str, _page_token: Option<&str>) -> Result<ChangePage> {
        let state = self.state.lock();
        let from: usize = token
            .parse()
            .map_err(|_| SyncError::Remote(format!("bad token {}", token)))?;
        Ok(ChangePage {
            changes: state.changes.get(from..).unwrap_or_default().to_vec(),
            next_page_token: None,
            new_start_page_token: Some(state.changes.len().to_string()),
        })
    }

    async fn start_page_token(&self) -> Result<String> {
        Ok(self.state.lock().changes.len().to_string())
    }
}

/// A reconciler wired to a fake drive and a temp directory, without the
/// controller, watcher, or poller in the way.
pub struct Harness {
    pub local: TempDir,
    pub drive: Arc<FakeDrive>,
    pub cache: Arc<MetadataCache>,
    pub resolver: Arc<PathResolver>,
    pub ignore: Arc<IgnoreRegistry>,
    pub hub: Arc<StatusHub>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new(drive: Arc<FakeDrive>) -> Self {
        Self::with_delete_mode(drive, false)
    }

    pub fn with_delete_mode(drive: Arc<FakeDrive>, permanently_delete: bool) -> Self {
        let local = TempDir::new().unwrap();
        let client: Arc<dyn RemoteDrive> = drive.clone();
        let cache = Arc::new(MetadataCache::new(client.clone()));
        let resolver = Arc::new(PathResolver::new(
            cache.clone(),
            local.path().to_path_buf(),
        ));
        resolver.set_root_id(ROOT_ID.to_string());
        let ignore = Arc::new(IgnoreRegistry::new());
        let hub = Arc::new(StatusHub::new());
        let reconciler = Arc::new(Reconciler::new(
            client,
            cache.clone(),
            resolver.clone(),
            ignore.clone(),
            hub.clone(),
            permanently_delete,
        ));
        Self {
            local,
            drive,
            cache,
            resolver,
            ignore,
            hub,
            reconciler,
        }
    }

    /// Materialize everything currently on the fake drive, folders first
    pub async fn bootstrap(&self) {
        let mut records: Vec<FileRecord> = Vec::new();
        let mut queue = vec![ROOT_ID.to_string()];
        while let Some(parent) = queue.pop() {
            let list = self.drive.list_children(&parent, None).await.unwrap();
            for record in list.files {
                if record.is_folder() {
                    queue.push(record.id.clone());
                }
                records.push(record);
            }
        }
        records.sort_by_key(|r| !r.is_folder());
        for record in records {
            self.reconciler.add_locally(&record).await.unwrap();
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.local.path().join(rel)
    }

    pub fn read(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.path(rel)).unwrap()
    }

    /// Drain any ignore tokens the bootstrap left behind so echo tests
    /// start clean
    pub fn drain_ignore(&self, rels: &[&str]) {
        for rel in rels {
            while self.ignore.consume(&self.path(rel)) {}
        }
    }
}
