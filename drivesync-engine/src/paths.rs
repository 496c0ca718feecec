//! Path materialization
//!
//! The remote namespace is a multi-parent DAG; the local namespace is a
//! tree. Every record materializes at one local path per parent chain that
//! reaches the configured root, and the first parent's path is canonical.
//! The reverse index (local path -> remote id) lives here too.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::warn;

use drivesync_core::Result;

use crate::metadata::MetadataCache;
use crate::record::FileRecord;

pub struct PathResolver {
    cache: Arc<MetadataCache>,
    local_root: PathBuf,
    root_id: RwLock<String>,
    index: Mutex<HashMap<PathBuf, String>>,
}

impl PathResolver {
    pub fn new(cache: Arc<MetadataCache>, local_root: PathBuf) -> Self {
        Self {
            cache,
            local_root,
            root_id: RwLock::new(String::new()),
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_root_id(&self, id: String) {
        *self.root_id.write() = id;
    }

    pub fn root_id(&self) -> String {
        self.root_id.read().clone()
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// All local paths for `record`, walking parents through the side
    /// cache, the metadata cache, and finally a remote fetch. Callers that
    /// materialize many records first run [`prefetch_parents`] so the walk
    /// is cache-only.
    ///
    /// [`prefetch_parents`]: PathResolver::prefetch_parents
    pub fn paths_of<'a>(&'a self, record: &'a FileRecord) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        async move {
            if record.id == *self.root_id.read() {
                return Ok(vec![self.local_root.clone()]);
            }
            if record.parents.is_empty() {
                return Ok(Vec::new());
            }

            let mut paths = Vec::new();
            for parent_id in &record.parents {
                let parent = match self.resolve_parent(parent_id).await? {
                    Some(parent) => parent,
                    None => continue,
                };
                for parent_path in self.paths_of(&parent).await? {
                    paths.push(parent_path.join(&record.name));
                }
            }
            Ok(paths)
        }
        .boxed()
    }

    async fn resolve_parent(&self, id: &str) -> Result<Option<FileRecord>> {
        if id == *self.root_id.read() {
            // Synthetic record standing in for the root folder
            return Ok(Some(FileRecord {
                id: id.to_string(),
                name: String::new(),
                mime_type: crate::record::FOLDER_MIME_TYPE.to_string(),
                md5_checksum: None,
                size: None,
                modified_time: String::new(),
                parents: Vec::new(),
                trashed: false,
            }));
        }
        if let Some(parent) = self.cache.parent_lookup(id) {
            return Ok(Some(parent));
        }
        self.cache.get(id).await
    }

    /// Fetch the transitive parent closure of `records` in batched rounds
    /// so later `paths_of` walks never touch the remote.
    pub async fn prefetch_parents(&self, records: &[FileRecord]) -> Result<()> {
        let root_id = self.root_id();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: HashSet<String> = records
            .iter()
            .flat_map(|r| r.parents.iter().cloned())
            .filter(|p| *p != root_id)
            .collect();

        while !pending.is_empty() {
            let batch: Vec<String> = pending
                .drain()
                .filter(|id| seen.insert(id.clone()))
                .collect();
            if batch.is_empty() {
                break;
            }

            let resolved = self.cache.get_many(&batch).await;
            for parent in resolved.values().flatten() {
                for grandparent in &parent.parents {
                    if *grandparent != root_id && !seen.contains(grandparent) {
                        pending.insert(grandparent.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Materialize paths for `record` and register them in the index.
    /// Sibling name collisions resolve last-writer-wins by modified time.
    pub async fn record_paths(&self, record: &FileRecord) -> Result<Vec<PathBuf>> {
        let paths = self.paths_of(record).await?;
        let mut index = self.index.lock();
        for path in &paths {
            let existing_id = index.get(path).cloned();
            match existing_id {
                Some(existing_id) if existing_id != record.id => {
                    let keep_new = self
                        .cache
                        .lookup(&existing_id)
                        .map(|existing| existing.modified_time <= record.modified_time)
                        .unwrap_or(true);
                    if keep_new {
                        warn!(
                            path = %path.display(),
                            old = %existing_id,
                            new = %record.id,
                            "Sibling name collision, newer record wins"
                        );
                        index.insert(path.clone(), record.id.clone());
                    }
                }
                _ => {
                    index.insert(path.clone(), record.id.clone());
                }
            }
        }
        Ok(paths)
    }

    /// Reverse lookup: which remote id does this local path map to
    pub fn id_at(&self, path: &Path) -> Option<String> {
        self.index.lock().get(path).cloned()
    }

    /// Remove every index entry pointing at `id`; called when a record is
    /// removed (stale entries are never cleaned during path updates)
    pub fn drop_id(&self, id: &str) {
        self.index.lock().retain(|_, mapped| mapped != id);
    }

    pub fn drop_path(&self, path: &Path) {
        self.index.lock().remove(path);
    }

    /// Direct insert used when rebasing entries after a directory move;
    /// collisions were resolved when the entry first landed
    pub(crate) fn insert_index(&self, path: PathBuf, id: String) {
        self.index.lock().insert(path, id);
    }

    pub fn index_snapshot(&self) -> HashMap<PathBuf, String> {
        self.index.lock().clone()
    }
}
