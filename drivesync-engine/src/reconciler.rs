//! Reconciler
//!
//! Applies one remote change or one local event to both sides of the sync
//! pair. Remote changes mutate the local tree (downloads, renames, copies,
//! deletions); local events mutate the remote store (uploads, metadata
//! patches, trash/delete). Every filesystem write is pre-declared through
//! the ignore registry so the watcher drops the echo.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, info, warn};

use drivesync_core::{md5_of_file, Result, SyncError};

use crate::events::StatusHub;
use crate::ignore::IgnoreRegistry;
use crate::metadata::MetadataCache;
use crate::paths::PathResolver;
use crate::record::{Change, FileRecord, RecordPatch, FOLDER_MIME_TYPE};
use crate::remote::RemoteDrive;
use crate::watcher::LocalEvent;

/// Path delta between two materializations of the same record
#[derive(Debug, Default, PartialEq)]
pub struct PathDelta {
    pub removed: Vec<PathBuf>,
    pub added: Vec<PathBuf>,
}

/// Entries in `old` but not `new` are removals; entries in `new` but not
/// `old` are additions. Order is preserved so removals pair with additions
/// by index.
pub fn compute_delta(old: &[PathBuf], new: &[PathBuf]) -> PathDelta {
    PathDelta {
        removed: old.iter().filter(|p| !new.contains(p)).cloned().collect(),
        added: new.iter().filter(|p| !old.contains(p)).cloned().collect(),
    }
}

pub struct Reconciler {
    client: Arc<dyn RemoteDrive>,
    cache: Arc<MetadataCache>,
    resolver: Arc<PathResolver>,
    ignore: Arc<IgnoreRegistry>,
    hub: Arc<StatusHub>,
    /// Local paths the engine believes it has written
    materialized: Mutex<HashSet<PathBuf>>,
    permanently_delete: bool,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn RemoteDrive>,
        cache: Arc<MetadataCache>,
        resolver: Arc<PathResolver>,
        ignore: Arc<IgnoreRegistry>,
        hub: Arc<StatusHub>,
        permanently_delete: bool,
    ) -> Self {
        Self {
            client,
            cache,
            resolver,
            ignore,
            hub,
            materialized: Mutex::new(HashSet::new()),
            permanently_delete,
        }
    }

    pub fn materialized_snapshot(&self) -> HashSet<PathBuf> {
        self.materialized.lock().clone()
    }

    pub fn restore_materialized(&self, paths: HashSet<PathBuf>) {
        *self.materialized.lock() = paths;
    }

    pub fn is_materialized(&self, path: &Path) -> bool {
        self.materialized.lock().contains(path)
    }

    // ------------------------------------------------------------------
    // Remote -> local
    // ------------------------------------------------------------------

    /// Apply one change-feed entry. Returns true when the local tree
    /// actually changed. Safe to re-apply: an already-applied change is a
    /// no-op.
    pub async fn apply_remote_change(&self, change: &Change) -> Result<bool> {
        self.hub.record_remote_apply();

        if change.is_removal() {
            let id = if change.file_id.is_empty() {
                change.file.as_ref().map(|f| f.id.as_str()).unwrap_or("")
            } else {
                change.file_id.as_str()
            };
            return self.remove_locally(id).await;
        }

        let record = match &change.file {
            Some(record) => record.clone(),
            None => return Ok(false),
        };

        let old = self.cache.lookup(&record.id);
        let applied = match old {
            None => self.add_locally(&record).await,
            Some(old) => self.update_locally(&old, &record).await,
        };
        match applied {
            // The record vanished between the change and our download; the
            // feed will deliver the removal next
            Err(SyncError::NotFound(_)) => {
                warn!(id = %record.id, "Record disappeared mid-apply");
                Ok(false)
            }
            other => other,
        }
    }

    /// Remove every materialization of `id` from disk and forget the
    /// record. Returns true iff at least one file was actually removed.
    pub async fn remove_locally(&self, id: &str) -> Result<bool> {
        let record = match self.cache.lookup(id) {
            Some(record) => record,
            None => return Ok(false),
        };

        let paths = self.resolver.paths_of(&record).await?;
        let mut changed = false;
        for path in &paths {
            if self.delete_path(path, record.is_folder()).await? {
                changed = true;
            }
            self.materialized.lock().remove(path);
            if record.is_folder() {
                self.forget_prefix(path);
            }
        }

        self.resolver.drop_id(id);
        self.cache.remove(id);
        if changed {
            self.hub.note_removed(paths.len() as u64);
            info!(id = %id, "Removed locally");
        }
        Ok(changed)
    }

    /// Materialize a record the engine has never seen. Returns true iff at
    /// least one path was written.
    pub async fn add_locally(&self, record: &FileRecord) -> Result<bool> {
        self.cache.store(record.clone());
        let paths = self.resolver.record_paths(record).await?;
        if paths.is_empty() {
            return Ok(false);
        }

        let changed = if record.is_folder() {
            let mut created = false;
            for path in &paths {
                created |= self.ensure_dir(path).await?;
                self.materialized.lock().insert(path.clone());
            }
            created
        } else if record.is_downloadable() {
            self.download_record(record, &paths).await?
        } else {
            // No downloadable content; the record exists only in the index
            false
        };

        if changed {
            self.hub.note_added(1);
            debug!(id = %record.id, name = %record.name, "Added locally");
        }
        Ok(changed)
    }

    async fn update_locally(&self, old: &FileRecord, new: &FileRecord) -> Result<bool> {
        self.cache.store(new.clone());

        if old.name == new.name
            && old.parents == new.parents
            && new.modified_time <= old.modified_time
        {
            return Ok(false);
        }

        let old_paths = self.resolver.paths_of(old).await?;
        let new_paths = self.resolver.record_paths(new).await?;

        if old_paths.is_empty() && new_paths.is_empty() {
            return Ok(false);
        }

        if old.md5_checksum != new.md5_checksum {
            // Content changed: drop the old materializations, redownload
            for path in &old_paths {
                self.delete_path(path, old.is_folder()).await?;
                self.materialized.lock().remove(path);
                if !new_paths.contains(path) {
                    self.resolver.drop_path(path);
                }
            }
            let changed = if new.is_downloadable() {
                self.download_record(new, &new_paths).await?
            } else {
                false
            };
            if changed {
                self.hub.note_updated(1);
            }
            return Ok(changed);
        }

        if old_paths.is_empty() {
            let changed = if new.is_folder() {
                let mut created = false;
                for path in &new_paths {
                    created |= self.ensure_dir(path).await?;
                    self.materialized.lock().insert(path.clone());
                }
                created
            } else if new.is_downloadable() {
                self.download_record(new, &new_paths).await?
            } else {
                false
            };
            if changed {
                self.hub.note_added(1);
            }
            return Ok(changed);
        }

        if old_paths == new_paths {
            return Ok(false);
        }

        let changed = self.apply_path_delta(&old_paths, &new_paths, new).await?;
        if changed {
            self.hub.note_updated(1);
        }
        Ok(changed)
    }

    /// Move/copy/remove files so the on-disk layout matches the new path
    /// set. Removed and added paths pair by index and become renames;
    /// surplus removals are deleted; surplus additions are copied from the
    /// first surviving path.
    async fn apply_path_delta(
        &self,
        old_paths: &[PathBuf],
        new_paths: &[PathBuf],
        record: &FileRecord,
    ) -> Result<bool> {
        let delta = compute_delta(old_paths, new_paths);
        let pairs = delta.removed.len().min(delta.added.len());
        let mut changed = false;

        for i in 0..pairs {
            let from = &delta.removed[i];
            let to = &delta.added[i];
            if let Some(parent) = to.parent() {
                self.ensure_dir(parent).await?;
            }
            self.ignore.ignore(from);
            self.ignore.ignore(to);
            fs::rename(from, to).await?;
            changed = true;

            let mut materialized = self.materialized.lock();
            materialized.remove(from);
            materialized.insert(to.clone());
            drop(materialized);
            self.resolver.drop_path(from);

            if record.is_folder() {
                // Children moved with the directory; rewrite their entries
                self.rebase_prefix(from, to);
            }
            debug!(from = %from.display(), to = %to.display(), "Renamed");
        }

        for from in delta.removed.iter().skip(pairs) {
            if self.delete_path(from, record.is_folder()).await? {
                changed = true;
            }
            self.materialized.lock().remove(from);
            self.resolver.drop_path(from);
            if record.is_folder() {
                self.forget_prefix(from);
            }
        }

        for to in delta.added.iter().skip(pairs) {
            if let Some(parent) = to.parent() {
                self.ensure_dir(parent).await?;
            }
            if record.is_folder() {
                changed |= self.ensure_dir(to).await?;
            } else if let Some(source) = new_paths.iter().find(|p| p.as_path() != to.as_path() && p.exists()) {
                self.ignore.ignore(to);
                fs::copy(source, to).await?;
                changed = true;
            }
            self.materialized.lock().insert(to.clone());
        }

        Ok(changed)
    }

    /// Download content for `record`, temp-then-rename onto the canonical
    /// (first) path, and copy to every remaining materialization. Skips
    /// work that is already on disk with the right checksum.
    pub async fn download_record(&self, record: &FileRecord, paths: &[PathBuf]) -> Result<bool> {
        let canonical = match paths.first() {
            Some(path) => path,
            None => return Ok(false),
        };
        let wanted = record.md5_checksum.as_deref().unwrap_or_default();
        let mut changed = false;

        if let Some(parent) = canonical.parent() {
            self.ensure_dir(parent).await?;
        }

        let up_to_date = canonical.exists() && md5_of_file(canonical).await? == wanted;
        if !up_to_date {
            let temp = self
                .resolver
                .local_root()
                .join(format!(".{}.tmp", record.name));

            let bytes = self.client.download(&record.id).await?;
            if let Err(e) = self.write_and_rename(&temp, canonical, &bytes).await {
                let _ = fs::remove_file(&temp).await;
                return Err(e);
            }
            self.hub.record_download(bytes.len() as u64);
            changed = true;
        }
        self.materialized.lock().insert(canonical.clone());

        for path in paths.iter().skip(1) {
            if let Some(parent) = path.parent() {
                self.ensure_dir(parent).await?;
            }
            let copy_needed = !path.exists() || md5_of_file(path).await? != wanted;
            if copy_needed {
                self.ignore.ignore(path);
                fs::copy(canonical, path).await?;
                changed = true;
            }
            self.materialized.lock().insert(path.clone());
        }

        Ok(changed)
    }

    async fn write_and_rename(&self, temp: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
        fs::write(temp, bytes).await?;
        self.ignore.ignore(target);
        fs::rename(temp, target).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local -> remote
    // ------------------------------------------------------------------

    /// Apply one watcher event; the local event queue serializes callers.
    pub async fn apply_local_event(&self, event: &LocalEvent) -> Result<()> {
        self.hub.record_local_apply();
        match event {
            LocalEvent::FileAdded(path) => self.local_file_added(path).await,
            LocalEvent::FileChanged(path) => self.local_file_changed(path).await,
            LocalEvent::FileRemoved(path) => self.local_removed(path).await,
            LocalEvent::DirAdded(path) => self.local_dir_added(path).await,
            LocalEvent::DirRemoved(path) => {
                if path == self.resolver.local_root() {
                    return Err(SyncError::RootRemoved);
                }
                self.local_removed(path).await
            }
        }
    }

    async fn local_file_added(&self, path: &Path) -> Result<()> {
        if self.resolver.id_at(path).is_some() {
            return Box::pin(self.local_file_changed(path)).await;
        }

        let parent_id = self.parent_of_path(path)?;
        let name = file_name_of(path)?;
        let bytes = fs::read(path).await?;
        let size = bytes.len() as u64;

        let record = self
            .client
            .create_file(
                RecordPatch {
                    name: Some(name),
                    parents: vec![parent_id],
                    ..Default::default()
                },
                Some(bytes),
            )
            .await?;

        self.register_upload(&record).await?;
        self.hub.record_upload(size);
        self.hub.note_added(1);
        info!(path = %path.display(), id = %record.id, "Uploaded new file");
        Ok(())
    }

    async fn local_file_changed(&self, path: &Path) -> Result<()> {
        let id = match self.resolver.id_at(path) {
            Some(id) => id,
            None => return Box::pin(self.local_file_added(path)).await,
        };
        let record = match self.cache.get(&id).await? {
            Some(record) => record,
            None => return Box::pin(self.local_file_added(path)).await,
        };

        if record.is_folder() || !record.is_downloadable() {
            // Nothing we could upload for a contentless record
            return Ok(());
        }

        let on_disk = md5_of_file(path).await?;
        if Some(on_disk.as_str()) == record.md5_checksum.as_deref() {
            return Ok(());
        }

        let bytes = fs::read(path).await?;
        let size = bytes.len() as u64;
        let updated = self.client.update_content(&id, bytes).await?;
        self.cache.store(updated.clone());

        // Mirror the new content onto every other materialization
        let paths = self.resolver.record_paths(&updated).await?;
        for other in paths.iter().filter(|p| p.as_path() != path) {
            if let Some(parent) = other.parent() {
                self.ensure_dir(parent).await?;
            }
            self.ignore.ignore(other);
            fs::copy(path, other).await?;
            self.materialized.lock().insert(other.clone());
        }

        self.hub.record_upload(size);
        self.hub.note_updated(1);
        info!(path = %path.display(), id = %id, "Uploaded changed content");
        Ok(())
    }

    async fn local_removed(&self, path: &Path) -> Result<()> {
        let id = match self.resolver.id_at(path) {
            Some(id) => id,
            None => return Ok(()),
        };
        let record = match self.cache.lookup(&id) {
            Some(record) => record,
            None => return Ok(()),
        };

        // Drop the sibling materializations before touching the remote so
        // their watcher events are suppressed
        let paths = self.resolver.paths_of(&record).await?;
        for other in paths.iter().filter(|p| p.as_path() != path) {
            self.delete_path(other, record.is_folder()).await?;
        }

        if self.permanently_delete {
            self.client.delete_record(&id).await?;
            self.hub.note_removed(1);
        } else {
            self.client.trash_record(&id).await?;
            self.hub.note_trashed(1);
        }

        self.resolver.drop_id(&id);
        self.cache.remove(&id);
        let mut materialized = self.materialized.lock();
        for p in &paths {
            materialized.remove(p);
        }
        drop(materialized);
        if record.is_folder() {
            for p in &paths {
                self.forget_prefix(p);
            }
        }
        info!(path = %path.display(), id = %id, "Propagated local removal");
        Ok(())
    }

    async fn local_dir_added(&self, path: &Path) -> Result<()> {
        if self.resolver.id_at(path).is_some() {
            return Ok(());
        }

        let parent_id = self.parent_of_path(path)?;
        let name = file_name_of(path)?;
        let record = self
            .client
            .create_file(
                RecordPatch {
                    name: Some(name),
                    mime_type: Some(FOLDER_MIME_TYPE.to_string()),
                    parents: vec![parent_id],
                    ..Default::default()
                },
                None,
            )
            .await?;

        self.register_upload(&record).await?;
        self.hub.note_added(1);
        info!(path = %path.display(), id = %record.id, "Created remote folder");
        Ok(())
    }

    /// Resolve the remote parent for a local path via the reverse index.
    /// Fails when the event raced ahead of a remote change still pending.
    fn parent_of_path(&self, path: &Path) -> Result<String> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::UnknownParent(path.to_path_buf()))?;
        if parent == self.resolver.local_root() {
            return Ok(self.resolver.root_id());
        }
        self.resolver
            .id_at(parent)
            .ok_or_else(|| SyncError::UnknownParent(path.to_path_buf()))
    }

    async fn register_upload(&self, record: &FileRecord) -> Result<()> {
        self.cache.store(record.clone());
        let paths = self.resolver.record_paths(record).await?;
        let mut materialized = self.materialized.lock();
        for path in paths {
            materialized.insert(path);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Filesystem helpers
    // ------------------------------------------------------------------

    /// Create `dir` and any missing ancestors, declaring one ignore token
    /// per directory actually created. Returns true when anything was
    /// created.
    async fn ensure_dir(&self, dir: &Path) -> Result<bool> {
        let mut missing = Vec::new();
        let mut cursor = dir;
        while !cursor.exists() {
            missing.push(cursor.to_path_buf());
            cursor = match cursor.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        if missing.is_empty() {
            return Ok(false);
        }
        for dir in missing.iter().rev() {
            self.ignore.ignore(dir);
            if let Err(e) = fs::create_dir(dir).await {
                // No event will come for a directory we did not create;
                // retract the token
                self.ignore.consume(dir);
                if e.kind() != std::io::ErrorKind::AlreadyExists {
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    /// Delete a file or directory if present; true when something was
    /// removed from disk
    async fn delete_path(&self, path: &Path, is_dir: bool) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        self.ignore.ignore(path);
        if is_dir {
            fs::remove_dir_all(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(true)
    }

    /// A directory moved: rewrite index and materialized entries under the
    /// old prefix so descendants stay resolvable
    fn rebase_prefix(&self, old_prefix: &Path, new_prefix: &Path) {
        let index = self.resolver.index_snapshot();
        let mut materialized = self.materialized.lock();
        for (path, id) in index {
            let suffix = match path.strip_prefix(old_prefix) {
                Ok(suffix) if !suffix.as_os_str().is_empty() => suffix.to_path_buf(),
                _ => continue,
            };
            let rebased = new_prefix.join(&suffix);
            self.resolver.drop_path(&path);
            self.resolver.insert_index(rebased.clone(), id);
            if materialized.remove(&path) {
                materialized.insert(rebased);
            }
        }
    }

    /// A directory disappeared: drop every index and materialized entry
    /// beneath it
    fn forget_prefix(&self, prefix: &Path) {
        let index = self.resolver.index_snapshot();
        for (path, _) in index {
            if path.strip_prefix(prefix).map(|s| !s.as_os_str().is_empty()).unwrap_or(false) {
                self.resolver.drop_path(&path);
            }
        }
        self.materialized
            .lock()
            .retain(|p| !p.starts_with(prefix) || p == prefix);
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| SyncError::Other(format!("unrepresentable file name: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn delta_pairs_by_index() {
        let delta = compute_delta(
            &paths(&["/sync/F/a.txt", "/sync/a.txt"]),
            &paths(&["/sync/F/b.txt", "/sync/a.txt"]),
        );
        assert_eq!(delta.removed, paths(&["/sync/F/a.txt"]));
        assert_eq!(delta.added, paths(&["/sync/F/b.txt"]));
    }

    #[test]
    fn delta_with_equal_sets_is_empty() {
        let set = paths(&["/sync/a.txt", "/sync/F/a.txt"]);
        let delta = compute_delta(&set, &set);
        assert!(delta.removed.is_empty());
        assert!(delta.added.is_empty());
    }

    #[test]
    fn delta_reports_surplus_on_both_sides() {
        let delta = compute_delta(
            &paths(&["/sync/old1", "/sync/old2", "/sync/keep"]),
            &paths(&["/sync/keep", "/sync/new1"]),
        );
        assert_eq!(delta.removed, paths(&["/sync/old1", "/sync/old2"]));
        assert_eq!(delta.added, paths(&["/sync/new1"]));
    }
}
