//! Local filesystem watcher
//!
//! Wraps a recursive `notify` watcher over the configured local root and
//! reduces the platform event stream to five kinds. Events whose path holds
//! an ignore token (our own writes) and events on temporary download files
//! are dropped before they reach the engine.
//!
//! Uses inotify on Linux, FSEvents on macOS, ReadDirectoryChangesW on
//! Windows.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use drivesync_core::{Result, SyncError};

use crate::ignore::IgnoreRegistry;

/// A local change the engine must push to the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    FileAdded(PathBuf),
    FileRemoved(PathBuf),
    FileChanged(PathBuf),
    DirAdded(PathBuf),
    DirRemoved(PathBuf),
}

impl LocalEvent {
    pub fn path(&self) -> &Path {
        match self {
            LocalEvent::FileAdded(p)
            | LocalEvent::FileRemoved(p)
            | LocalEvent::FileChanged(p)
            | LocalEvent::DirAdded(p)
            | LocalEvent::DirRemoved(p) => p,
        }
    }
}

/// True for the engine's own download scratch files (`.<name>.tmp`)
pub fn is_temp_download_path(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with('.') && name.ends_with(".tmp"),
        None => false,
    }
}

pub struct LocalWatcher {
    // Held so the platform watcher stays registered for the watcher's
    // lifetime
    _watcher: RecommendedWatcher,
}

impl LocalWatcher {
    /// Start watching `root` recursively. Events flow into `event_tx`
    /// unbounded so the notify callback thread never blocks; the consumer
    /// is attached later by the controller.
    pub fn start(
        root: &Path,
        ignore: Arc<IgnoreRegistry>,
        event_tx: mpsc::UnboundedSender<LocalEvent>,
    ) -> Result<Self> {
        let context = WatchContext {
            ignore,
            event_tx,
            known_dirs: Mutex::new(HashSet::new()),
        };

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => context.handle(event),
                Err(e) => warn!("Watcher error: {}", e),
            })
            .map_err(|e| SyncError::Watcher(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Watcher(e.to_string()))?;

        debug!(root = %root.display(), "Local watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// State shared with the notify callback thread. Everything here must be
/// callable off-runtime, hence the unbounded sender and sync mutex.
struct WatchContext {
    ignore: Arc<IgnoreRegistry>,
    event_tx: mpsc::UnboundedSender<LocalEvent>,
    /// Paths observed as directories; removal events cannot stat the path,
    /// so dir-ness is remembered from earlier sightings
    known_dirs: Mutex<HashSet<PathBuf>>,
}

impl WatchContext {
    fn handle(&self, event: Event) {
        for local in self.map_event(event) {
            let path = local.path();
            if is_temp_download_path(path) {
                continue;
            }
            if self.ignore.consume(path) {
                debug!(path = %path.display(), "Suppressed echo event");
                continue;
            }
            if self.event_tx.send(local).is_err() {
                // Engine shut down; nothing left to notify
                return;
            }
        }
    }

    fn map_event(&self, event: Event) -> Vec<LocalEvent> {
        match event.kind {
            EventKind::Create(_) => event.paths.iter().map(|p| self.added(p)).collect(),

            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                vec![self.removed(&event.paths[0]), self.added(&event.paths[1])]
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                event.paths.iter().map(|p| self.removed(p)).collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                event.paths.iter().map(|p| self.added(p)).collect()
            }
            // Backends that don't pair renames report a bare name change;
            // existence decides which side of the rename we saw
            EventKind::Modify(ModifyKind::Name(_)) => event
                .paths
                .iter()
                .map(|p| if p.exists() { self.added(p) } else { self.removed(p) })
                .collect(),

            EventKind::Modify(_) => event.paths.iter().filter_map(|p| self.changed(p)).collect(),

            EventKind::Remove(RemoveKind::Folder) => event
                .paths
                .iter()
                .map(|p| {
                    self.known_dirs.lock().remove(p);
                    LocalEvent::DirRemoved(p.clone())
                })
                .collect(),
            EventKind::Remove(_) => event.paths.iter().map(|p| self.removed(p)).collect(),

            _ => Vec::new(),
        }
    }

    fn added(&self, path: &Path) -> LocalEvent {
        if path.is_dir() {
            self.known_dirs.lock().insert(path.to_path_buf());
            LocalEvent::DirAdded(path.to_path_buf())
        } else {
            LocalEvent::FileAdded(path.to_path_buf())
        }
    }

    fn removed(&self, path: &Path) -> LocalEvent {
        if self.known_dirs.lock().remove(path) {
            LocalEvent::DirRemoved(path.to_path_buf())
        } else {
            LocalEvent::FileRemoved(path.to_path_buf())
        }
    }

    fn changed(&self, path: &Path) -> Option<LocalEvent> {
        if path.is_dir() {
            // Directory mtime churn carries no content change
            self.known_dirs.lock().insert(path.to_path_buf());
            None
        } else {
            Some(LocalEvent::FileChanged(path.to_path_buf()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_download_paths_are_recognized() {
        assert!(is_temp_download_path(Path::new("/sync/.a.txt.tmp")));
        assert!(!is_temp_download_path(Path::new("/sync/a.txt")));
        assert!(!is_temp_download_path(Path::new("/sync/a.tmp")));
        assert!(!is_temp_download_path(Path::new("/sync/.hidden")));
    }

    #[tokio::test]
    async fn ignored_paths_are_suppressed_once() {
        let ignore = Arc::new(IgnoreRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = WatchContext {
            ignore: ignore.clone(),
            event_tx: tx,
            known_dirs: Mutex::new(HashSet::new()),
        };

        let path = PathBuf::from("/sync/a.txt");
        ignore.ignore(&path);

        // First event consumes the token, second passes through
        context.handle(Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone()));
        context.handle(Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone()));

        assert_eq!(rx.recv().await.unwrap(), LocalEvent::FileRemoved(path));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn folder_removal_maps_to_dir_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = WatchContext {
            ignore: Arc::new(IgnoreRegistry::new()),
            event_tx: tx,
            known_dirs: Mutex::new(HashSet::new()),
        };

        let path = PathBuf::from("/sync/F");
        context.handle(Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(path.clone()));

        assert_eq!(rx.recv().await.unwrap(), LocalEvent::DirRemoved(path));
    }
}
