//! Engine status and upward events
//!
//! `Syncing(bool)` is emitted on every status transition; `FilesChanged`
//! is emitted when the engine returns to idle and the accumulated summary
//! is non-empty.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Idle,
    InitialSync,
    ApplyingRemoteChange,
    ApplyingLocalChange,
}

impl SyncStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncStatus::Idle)
    }
}

/// Counts since the last emission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: u64,
    pub removed: u64,
    pub updated: u64,
    pub trashed: u64,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.updated == 0 && self.trashed == 0
    }
}

/// Cumulative transfer counters, readable from the controller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub files_downloaded: u64,
    pub files_uploaded: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub remote_changes_applied: u64,
    pub local_events_applied: u64,
    pub last_transfer_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Syncing(bool),
    FilesChanged(ChangeSummary),
    Error(String),
}

pub struct StatusHub {
    status: RwLock<SyncStatus>,
    summary: Mutex<ChangeSummary>,
    stats: Mutex<SyncStats>,
    events: broadcast::Sender<EngineEvent>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            status: RwLock::new(SyncStatus::Idle),
            summary: Mutex::new(ChangeSummary::default()),
            stats: Mutex::new(SyncStats::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.read()
    }

    /// Transition the status, emitting `Syncing` on every change and
    /// flushing the summary when leaving an active state.
    pub fn set_status(&self, next: SyncStatus) {
        let previous = {
            let mut status = self.status.write();
            let previous = *status;
            *status = next;
            previous
        };
        if previous == next {
            return;
        }

        debug!(?previous, ?next, "Status transition");
        let _ = self.events.send(EngineEvent::Syncing(next.is_active()));

        if previous.is_active() && !next.is_active() {
            self.flush_summary();
        }
    }

    fn flush_summary(&self) {
        let summary = {
            let mut summary = self.summary.lock();
            std::mem::take(&mut *summary)
        };
        if !summary.is_empty() {
            let _ = self.events.send(EngineEvent::FilesChanged(summary));
        }
    }

    pub fn report_error(&self, message: String) {
        let _ = self.events.send(EngineEvent::Error(message));
    }

    pub fn note_added(&self, n: u64) {
        self.summary.lock().added += n;
    }

    pub fn note_removed(&self, n: u64) {
        self.summary.lock().removed += n;
    }

    pub fn note_updated(&self, n: u64) {
        self.summary.lock().updated += n;
    }

    pub fn note_trashed(&self, n: u64) {
        self.summary.lock().trashed += n;
    }

    pub fn stats(&self) -> SyncStats {
        *self.stats.lock()
    }

    pub fn record_download(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.files_downloaded += 1;
        stats.bytes_downloaded += bytes;
        stats.last_transfer_at = Some(Utc::now());
    }

    pub fn record_upload(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.files_uploaded += 1;
        stats.bytes_uploaded += bytes;
        stats.last_transfer_at = Some(Utc::now());
    }

    pub fn record_remote_apply(&self) {
        self.stats.lock().remote_changes_applied += 1;
    }

    pub fn record_local_apply(&self) {
        self.stats.lock().local_events_applied += 1;
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
