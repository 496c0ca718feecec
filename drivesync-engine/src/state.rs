//! Shared mutable engine state
//!
//! The change token, the pending (fetched-but-unapplied) changes, and the
//! synced flag. Mutated only by the controller and the poller; everything
//! else reads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::record::Change;

#[derive(Default)]
pub struct SyncState {
    change_token: RwLock<Option<String>>,
    pending: Mutex<VecDeque<Change>>,
    synced: AtomicBool,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<String> {
        self.change_token.read().clone()
    }

    pub fn set_token(&self, token: String) {
        *self.change_token.write() = Some(token);
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn pending_snapshot(&self) -> Vec<Change> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn set_pending(&self, changes: Vec<Change>) {
        *self.pending.lock() = changes.into();
    }

    pub fn extend_pending(&self, changes: Vec<Change>) {
        self.pending.lock().extend(changes);
    }

    /// Drop the `n` oldest pending changes after they were applied
    pub fn drop_pending_front(&self, n: usize) {
        let mut pending = self.pending.lock();
        for _ in 0..n {
            if pending.pop_front().is_none() {
                break;
            }
        }
    }

    /// Remove and return everything pending; used on restart re-apply
    pub fn take_pending(&self) -> Vec<Change> {
        self.pending.lock().drain(..).collect()
    }
}
