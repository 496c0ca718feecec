//! Metadata cache and batch fetcher
//!
//! Process-wide map of remote id to [`FileRecord`], persisted through the
//! checkpoint. Batch lookups partition into cached and uncached ids and
//! resolve the uncached ones concurrently; a failure for one id never fails
//! the batch. A short-lived parent-info side cache memoizes records during
//! a single path walk and is invalidated whenever a child record shifts.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::warn;

use drivesync_core::Result;

use crate::record::FileRecord;
use crate::remote::RemoteDrive;

/// Concurrent remote fetches per `get_many` batch
const BATCH_FETCH_WINDOW: usize = 10;

pub struct MetadataCache {
    client: Arc<dyn RemoteDrive>,
    records: Mutex<HashMap<String, FileRecord>>,
    parent_info: Mutex<HashMap<String, FileRecord>>,
}

impl MetadataCache {
    pub fn new(client: Arc<dyn RemoteDrive>) -> Self {
        Self {
            client,
            records: Mutex::new(HashMap::new()),
            parent_info: Mutex::new(HashMap::new()),
        }
    }

    /// Cache-only lookup
    pub fn lookup(&self, id: &str) -> Option<FileRecord> {
        self.records.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Cached record, or one remote fetch. Not-found yields `None`.
    pub async fn get(&self, id: &str) -> Result<Option<FileRecord>> {
        if let Some(record) = self.lookup(id) {
            return Ok(Some(record));
        }
        match self.client.get_record(id).await? {
            Some(record) => {
                self.store(record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Resolve a set of ids. Cached entries are returned as-is; the rest are
    /// fetched concurrently. Individual failures and not-founds map to
    /// `None` without failing the batch.
    pub async fn get_many(&self, ids: &[String]) -> HashMap<String, Option<FileRecord>> {
        let mut resolved = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();

        {
            let records = self.records.lock();
            for id in ids {
                match records.get(id) {
                    Some(record) => {
                        resolved.insert(id.clone(), Some(record.clone()));
                    }
                    None => missing.push(id.clone()),
                }
            }
        }

        if missing.is_empty() {
            return resolved;
        }

        let client = &self.client;
        let fetched: Vec<(String, Result<Option<FileRecord>>)> = stream::iter(missing)
            .map(|id| async move {
                let result = client.get_record(&id).await;
                (id, result)
            })
            .buffer_unordered(BATCH_FETCH_WINDOW)
            .collect()
            .await;

        for (id, result) in fetched {
            match result {
                Ok(Some(record)) => {
                    self.store(record.clone());
                    resolved.insert(id, Some(record));
                }
                Ok(None) => {
                    resolved.insert(id, None);
                }
                Err(e) => {
                    warn!(id = %id, "Batch metadata fetch failed: {}", e);
                    resolved.insert(id, None);
                }
            }
        }

        resolved
    }

    /// Insert or replace a record. The parent-info side cache is dropped
    /// for every parent of the old and new record: that parent's
    /// children-set may have shifted.
    pub fn store(&self, record: FileRecord) {
        let old = {
            let mut records = self.records.lock();
            records.insert(record.id.clone(), record.clone())
        };

        let mut parent_info = self.parent_info.lock();
        for parent in &record.parents {
            parent_info.remove(parent);
        }
        if let Some(old) = old {
            for parent in &old.parents {
                parent_info.remove(parent);
            }
        }
    }

    /// Drop a record; returns the evicted entry
    pub fn remove(&self, id: &str) -> Option<FileRecord> {
        let old = self.records.lock().remove(id);
        if let Some(old) = &old {
            let mut parent_info = self.parent_info.lock();
            parent_info.remove(id);
            for parent in &old.parents {
                parent_info.remove(parent);
            }
        }
        old
    }

    /// Side-cache lookup used during path walks; memoizes main-cache hits
    pub fn parent_lookup(&self, id: &str) -> Option<FileRecord> {
        if let Some(record) = self.parent_info.lock().get(id) {
            return Some(record.clone());
        }
        let record = self.lookup(id)?;
        self.parent_info
            .lock()
            .insert(id.to_string(), record.clone());
        Some(record)
    }

    /// Snapshot for checkpointing
    pub fn snapshot(&self) -> HashMap<String, FileRecord> {
        self.records.lock().clone()
    }

    /// Repopulate from a loaded checkpoint
    pub fn restore(&self, records: HashMap<String, FileRecord>) {
        *self.records.lock() = records;
        self.parent_info.lock().clear();
    }
}
