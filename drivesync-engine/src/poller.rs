//! Remote change poller
//!
//! Long-running loop over the incremental change feed with an adaptive
//! interval: any applied change resets the interval to the floor, a quiet
//! poll multiplies it by the backoff factor up to the ceiling. The poller
//! sleeps while initial sync runs and terminates itself on an apply error
//! to avoid runaway retries.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use drivesync_core::{Result, SyncConfig};

use crate::checkpoint::CheckpointWriter;
use crate::events::{StatusHub, SyncStatus};
use crate::reconciler::Reconciler;
use crate::remote::{drain_changes, RemoteDrive};
use crate::state::SyncState;

#[derive(Debug, Clone, Copy)]
pub struct PollerParams {
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
    pub backoff_factor: f64,
}

impl PollerParams {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial: config.poll_initial(),
            min: config.poll_min(),
            max: config.poll_max(),
            backoff_factor: config.poll_backoff_factor,
        }
    }

    /// Next interval after a quiet poll
    pub fn backed_off(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_factor).min(self.max)
    }
}

pub struct ChangePoller {
    client: Arc<dyn RemoteDrive>,
    reconciler: Arc<Reconciler>,
    hub: Arc<StatusHub>,
    state: Arc<SyncState>,
    writer: Arc<CheckpointWriter>,
    params: PollerParams,
    window: usize,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ChangePoller {
    pub fn new(
        client: Arc<dyn RemoteDrive>,
        reconciler: Arc<Reconciler>,
        hub: Arc<StatusHub>,
        state: Arc<SyncState>,
        writer: Arc<CheckpointWriter>,
        params: PollerParams,
        window: usize,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            client,
            reconciler,
            hub,
            state,
            writer,
            params,
            window,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let mut interval = self.params.initial;
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if !self.state.is_synced() {
                interval = self.params.initial;
                continue;
            }
            let token = match self.state.token() {
                Some(token) => token,
                None => continue,
            };

            match self.poll_once(&token).await {
                Ok(applied) if applied > 0 => {
                    debug!(applied, "Applied remote changes");
                    interval = self.params.min;
                }
                Ok(_) => {
                    interval = self.params.backed_off(interval);
                }
                Err(e) => {
                    error!("Change poll failed, poller terminating: {}", e);
                    self.hub.report_error(e.to_string());
                    break;
                }
            }
        }
        info!("Change poller stopped");
    }

    /// One feed drain: persist the fetched changes, apply them in bounded
    /// windows, then advance the token under a fresh checkpoint.
    async fn poll_once(&self, token: &str) -> Result<usize> {
        let (changes, new_token) = drain_changes(&self.client, token).await?;

        if changes.is_empty() {
            if let Some(token) = new_token {
                self.state.set_token(token);
            }
            return Ok(0);
        }

        // Persist before applying so a crash mid-apply re-applies from the
        // checkpoint instead of losing the page
        self.state.extend_pending(changes.clone());
        self.writer.save_now().await?;

        self.hub.set_status(SyncStatus::ApplyingRemoteChange);
        let mut applied = 0usize;
        let mut failure = None;
        for chunk in changes.chunks(self.window) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|change| self.reconciler.apply_remote_change(change)),
            )
            .await;

            let mut chunk_failed = false;
            for result in results {
                match result {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(e) => {
                        chunk_failed = true;
                        failure = Some(e);
                    }
                }
            }
            if chunk_failed {
                break;
            }
            self.state.drop_pending_front(chunk.len());
        }
        self.hub.set_status(SyncStatus::Idle);

        if let Some(e) = failure {
            // Keep the unapplied tail pending; it re-applies on restart
            let _ = self.writer.save_now().await;
            return Err(e);
        }

        // Token advances only now that the covering changes are applied
        // and checkpointed
        if let Some(token) = new_token {
            self.state.set_token(token);
        }
        self.writer.note_changes(applied as u64);
        self.writer.save_now().await?;

        Ok(applied)
    }
}
