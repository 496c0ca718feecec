//! Local event queue
//!
//! Single-consumer FIFO between the watcher and the reconciler. Exactly
//! one consumer loop exists (running it consumes the queue), so
//! local-originated operations are strictly serialized. The status flips
//! to `ApplyingLocalChange` while the queue is non-empty and back to idle
//! once drained.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use drivesync_core::SyncError;

use crate::checkpoint::CheckpointWriter;
use crate::events::{StatusHub, SyncStatus};
use crate::reconciler::Reconciler;
use crate::watcher::LocalEvent;

pub struct LocalEventQueue {
    events: mpsc::UnboundedReceiver<LocalEvent>,
    reconciler: Arc<Reconciler>,
    hub: Arc<StatusHub>,
    writer: Arc<CheckpointWriter>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl LocalEventQueue {
    pub fn new(
        events: mpsc::UnboundedReceiver<LocalEvent>,
        reconciler: Arc<Reconciler>,
        hub: Arc<StatusHub>,
        writer: Arc<CheckpointWriter>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let shutdown_rx = shutdown_tx.subscribe();
        Self {
            events,
            reconciler,
            hub,
            writer,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Consume events until shutdown. Taking `self` by value guarantees a
    /// single consumer.
    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            self.hub.set_status(SyncStatus::ApplyingLocalChange);
            if !self.apply(event).await {
                break;
            }

            // Drain whatever queued up behind the first event before going
            // idle
            let mut fatal = false;
            while let Ok(event) = self.events.try_recv() {
                if !self.apply(event).await {
                    fatal = true;
                    break;
                }
            }

            self.writer.save_if_due().await;
            self.hub.set_status(SyncStatus::Idle);
            if fatal {
                break;
            }
        }
        info!("Local event queue stopped");
    }

    /// Returns false when the engine must stop
    async fn apply(&self, event: LocalEvent) -> bool {
        match self.reconciler.apply_local_event(&event).await {
            Ok(()) => {
                self.writer.note_changes(1);
                true
            }
            Err(SyncError::UnknownParent(path)) => {
                // The event raced ahead of a remote change still pending;
                // the next remote apply will cover it
                warn!(path = %path.display(), "Local event with unknown parent, skipped");
                true
            }
            Err(e) if e.is_fatal() => {
                error!("Fatal local event failure: {}", e);
                self.hub.report_error(e.to_string());
                let _ = self.shutdown_tx.send(());
                false
            }
            Err(e) => {
                error!(event = ?event, "Local event failed: {}", e);
                self.hub.report_error(e.to_string());
                true
            }
        }
    }
}
