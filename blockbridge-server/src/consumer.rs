//! Background task that applies queued webhook changes.
//!
//! The webhook handler only appends to the queue and sends a wake-up. This
//! task drains each document with pending entries through the executor's
//! Applying phase, so remote changes go through the same per-document lock
//! as every other sync.

use std::sync::Arc;
use std::time::Duration;

use blockbridge_store::queue;
use blockbridge_sync::{Executor, SyncError};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of one sweep over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Sweep {
    /// Documents whose queue was drained
    pub documents: usize,
    pub applied: usize,
    pub failed: usize,
    /// Documents skipped because a sync already held them
    pub busy: usize,
    /// Entries failed because no document is linked to their page
    pub unrouted: usize,
}

/// Drain every document that has pending entries.
pub async fn sweep(executor: &Executor) -> Result<Sweep, SyncError> {
    let mut sweep = Sweep {
        unrouted: executor.fail_unrouted()?,
        ..Sweep::default()
    };

    let documents = executor.store().read(queue::pending_documents)?;
    for path in documents {
        match executor.apply_pending(&path).await {
            Ok(report) => {
                sweep.documents += 1;
                sweep.applied += report.inserted + report.updated + report.deleted;
                sweep.failed += report.failed;
            }
            Err(SyncError::SyncInProgress(_)) => {
                debug!(path = %path, "document busy, leaving its entries for the running sync");
                sweep.busy += 1;
            }
            Err(err) => {
                warn!(path = %path, error = %err, "applying queued changes failed");
                sweep.failed += 1;
            }
        }
    }
    Ok(sweep)
}

/// Run until every wake-up sender is dropped. Sweeps on each wake-up and
/// every `interval`, which also picks up entries a busy document left behind.
pub async fn run(executor: Arc<Executor>, mut wake: mpsc::Receiver<()>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            woken = wake.recv() => {
                if woken.is_none() {
                    info!("webhook consumer stopping");
                    return;
                }
            }
            _ = ticker.tick() => {}
        }
        match sweep(&executor).await {
            Ok(s) if s.documents > 0 || s.unrouted > 0 => {
                info!(
                    documents = s.documents,
                    applied = s.applied,
                    failed = s.failed,
                    busy = s.busy,
                    unrouted = s.unrouted,
                    "queue sweep"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "queue sweep failed"),
        }
    }
}
