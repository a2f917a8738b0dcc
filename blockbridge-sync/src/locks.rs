//! Per-document sync locks.
//!
//! Each document runs `Idle → Scanning → Diffing → Queuing → Applying → Idle`.
//! A run holds the document's lease from Scanning through Applying; a second
//! run on the same document is turned away rather than queued. Different
//! documents never contend.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Scanning,
    Diffing,
    Queuing,
    Applying,
    /// Last run left a decision for a human
    ConflictPending,
}

#[derive(Debug, Clone, Copy)]
struct DocState {
    phase: SyncPhase,
    held: bool,
}

impl Default for DocState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            held: false,
        }
    }
}

/// Lock table keyed by document path.
#[derive(Clone, Default)]
pub struct LockTable {
    docs: Arc<DashMap<String, DocState>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the document's lease, or fail with `SyncInProgress`.
    pub fn try_acquire(&self, local_path: &str) -> Result<SyncLease, SyncError> {
        let mut entry = self.docs.entry(local_path.to_string()).or_default();
        if entry.held {
            return Err(SyncError::SyncInProgress(local_path.to_string()));
        }
        entry.held = true;
        let conflicted = entry.phase == SyncPhase::ConflictPending;
        entry.phase = if conflicted {
            SyncPhase::Applying
        } else {
            SyncPhase::Scanning
        };
        drop(entry);
        tracing::debug!(path = local_path, "acquired sync lease");
        Ok(SyncLease {
            docs: Arc::clone(&self.docs),
            path: local_path.to_string(),
            conflicts: false,
        })
    }

    pub fn phase(&self, local_path: &str) -> SyncPhase {
        self.docs
            .get(local_path)
            .map(|s| s.phase)
            .unwrap_or(SyncPhase::Idle)
    }

    pub fn is_busy(&self, local_path: &str) -> bool {
        self.docs.get(local_path).is_some_and(|s| s.held)
    }

    /// Flag a document as waiting on a conflict outside of a run.
    pub fn mark_conflict_pending(&self, local_path: &str) {
        let mut entry = self.docs.entry(local_path.to_string()).or_default();
        if !entry.held {
            entry.phase = SyncPhase::ConflictPending;
        }
    }

    /// Every known document's phase.
    pub fn snapshot(&self) -> BTreeMap<String, SyncPhase> {
        self.docs
            .iter()
            .map(|e| (e.key().clone(), e.value().phase))
            .collect()
    }
}

/// Exclusive right to sync one document. Dropping it releases the lock.
pub struct SyncLease {
    docs: Arc<DashMap<String, DocState>>,
    path: String,
    conflicts: bool,
}

impl SyncLease {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_phase(&self, phase: SyncPhase) {
        if let Some(mut entry) = self.docs.get_mut(&self.path) {
            tracing::trace!(path = %self.path, ?phase, "sync phase");
            entry.phase = phase;
        }
    }

    /// Whether the document ends this run waiting on a conflict.
    pub fn set_conflicts(&mut self, pending: bool) {
        self.conflicts = pending;
    }
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        if let Some(mut entry) = self.docs.get_mut(&self.path) {
            entry.held = false;
            entry.phase = if self.conflicts {
                SyncPhase::ConflictPending
            } else {
                SyncPhase::Idle
            };
        }
    }
}
