//! # blockbridge-sync
//!
//! Moves document changes between a local markdown vault and remote pages.
//!
//! The [`Executor`] drives one document at a time through
//! `Scanning → Diffing → Queuing → Applying`, recording every change in the
//! sync queue before it touches the remote side. Webhook events only ever
//! append to that queue; they are applied the next time the document's
//! queue is drained.

pub mod changes;
pub mod client;
pub mod executor;
pub mod fake;
pub mod locks;
pub mod merge;
pub mod notion;
pub mod webhook;

use blockbridge_core::{ConfigError, FrontmatterError, MapError};
use blockbridge_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

pub use changes::{detect_local_changes, ChangeKind, LocalChange};
pub use client::{ClientError, ClientResult, RemoteClient};
pub use executor::{Change, EntryFailure, Executor, SyncReport};
pub use fake::FakeRemote;
pub use locks::{LockTable, SyncLease, SyncPhase};
pub use notion::NotionClient;
pub use webhook::{ingest, sign, verify_signature, IngestReport, WebhookError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("a sync of `{0}` is already in progress")]
    SyncInProgress(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Frontmatter(#[from] FrontmatterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("queue entry {0} is not an open conflict")]
    NotAConflict(i64),

    #[error("no local document is linked to remote page `{0}`")]
    UnknownDocument(String),

    #[error("document `{0}` is not linked to a remote page")]
    NotLinked(String),

    #[error("queue entry {entry_id} has an invalid payload: {reason}")]
    InvalidPayload { entry_id: i64, reason: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}
