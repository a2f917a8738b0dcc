//! # blockbridge-store
//!
//! SQLite persistence for blockbridge: the metadata store (block mappings,
//! runtime variables, database bindings, linked documents) and the sync
//! queue.
//!
//! ## Schema
//!
//! - WAL mode, foreign keys on
//! - Timestamps are Unix epoch milliseconds
//! - Schema version stored in `PRAGMA user_version`
//!
//! Query functions take a plain `&Connection` so they compose inside a
//! caller's transaction. [`Store`] owns the connections: one serialized
//! writer, and fresh read-only connections for readers when file-backed.

pub mod bindings;
pub mod documents;
pub mod mappings;
pub mod migrations;
pub mod queue;
pub mod schema;
pub mod variables;

use blockbridge_types::QueueStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};

pub use bindings::BindingRow;
pub use documents::DocumentLink;
pub use mappings::{BlockMapping, NewMapping};
pub use queue::{NewEntry, QueueCounts, SyncQueueEntry};
pub use variables::RuntimeVariable;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("duplicate mapping: {0}")]
    DuplicateMapping(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("queue entry {id} is superseded by newer entry {newer} for the same block")]
    Superseded { id: i64, newer: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Open or create a database at the given path and run pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Shared handle to the sync database.
///
/// Writes are serialized through one connection. Reads against a file
/// open their own read-only connection, so WAL lets them run while a
/// write is in flight.
pub struct Store {
    writer: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open(path)?;
        tracing::debug!(path = %path.display(), "opened sync database");
        Ok(Self {
            writer: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            writer: Mutex::new(open_memory()?),
            path: None,
        })
    }

    /// Run `f` on the writer connection.
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.writer.lock();
        f(&conn)
    }

    /// Run `f` inside a single immediate transaction on the writer.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only query.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match &self.path {
            Some(path) => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                f(&conn)
            }
            None => {
                let conn = self.writer.lock();
                f(&conn)
            }
        }
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Translate a unique-index violation into [`StoreError::DuplicateMapping`].
pub(crate) fn duplicate_or(err: rusqlite::Error, what: impl FnOnce() -> String) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            StoreError::DuplicateMapping(what())
        }
        _ => StoreError::Sqlite(err),
    }
}

pub(crate) fn not_found(err: rusqlite::Error, what: impl FnOnce() -> String) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what()),
        other => StoreError::Sqlite(other),
    }
}
