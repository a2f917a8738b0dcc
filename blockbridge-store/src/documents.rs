//! Local document <-> remote page registry.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::{duplicate_or, from_millis, to_millis, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentLink {
    pub local_path: String,
    pub remote_document_id: String,
    pub last_synced: Option<DateTime<Utc>>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<DocumentLink> {
    Ok(DocumentLink {
        local_path: row.get(0)?,
        remote_document_id: row.get(1)?,
        last_synced: row.get::<_, Option<i64>>(2)?.map(from_millis),
    })
}

/// Pair a local document with a remote page.
///
/// Re-linking a path to a new page replaces the old pair. A page already
/// linked to a different path fails with `DuplicateMapping`.
pub fn link_document(
    conn: &Connection,
    local_path: &str,
    remote_document_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (local_path, remote_document_id, last_synced)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(local_path) DO UPDATE SET
             remote_document_id = excluded.remote_document_id,
             last_synced = excluded.last_synced",
        rusqlite::params![local_path, remote_document_id, to_millis(now)],
    )
    .map_err(|e| {
        duplicate_or(e, || {
            format!("remote page {remote_document_id} is already linked to another document")
        })
    })?;
    Ok(())
}

pub fn by_path(conn: &Connection, local_path: &str) -> Result<Option<DocumentLink>> {
    Ok(conn
        .query_row(
            "SELECT local_path, remote_document_id, last_synced
             FROM documents WHERE local_path = ?1",
            [local_path],
            from_row,
        )
        .optional()?)
}

pub fn by_remote(conn: &Connection, remote_document_id: &str) -> Result<Option<DocumentLink>> {
    Ok(conn
        .query_row(
            "SELECT local_path, remote_document_id, last_synced
             FROM documents WHERE remote_document_id = ?1",
            [remote_document_id],
            from_row,
        )
        .optional()?)
}

pub fn list(conn: &Connection) -> Result<Vec<DocumentLink>> {
    let mut stmt = conn.prepare(
        "SELECT local_path, remote_document_id, last_synced
         FROM documents ORDER BY local_path",
    )?;
    let rows = stmt
        .query_map([], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
