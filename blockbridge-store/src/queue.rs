//! The sync queue.
//!
//! Entries move `pending → processing → {success, error, conflict}`.
//! `conflict` goes back to `processing` once someone picks a side, and
//! `error` only returns to `pending` through [`requeue`].
//!
//! Ordering is by `id`, which increases with creation time. An entry is
//! only handed out once no older entry for the same `block_key` is still
//! pending, in flight or waiting on a conflict.

use blockbridge_types::{BlockId, ChangeType, QueueStatus, SyncDirection};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use crate::{from_millis, not_found, to_millis, Result, StoreError};

/// Queue key for a block known locally.
pub fn local_key(local_path: &str, block_id: &BlockId) -> String {
    format!("{local_path}#{block_id}")
}

/// Queue key for a block only known by its remote id.
pub fn remote_key(remote_id: &str) -> String {
    format!("remote:{remote_id}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub local_path: Option<String>,
    pub block_key: String,
    pub local_block_id: Option<String>,
    pub remote_id: Option<String>,
    pub direction: SyncDirection,
    pub change_type: ChangeType,
    pub payload: Value,
}

impl NewEntry {
    /// A local change headed for the remote document.
    pub fn to_remote(local_path: &str, block_id: &BlockId, change_type: ChangeType, payload: Value) -> Self {
        Self {
            local_path: Some(local_path.to_string()),
            block_key: local_key(local_path, block_id),
            local_block_id: Some(block_id.to_string()),
            remote_id: None,
            direction: SyncDirection::ToRemote,
            change_type,
            payload,
        }
    }

    /// A remote change headed for a local document, which may be unknown.
    pub fn from_remote(
        local_path: Option<&str>,
        remote_id: &str,
        change_type: ChangeType,
        payload: Value,
    ) -> Self {
        Self {
            local_path: local_path.map(str::to_string),
            block_key: remote_key(remote_id),
            local_block_id: None,
            remote_id: Some(remote_id.to_string()),
            direction: SyncDirection::FromRemote,
            change_type,
            payload,
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    /// Attach the local block this change concerns, keying it like local edits.
    pub fn with_local_block(mut self, local_path: &str, block_id: &BlockId) -> Self {
        self.local_path = Some(local_path.to_string());
        self.block_key = local_key(local_path, block_id);
        self.local_block_id = Some(block_id.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub local_path: Option<String>,
    pub block_key: String,
    pub local_block_id: Option<String>,
    pub remote_id: Option<String>,
    pub direction: SyncDirection,
    pub change_type: ChangeType,
    pub payload: Value,
    pub status: QueueStatus,
    pub attempts: u32,
    pub retriable: bool,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Per-status totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending_count: u64,
    pub processing_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub conflict_count: u64,
    pub total: u64,
}

const COLUMNS: &str = "id, local_path, block_key, local_block_id, remote_id, direction, change_type,
     payload, status, attempts, retriable, created_at, synced_at, error_message";

fn invalid(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value `{value}`").into(),
    )
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    let direction: String = row.get(5)?;
    let change_type: String = row.get(6)?;
    let payload: String = row.get(7)?;
    let status: String = row.get(8)?;
    Ok(SyncQueueEntry {
        id: row.get(0)?,
        local_path: row.get(1)?,
        block_key: row.get(2)?,
        local_block_id: row.get(3)?,
        remote_id: row.get(4)?,
        direction: SyncDirection::from_str(&direction).ok_or_else(|| invalid(5, &direction))?,
        change_type: ChangeType::from_str(&change_type).ok_or_else(|| invalid(6, &change_type))?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e))
        })?,
        status: QueueStatus::from_str(&status).ok_or_else(|| invalid(8, &status))?,
        attempts: row.get::<_, i64>(9)? as u32,
        retriable: row.get(10)?,
        created_at: from_millis(row.get(11)?),
        synced_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        error_message: row.get(13)?,
    })
}

/// Append a change. Returns the new entry's id.
pub fn enqueue(conn: &Connection, entry: &NewEntry, now: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_queue (local_path, block_key, local_block_id, remote_id, direction,
             change_type, payload, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
        rusqlite::params![
            entry.local_path,
            entry.block_key,
            entry.local_block_id,
            entry.remote_id,
            entry.direction.as_str(),
            entry.change_type.as_str(),
            serde_json::to_string(&entry.payload)?,
            to_millis(now),
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::debug!(entry_id = id, block_key = %entry.block_key, change = entry.change_type.as_str(), "enqueued");
    Ok(id)
}

/// Claim the oldest runnable pending entry, optionally for one document.
///
/// The claim is a single statement, so two callers never get the same
/// entry.
pub fn dequeue_next(conn: &Connection, local_path: Option<&str>) -> Result<Option<SyncQueueEntry>> {
    let claimed: Option<i64> = conn
        .query_row(
            "UPDATE sync_queue
             SET status = 'processing', attempts = attempts + 1
             WHERE id = (
                 SELECT q.id FROM sync_queue q
                 WHERE q.status = 'pending'
                   AND (?1 IS NULL OR q.local_path = ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_queue o
                       WHERE o.block_key = q.block_key
                         AND o.id < q.id
                         AND o.status IN ('pending', 'processing', 'conflict'))
                 ORDER BY q.id
                 LIMIT 1)
             RETURNING id",
            [local_path],
            |row| row.get(0),
        )
        .optional()?;
    claimed.map(|id| get(conn, id)).transpose()
}

pub fn get(conn: &Connection, id: i64) -> Result<SyncQueueEntry> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM sync_queue WHERE id = ?1"),
        [id],
        from_row,
    )
    .map_err(|e| not_found(e, || format!("queue entry {id}")))
}

fn transition(conn: &Connection, id: i64, to: QueueStatus) -> Result<SyncQueueEntry> {
    let entry = get(conn, id)?;
    if !entry.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            id,
            from: entry.status,
            to,
        });
    }
    Ok(entry)
}

/// Move an entry to `status`, recording an optional message.
pub fn mark(
    conn: &Connection,
    id: i64,
    status: QueueStatus,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let entry = transition(conn, id, status)?;
    let synced_at = (status == QueueStatus::Success).then(|| to_millis(now));
    conn.execute(
        "UPDATE sync_queue SET status = ?2, error_message = ?3, synced_at = COALESCE(?4, synced_at)
         WHERE id = ?1 AND status = ?5",
        rusqlite::params![id, status.as_str(), error_message, synced_at, entry.status.as_str()],
    )?;
    tracing::debug!(entry_id = id, from = %entry.status, to = %status, "queue transition");
    Ok(())
}

/// Fail an in-flight entry, recording whether trying again could help.
pub fn mark_failed(conn: &Connection, id: i64, message: &str, retriable: bool) -> Result<()> {
    transition(conn, id, QueueStatus::Error)?;
    conn.execute(
        "UPDATE sync_queue SET status = 'error', error_message = ?2, retriable = ?3
         WHERE id = ?1 AND status = 'processing'",
        rusqlite::params![id, message, retriable],
    )?;
    tracing::debug!(entry_id = id, retriable, "queue entry failed");
    Ok(())
}

/// Put a failed entry back in line.
///
/// Refused once a newer entry for the same block has been claimed, since
/// running the older change after it would undo the newer one.
pub fn requeue(conn: &Connection, id: i64) -> Result<()> {
    let entry = transition(conn, id, QueueStatus::Pending)?;
    let newer: Option<i64> = conn
        .query_row(
            "SELECT id FROM sync_queue
             WHERE block_key = ?1 AND id > ?2 AND status IN ('processing', 'success')
             ORDER BY id DESC
             LIMIT 1",
            rusqlite::params![entry.block_key, id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(newer) = newer {
        return Err(StoreError::Superseded { id, newer });
    }
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', error_message = NULL, retriable = 0
         WHERE id = ?1 AND status = 'error'",
        [id],
    )?;
    Ok(())
}

/// Release a conflict for processing, optionally replacing its payload.
pub fn resolve_conflict(conn: &Connection, id: i64, payload: Option<&Value>) -> Result<SyncQueueEntry> {
    transition(conn, id, QueueStatus::Processing)?;
    let payload = payload.map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE sync_queue SET status = 'processing', payload = COALESCE(?2, payload)
         WHERE id = ?1 AND status = 'conflict'",
        rusqlite::params![id, payload],
    )?;
    get(conn, id)
}

/// Record a decision a human has to make. The entry starts out in
/// `conflict` and blocks later entries for its `block_key` until resolved.
pub fn open_conflict(conn: &Connection, entry: &NewEntry, now: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_queue (local_path, block_key, local_block_id, remote_id, direction,
             change_type, payload, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'conflict', ?8)",
        rusqlite::params![
            entry.local_path,
            entry.block_key,
            entry.local_block_id,
            entry.remote_id,
            entry.direction.as_str(),
            entry.change_type.as_str(),
            serde_json::to_string(&entry.payload)?,
            to_millis(now),
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::info!(entry_id = id, block_key = %entry.block_key, "conflict waiting for a decision");
    Ok(id)
}

/// Claim the oldest pending entry that names no local document.
pub fn dequeue_unrouted(conn: &Connection) -> Result<Option<SyncQueueEntry>> {
    let claimed: Option<i64> = conn
        .query_row(
            "UPDATE sync_queue
             SET status = 'processing', attempts = attempts + 1
             WHERE id = (
                 SELECT q.id FROM sync_queue q
                 WHERE q.status = 'pending' AND q.local_path IS NULL
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_queue o
                       WHERE o.block_key = q.block_key
                         AND o.id < q.id
                         AND o.status IN ('pending', 'processing', 'conflict'))
                 ORDER BY q.id
                 LIMIT 1)
             RETURNING id",
            [],
            |row| row.get(0),
        )
        .optional()?;
    claimed.map(|id| get(conn, id)).transpose()
}

/// Fail entries a previous run left in `processing`.
pub fn fail_interrupted(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE sync_queue SET status = 'error', retriable = 1,
             error_message = 'interrupted before completion'
         WHERE status = 'processing'",
        [],
    )?;
    if n > 0 {
        tracing::warn!(entries = n, "marked interrupted queue entries as failed");
    }
    Ok(n)
}

pub fn counts(conn: &Connection) -> Result<QueueCounts> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let mut counts = QueueCounts::default();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (status, n) = row?;
        let n = n as u64;
        match QueueStatus::from_str(&status) {
            Some(QueueStatus::Pending) => counts.pending_count = n,
            Some(QueueStatus::Processing) => counts.processing_count = n,
            Some(QueueStatus::Success) => counts.success_count = n,
            Some(QueueStatus::Error) => counts.error_count = n,
            Some(QueueStatus::Conflict) => counts.conflict_count = n,
            None => {}
        }
        counts.total += n;
    }
    Ok(counts)
}

/// The `limit` most recent entries, newest first.
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<SyncQueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM sync_queue ORDER BY id DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit as i64], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Entries in `status`, oldest first, optionally for one document.
pub fn with_status(
    conn: &Connection,
    status: QueueStatus,
    local_path: Option<&str>,
) -> Result<Vec<SyncQueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM sync_queue
         WHERE status = ?1 AND (?2 IS NULL OR local_path = ?2)
         ORDER BY id"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![status.as_str(), local_path], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Documents that still have pending entries.
pub fn pending_documents(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT local_path FROM sync_queue
         WHERE status = 'pending' AND local_path IS NOT NULL
         ORDER BY local_path",
    )?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete successful entries that finished before `cutoff`.
pub fn clear_completed(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM sync_queue WHERE status = 'success' AND synced_at < ?1",
        [to_millis(cutoff)],
    )?;
    tracing::info!(removed = n, "cleared completed queue entries");
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn local(conn: &Connection, path: &str, block: &str, at: DateTime<Utc>) -> i64 {
        let entry = NewEntry::to_remote(path, &BlockId::from(block), ChangeType::Update, json!({"n": 1}));
        enqueue(conn, &entry, at).expect("enqueue")
    }

    #[test]
    fn test_same_block_runs_in_creation_order() {
        let conn = crate::open_memory().expect("open");
        let t1 = Utc::now();
        let first = local(&conn, "cave.md", "b1", t1);
        let second = local(&conn, "cave.md", "b1", t1 + Duration::seconds(1));

        let claimed = dequeue_next(&conn, None).expect("dequeue").expect("entry");
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        // The newer update waits while the older one is in flight
        assert!(dequeue_next(&conn, None).expect("dequeue").is_none());

        mark(&conn, first, QueueStatus::Success, None, Utc::now()).expect("mark");
        let next = dequeue_next(&conn, None).expect("dequeue").expect("entry");
        assert_eq!(next.id, second);
    }

    #[test]
    fn test_failed_entry_stays_down_once_a_newer_one_succeeds() {
        let conn = crate::open_memory().expect("open");
        let t1 = Utc::now();
        let first = local(&conn, "cave.md", "b1", t1);
        let second = local(&conn, "cave.md", "b1", t1 + Duration::seconds(1));

        dequeue_next(&conn, None).expect("dequeue");
        mark_failed(&conn, first, "timed out", true).expect("fail");
        let claimed = dequeue_next(&conn, None).expect("dequeue").expect("entry");
        assert_eq!(claimed.id, second);

        // In flight counts as well as done
        assert!(matches!(
            requeue(&conn, first),
            Err(StoreError::Superseded { id, newer }) if id == first && newer == second
        ));
        mark(&conn, second, QueueStatus::Success, None, Utc::now()).expect("mark");
        assert!(matches!(requeue(&conn, first), Err(StoreError::Superseded { .. })));

        assert!(dequeue_next(&conn, None).expect("dequeue").is_none());
        assert_eq!(get(&conn, first).expect("get").status, QueueStatus::Error);
    }

    #[test]
    fn test_failed_entry_requeues_ahead_of_waiting_newer_one() {
        let conn = crate::open_memory().expect("open");
        let t1 = Utc::now();
        let first = local(&conn, "cave.md", "b1", t1);
        dequeue_next(&conn, None).expect("dequeue");
        mark_failed(&conn, first, "timed out", true).expect("fail");
        let second = local(&conn, "cave.md", "b1", t1 + Duration::seconds(1));

        requeue(&conn, first).expect("requeue");
        assert_eq!(dequeue_next(&conn, None).expect("dequeue").map(|e| e.id), Some(first));
        assert!(dequeue_next(&conn, None).expect("dequeue").is_none());
        mark(&conn, first, QueueStatus::Success, None, Utc::now()).expect("mark");
        assert_eq!(dequeue_next(&conn, None).expect("dequeue").map(|e| e.id), Some(second));
    }

    #[test]
    fn test_unrelated_blocks_are_not_held_up() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        let a = local(&conn, "cave.md", "b1", now);
        let b = local(&conn, "cave.md", "b2", now);

        assert_eq!(dequeue_next(&conn, None).expect("dequeue").map(|e| e.id), Some(a));
        assert_eq!(dequeue_next(&conn, None).expect("dequeue").map(|e| e.id), Some(b));
    }

    #[test]
    fn test_conflict_blocks_later_entries() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        let first = local(&conn, "cave.md", "b1", now);
        let second = local(&conn, "cave.md", "b1", now);

        dequeue_next(&conn, None).expect("dequeue");
        mark(&conn, first, QueueStatus::Conflict, Some("needs a decision"), now).expect("mark");
        assert!(dequeue_next(&conn, None).expect("dequeue").is_none());

        let resolved = resolve_conflict(&conn, first, Some(&json!({"n": 2}))).expect("resolve");
        assert_eq!(resolved.status, QueueStatus::Processing);
        assert_eq!(resolved.payload, json!({"n": 2}));
        mark(&conn, first, QueueStatus::Success, None, now).expect("mark");
        assert_eq!(dequeue_next(&conn, None).expect("dequeue").map(|e| e.id), Some(second));
    }

    #[test]
    fn test_document_filter() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        local(&conn, "a.md", "b1", now);
        let b = local(&conn, "b.md", "b1", now);
        let claimed = dequeue_next(&conn, Some("b.md")).expect("dequeue").expect("entry");
        assert_eq!(claimed.id, b);
        assert_eq!(pending_documents(&conn).expect("docs"), vec!["a.md"]);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let conn = crate::open_memory().expect("open");
        let id = local(&conn, "cave.md", "b1", Utc::now());
        let err = mark(&conn, id, QueueStatus::Success, None, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: QueueStatus::Pending,
                to: QueueStatus::Success,
                ..
            }
        ));
        assert!(matches!(requeue(&conn, id), Err(StoreError::InvalidTransition { .. })));
        assert!(matches!(get(&conn, 999), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_failed_entry_can_be_requeued() {
        let conn = crate::open_memory().expect("open");
        let id = local(&conn, "cave.md", "b1", Utc::now());
        dequeue_next(&conn, None).expect("dequeue");
        mark_failed(&conn, id, "timed out", true).expect("fail");

        let failed = get(&conn, id).expect("get");
        assert_eq!(failed.status, QueueStatus::Error);
        assert!(failed.retriable);

        requeue(&conn, id).expect("requeue");
        let again = dequeue_next(&conn, None).expect("dequeue").expect("entry");
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
        assert_eq!(again.error_message, None);
    }

    #[test]
    fn test_counts_and_recent() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        let a = local(&conn, "cave.md", "b1", now);
        local(&conn, "cave.md", "b2", now);
        let c = local(&conn, "cave.md", "b3", now);
        dequeue_next(&conn, None).expect("dequeue");
        mark(&conn, a, QueueStatus::Success, None, now).expect("mark");

        let counts = counts(&conn).expect("counts");
        assert_eq!(counts.pending_count, 2);
        assert_eq!(counts.success_count, 1);
        assert_eq!(counts.total, 3);

        let newest = recent(&conn, 2).expect("recent");
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id, c);
    }

    #[test]
    fn test_clear_completed_keeps_recent_work() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        let old = local(&conn, "cave.md", "b1", now);
        let fresh = local(&conn, "cave.md", "b2", now);
        for id in [old, fresh] {
            dequeue_next(&conn, None).expect("dequeue");
            let at = if id == old { now - Duration::days(40) } else { now };
            mark(&conn, id, QueueStatus::Success, None, at).expect("mark");
        }

        assert_eq!(clear_completed(&conn, now - Duration::days(30)).expect("clear"), 1);
        assert!(get(&conn, old).is_err());
        assert!(get(&conn, fresh).is_ok());
    }

    #[test]
    fn test_interrupted_entries_fail_retriably() {
        let conn = crate::open_memory().expect("open");
        let id = local(&conn, "cave.md", "b1", Utc::now());
        dequeue_next(&conn, None).expect("dequeue");
        assert_eq!(fail_interrupted(&conn).expect("fail"), 1);
        let entry = get(&conn, id).expect("get");
        assert_eq!(entry.status, QueueStatus::Error);
        assert!(entry.retriable);
    }

    #[test]
    fn test_remote_entries_key_by_remote_id() {
        let conn = crate::open_memory().expect("open");
        let entry = NewEntry::from_remote(None, "r-9", ChangeType::Delete, json!({}));
        let id = enqueue(&conn, &entry, Utc::now()).expect("enqueue");
        let stored = get(&conn, id).expect("get");
        assert_eq!(stored.block_key, "remote:r-9");
        assert_eq!(stored.direction, SyncDirection::FromRemote);
        assert_eq!(stored.local_path, None);
    }

    #[test]
    fn test_open_conflict_holds_its_block() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        let entry = NewEntry::to_remote("cave.md", &BlockId::from("frontmatter"), ChangeType::Update, json!({}));
        let conflict = open_conflict(&conn, &entry, now).expect("open conflict");
        let later = local(&conn, "cave.md", "frontmatter", now);

        assert_eq!(get(&conn, conflict).expect("get").status, QueueStatus::Conflict);
        assert!(dequeue_next(&conn, Some("cave.md")).expect("dequeue").is_none());

        resolve_conflict(&conn, conflict, None).expect("resolve");
        mark(&conn, conflict, QueueStatus::Success, None, now).expect("mark");
        assert_eq!(dequeue_next(&conn, None).expect("dequeue").map(|e| e.id), Some(later));
    }

    #[test]
    fn test_dequeue_unrouted_skips_known_documents() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        local(&conn, "cave.md", "b1", now);
        let stray = enqueue(&conn, &NewEntry::from_remote(None, "r-1", ChangeType::Update, json!({})), now)
            .expect("enqueue");

        let claimed = dequeue_unrouted(&conn).expect("dequeue").expect("entry");
        assert_eq!(claimed.id, stray);
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert!(dequeue_unrouted(&conn).expect("dequeue").is_none());
    }

    #[test]
    fn test_dequeue_unrouted_keeps_block_order() {
        let conn = crate::open_memory().expect("open");
        let now = Utc::now();
        let change = |t| NewEntry::from_remote(None, "r-1", t, json!({}));
        let older = enqueue(&conn, &change(ChangeType::Update), now).expect("enqueue");
        let newer = enqueue(&conn, &change(ChangeType::Delete), now).expect("enqueue");

        assert_eq!(dequeue_unrouted(&conn).expect("dequeue").map(|e| e.id), Some(older));
        // The newer change waits while the older one is in flight
        assert!(dequeue_unrouted(&conn).expect("dequeue").is_none());
        mark_failed(&conn, older, "no local document", false).expect("fail");
        assert_eq!(dequeue_unrouted(&conn).expect("dequeue").map(|e| e.id), Some(newer));
    }
}
