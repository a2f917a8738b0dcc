//! Block mapping queries.
//!
//! One row joins a local block to its remote counterpart. Rows are keyed by
//! `(local_path, local_block_id)`; a remote block id is unique within its
//! remote document.

use blockbridge_core::identity::{content_hash, KnownBlock};
use blockbridge_core::mapper::caption_for;
use blockbridge_core::Block;
use blockbridge_types::BlockId;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use crate::{duplicate_or, from_millis, to_millis, Result};

/// What a caller records after syncing one block.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMapping {
    pub local_path: String,
    pub local_block_id: String,
    pub remote_block_id: String,
    pub remote_document_id: String,
    pub block_kind: String,
    pub position: usize,
    pub content_hash: String,
    pub caption: Option<String>,
    /// Runtime metadata at last sync
    pub block_metadata: Option<Value>,
    /// The whole block at last sync, the base for three-way merges
    pub snapshot: Option<Value>,
}

impl NewMapping {
    /// Describe `block` as synced to `remote_block_id` at `position`.
    pub fn for_block(
        local_path: &str,
        remote_document_id: &str,
        remote_block_id: &str,
        block: &Block,
        position: usize,
    ) -> Result<Self> {
        Ok(Self {
            local_path: local_path.to_string(),
            local_block_id: block.id.to_string(),
            remote_block_id: remote_block_id.to_string(),
            remote_document_id: remote_document_id.to_string(),
            block_kind: block.kind.tag().to_string(),
            position,
            content_hash: content_hash(block),
            caption: caption_for(&block.kind),
            block_metadata: block
                .runtime_metadata
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            snapshot: Some(serde_json::to_value(block)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockMapping {
    pub local_path: String,
    pub local_block_id: String,
    pub remote_block_id: String,
    pub remote_document_id: String,
    pub block_kind: String,
    pub position: usize,
    pub content_hash: String,
    pub caption: Option<String>,
    pub block_metadata: Option<Value>,
    #[serde(skip)]
    pub snapshot: Option<Value>,
    pub last_synced: DateTime<Utc>,
}

impl BlockMapping {
    /// The block as it was at last sync, if a snapshot was stored.
    pub fn snapshot_block(&self) -> Option<Block> {
        self.snapshot
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn known_block(&self) -> KnownBlock {
        KnownBlock {
            id: BlockId::new(self.local_block_id.clone()),
            kind_tag: self.block_kind.clone(),
            position: self.position,
            content_hash: self.content_hash.clone(),
        }
    }
}

const COLUMNS: &str = "local_path, local_block_id, remote_block_id, remote_document_id, block_kind,
     position, content_hash, caption, block_metadata, snapshot, last_synced";

fn parse_json(text: Option<String>) -> Option<Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<BlockMapping> {
    Ok(BlockMapping {
        local_path: row.get(0)?,
        local_block_id: row.get(1)?,
        remote_block_id: row.get(2)?,
        remote_document_id: row.get(3)?,
        block_kind: row.get(4)?,
        position: row.get::<_, i64>(5)? as usize,
        content_hash: row.get(6)?,
        caption: row.get(7)?,
        block_metadata: parse_json(row.get(8)?),
        snapshot: parse_json(row.get(9)?),
        last_synced: from_millis(row.get(10)?),
    })
}

/// Record or refresh a mapping.
///
/// Identical arguments leave the row (and its `last_synced`) untouched.
/// Returns whether anything was written. Pointing a second local block at
/// a remote block that is already mapped fails with `DuplicateMapping`.
pub fn record_mapping(conn: &Connection, mapping: &NewMapping, now: DateTime<Utc>) -> Result<bool> {
    let metadata = mapping
        .block_metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let snapshot = mapping.snapshot.as_ref().map(serde_json::to_string).transpose()?;

    let changed = conn
        .execute(
            "INSERT INTO block_mappings (local_path, local_block_id, remote_block_id,
                 remote_document_id, block_kind, position, content_hash, caption,
                 block_metadata, snapshot, last_synced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(local_path, local_block_id) DO UPDATE SET
                 remote_block_id = excluded.remote_block_id,
                 remote_document_id = excluded.remote_document_id,
                 block_kind = excluded.block_kind,
                 position = excluded.position,
                 content_hash = excluded.content_hash,
                 caption = excluded.caption,
                 block_metadata = excluded.block_metadata,
                 snapshot = excluded.snapshot,
                 last_synced = excluded.last_synced
             WHERE remote_block_id IS NOT excluded.remote_block_id
                OR remote_document_id IS NOT excluded.remote_document_id
                OR block_kind IS NOT excluded.block_kind
                OR position IS NOT excluded.position
                OR content_hash IS NOT excluded.content_hash
                OR caption IS NOT excluded.caption
                OR block_metadata IS NOT excluded.block_metadata
                OR snapshot IS NOT excluded.snapshot",
            rusqlite::params![
                mapping.local_path,
                mapping.local_block_id,
                mapping.remote_block_id,
                mapping.remote_document_id,
                mapping.block_kind,
                mapping.position as i64,
                mapping.content_hash,
                mapping.caption,
                metadata,
                snapshot,
                to_millis(now),
            ],
        )
        .map_err(|e| {
            duplicate_or(e, || {
                format!(
                    "remote block {} is already mapped in document {}",
                    mapping.remote_block_id, mapping.remote_document_id
                )
            })
        })?;
    Ok(changed > 0)
}

pub fn get(conn: &Connection, local_path: &str, local_block_id: &str) -> Result<Option<BlockMapping>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM block_mappings WHERE local_path = ?1 AND local_block_id = ?2"
            ),
            [local_path, local_block_id],
            from_row,
        )
        .optional()?)
}

/// Find the mapping for a remote block, in any document.
pub fn by_remote(conn: &Connection, remote_block_id: &str) -> Result<Option<BlockMapping>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM block_mappings WHERE remote_block_id = ?1
                 ORDER BY last_synced DESC LIMIT 1"
            ),
            [remote_block_id],
            from_row,
        )
        .optional()?)
}

/// All mappings for one document in position order.
pub fn for_document(conn: &Connection, local_path: &str) -> Result<Vec<BlockMapping>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM block_mappings WHERE local_path = ?1 ORDER BY position, local_block_id"
    ))?;
    let rows = stmt
        .query_map([local_path], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list(conn: &Connection) -> Result<Vec<BlockMapping>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM block_mappings ORDER BY local_path, position, local_block_id"
    ))?;
    let rows = stmt
        .query_map([], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Remove a block's mapping and the variables it declared.
///
/// This is the only path that deletes runtime variables.
pub fn remove_block(conn: &Connection, local_path: &str, local_block_id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM block_mappings WHERE local_path = ?1 AND local_block_id = ?2",
        [local_path, local_block_id],
    )?;
    crate::variables::delete_for_block(conn, local_path, local_block_id)?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use blockbridge_core::parse;

    fn mapping(local_id: &str, remote_id: &str) -> NewMapping {
        NewMapping {
            local_path: "cave.md".into(),
            local_block_id: local_id.into(),
            remote_block_id: remote_id.into(),
            remote_document_id: "page-1".into(),
            block_kind: "paragraph".into(),
            position: 0,
            content_hash: "h1".into(),
            caption: None,
            block_metadata: None,
            snapshot: None,
        }
    }

    #[test]
    fn test_record_mapping_is_idempotent() {
        let conn = crate::open_memory().expect("open");
        let first = Utc::now();
        assert!(record_mapping(&conn, &mapping("a", "r1"), first).expect("insert"));

        let later = first + chrono::Duration::seconds(60);
        assert!(!record_mapping(&conn, &mapping("a", "r1"), later).expect("repeat"));

        let rows = list(&conn).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_synced.timestamp_millis(), first.timestamp_millis());
    }

    #[test]
    fn test_changed_metadata_updates_last_synced() {
        let conn = crate::open_memory().expect("open");
        let first = Utc::now();
        record_mapping(&conn, &mapping("a", "r1"), first).expect("insert");

        let mut changed = mapping("a", "r1");
        changed.block_metadata = Some(serde_json::json!({"kind": "state", "variables": []}));
        let later = first + chrono::Duration::seconds(60);
        assert!(record_mapping(&conn, &changed, later).expect("update"));

        let row = get(&conn, "cave.md", "a").expect("get").expect("exists");
        assert_eq!(row.last_synced.timestamp_millis(), later.timestamp_millis());
        assert_eq!(row.block_metadata, changed.block_metadata);
    }

    #[test]
    fn test_remote_block_maps_once_per_document() {
        let conn = crate::open_memory().expect("open");
        record_mapping(&conn, &mapping("a", "r1"), Utc::now()).expect("insert");
        let err = record_mapping(&conn, &mapping("b", "r1"), Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMapping(_)));

        let mut elsewhere = mapping("b", "r1");
        elsewhere.remote_document_id = "page-2".into();
        record_mapping(&conn, &elsewhere, Utc::now()).expect("other document");
    }

    #[test]
    fn test_snapshot_restores_block() {
        let conn = crate::open_memory().expect("open");
        let blocks = parse("```state\n$hp = 100\n```\n").expect("parse");
        let new = NewMapping::for_block("cave.md", "page-1", "r1", &blocks[0], 0).expect("mapping");
        assert_eq!(new.caption.as_deref(), Some("[TYPE:STATE]"));
        record_mapping(&conn, &new, Utc::now()).expect("insert");

        let row = by_remote(&conn, "r1").expect("query").expect("exists");
        assert_eq!(row.snapshot_block(), Some(blocks[0].clone()));
        assert_eq!(row.known_block().id, blocks[0].id);
    }

    #[test]
    fn test_remove_block_drops_variables() {
        let conn = crate::open_memory().expect("open");
        let blocks = parse("```state\n$hp = 100\n```\n").expect("parse");
        let block = &blocks[0];
        let new = NewMapping::for_block("cave.md", "page-1", "r1", block, 0).expect("mapping");
        record_mapping(&conn, &new, Utc::now()).expect("insert");
        let decls = block.runtime_metadata.as_ref().expect("metadata").declared_variables();
        crate::variables::upsert_block(&conn, "cave.md", block.id.as_str(), &decls, Utc::now())
            .expect("variables");

        assert!(remove_block(&conn, "cave.md", block.id.as_str()).expect("remove"));
        assert!(for_document(&conn, "cave.md").expect("list").is_empty());
        assert!(crate::variables::for_document(&conn, "cave.md")
            .expect("vars")
            .is_empty());
    }
}
