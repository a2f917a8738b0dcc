//! Runtime variable queries.
//!
//! Rows are created when a `state` or `form` block is first synced and
//! updated when its declaration changes. A variable that disappears from
//! its block keeps its row; only [`crate::mappings::remove_block`] deletes.

use blockbridge_core::VariableDecl;
use blockbridge_types::VarType;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use serde::Serialize;
use serde_json::Value;

use crate::{from_millis, to_millis, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeVariable {
    pub local_path: String,
    pub block_id: String,
    pub var_name: String,
    pub var_type: VarType,
    pub initial_value: Value,
    pub updated_at: DateTime<Utc>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<RuntimeVariable> {
    let var_type: String = row.get(3)?;
    let initial: String = row.get(4)?;
    Ok(RuntimeVariable {
        local_path: row.get(0)?,
        block_id: row.get(1)?,
        var_name: row.get(2)?,
        var_type: VarType::from_str(&var_type).unwrap_or(VarType::String),
        initial_value: serde_json::from_str(&initial).unwrap_or(Value::Null),
        updated_at: from_millis(row.get(5)?),
    })
}

/// Insert or update one declaration. Returns whether the row changed.
pub fn upsert(
    conn: &Connection,
    local_path: &str,
    block_id: &str,
    decl: &VariableDecl,
    now: DateTime<Utc>,
) -> Result<bool> {
    let initial = serde_json::to_string(&decl.initial_value)?;
    let changed = conn.execute(
        "INSERT INTO runtime_variables (local_path, block_id, var_name, var_type, initial_value, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(local_path, block_id, var_name) DO UPDATE SET
             var_type = excluded.var_type,
             initial_value = excluded.initial_value,
             updated_at = excluded.updated_at
         WHERE var_type IS NOT excluded.var_type
            OR initial_value IS NOT excluded.initial_value",
        rusqlite::params![
            local_path,
            block_id,
            decl.name,
            decl.var_type.as_str(),
            initial,
            to_millis(now),
        ],
    )?;
    Ok(changed > 0)
}

/// Upsert every declaration of one block.
pub fn upsert_block(
    conn: &Connection,
    local_path: &str,
    block_id: &str,
    decls: &[VariableDecl],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut changed = 0;
    for decl in decls {
        if upsert(conn, local_path, block_id, decl, now)? {
            changed += 1;
        }
    }
    Ok(changed)
}

pub fn for_document(conn: &Connection, local_path: &str) -> Result<Vec<RuntimeVariable>> {
    let mut stmt = conn.prepare(
        "SELECT local_path, block_id, var_name, var_type, initial_value, updated_at
         FROM runtime_variables WHERE local_path = ?1 ORDER BY block_id, var_name",
    )?;
    let rows = stmt
        .query_map([local_path], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list(conn: &Connection) -> Result<Vec<RuntimeVariable>> {
    let mut stmt = conn.prepare(
        "SELECT local_path, block_id, var_name, var_type, initial_value, updated_at
         FROM runtime_variables ORDER BY local_path, block_id, var_name",
    )?;
    let rows = stmt
        .query_map([], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn delete_for_block(conn: &Connection, local_path: &str, block_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM runtime_variables WHERE local_path = ?1 AND block_id = ?2",
        [local_path, block_id],
    )?)
}
