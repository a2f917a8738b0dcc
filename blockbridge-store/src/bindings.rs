//! Database binding queries.
//!
//! At most one binding exists per `(document_path, namespace)`.

use blockbridge_core::{DbBinding, Provider};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::{duplicate_or, from_millis, to_millis, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingRow {
    #[serde(flatten)]
    pub binding: DbBinding,
    pub updated_at: DateTime<Utc>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<BindingRow> {
    let provider: String = row.get(2)?;
    let bind_config: String = row.get(4)?;
    Ok(BindingRow {
        binding: DbBinding {
            document_path: row.get(0)?,
            namespace: row.get(1)?,
            provider: Provider::from(provider),
            connection_path: row.get(3)?,
            bind_config: serde_json::from_str(&bind_config).unwrap_or_default(),
        },
        updated_at: from_millis(row.get(5)?),
    })
}

/// Register a new binding; an existing `(document_path, namespace)` fails
/// with `DuplicateMapping`.
pub fn insert(conn: &Connection, binding: &DbBinding, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO db_bindings (document_path, namespace, provider, connection_path, bind_config, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            binding.document_path,
            binding.namespace,
            binding.provider.as_str(),
            binding.connection_path,
            serde_json::to_string(&binding.bind_config)?,
            to_millis(now),
        ],
    )
    .map_err(|e| {
        duplicate_or(e, || {
            format!(
                "binding {} already exists for {}",
                binding.namespace, binding.document_path
            )
        })
    })?;
    Ok(())
}

/// Insert or replace the binding for its `(document_path, namespace)`.
pub fn upsert(conn: &Connection, binding: &DbBinding, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO db_bindings (document_path, namespace, provider, connection_path, bind_config, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(document_path, namespace) DO UPDATE SET
             provider = excluded.provider,
             connection_path = excluded.connection_path,
             bind_config = excluded.bind_config,
             updated_at = excluded.updated_at
         WHERE provider IS NOT excluded.provider
            OR connection_path IS NOT excluded.connection_path
            OR bind_config IS NOT excluded.bind_config",
        rusqlite::params![
            binding.document_path,
            binding.namespace,
            binding.provider.as_str(),
            binding.connection_path,
            serde_json::to_string(&binding.bind_config)?,
            to_millis(now),
        ],
    )?;
    Ok(changed > 0)
}

pub fn get(conn: &Connection, document_path: &str, namespace: &str) -> Result<Option<DbBinding>> {
    Ok(conn
        .query_row(
            "SELECT document_path, namespace, provider, connection_path, bind_config, updated_at
             FROM db_bindings WHERE document_path = ?1 AND namespace = ?2",
            [document_path, namespace],
            from_row,
        )
        .optional()?
        .map(|row| row.binding))
}

pub fn for_document(conn: &Connection, document_path: &str) -> Result<Vec<DbBinding>> {
    let mut stmt = conn.prepare(
        "SELECT document_path, namespace, provider, connection_path, bind_config, updated_at
         FROM db_bindings WHERE document_path = ?1 ORDER BY namespace",
    )?;
    let rows = stmt
        .query_map([document_path], from_row)?
        .map(|r| r.map(|row| row.binding))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list(conn: &Connection) -> Result<Vec<BindingRow>> {
    let mut stmt = conn.prepare(
        "SELECT document_path, namespace, provider, connection_path, bind_config, updated_at
         FROM db_bindings ORDER BY document_path, namespace",
    )?;
    let rows = stmt
        .query_map([], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
