//! SQL schema definitions.

/// Initial schema.
pub const SCHEMA_V1: &str = r#"
-- Local document <-> remote page pairs
CREATE TABLE IF NOT EXISTS documents (
    local_path          TEXT PRIMARY KEY,
    remote_document_id  TEXT NOT NULL UNIQUE,
    last_synced         INTEGER
);

-- Local block <-> remote block join records
CREATE TABLE IF NOT EXISTS block_mappings (
    local_path          TEXT NOT NULL,
    local_block_id      TEXT NOT NULL,
    remote_block_id     TEXT NOT NULL,
    remote_document_id  TEXT NOT NULL DEFAULT '',
    block_kind          TEXT NOT NULL,
    position            INTEGER NOT NULL DEFAULT 0,
    content_hash        TEXT NOT NULL,
    caption             TEXT,
    block_metadata      TEXT,
    snapshot            TEXT,
    last_synced         INTEGER NOT NULL,
    PRIMARY KEY (local_path, local_block_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_block_mappings_remote
    ON block_mappings(remote_document_id, remote_block_id);

-- Variables declared by state and form blocks
CREATE TABLE IF NOT EXISTS runtime_variables (
    local_path      TEXT NOT NULL,
    block_id        TEXT NOT NULL,
    var_name        TEXT NOT NULL,
    var_type        TEXT NOT NULL,
    initial_value   TEXT NOT NULL,
    updated_at      INTEGER NOT NULL,
    PRIMARY KEY (local_path, block_id, var_name)
);

-- External data sources declared in frontmatter
CREATE TABLE IF NOT EXISTS db_bindings (
    document_path   TEXT NOT NULL,
    namespace       TEXT NOT NULL,
    provider        TEXT NOT NULL,
    connection_path TEXT NOT NULL,
    bind_config     TEXT NOT NULL DEFAULT '[]',
    updated_at      INTEGER NOT NULL,
    PRIMARY KEY (document_path, namespace)
);

-- Pending, in-flight and finished changes
CREATE TABLE IF NOT EXISTS sync_queue (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    local_path      TEXT,
    block_key       TEXT NOT NULL,
    local_block_id  TEXT,
    remote_id       TEXT,
    direction       TEXT NOT NULL CHECK (direction IN ('to_remote', 'from_remote')),
    change_type     TEXT NOT NULL CHECK (change_type IN ('insert', 'update', 'delete')),
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'success', 'error', 'conflict')),
    attempts        INTEGER NOT NULL DEFAULT 0,
    retriable       INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    synced_at       INTEGER,
    error_message   TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, id);
CREATE INDEX IF NOT EXISTS idx_sync_queue_block ON sync_queue(block_key, id);
CREATE INDEX IF NOT EXISTS idx_sync_queue_path ON sync_queue(local_path, status);
"#;
