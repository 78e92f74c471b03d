//! SQL DDL for all lifelog tables.
//!
//! Defines the `records`, `record_tags`, `records_vec` (vec0),
//! `coordination`, `record_log`, and `schema_meta` tables. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

use crate::embedding::EMBEDDING_DIM;

/// All schema DDL statements for lifelog's core tables.
const SCHEMA_SQL: &str = r#"
-- Canonical record storage: common fields + JSON domain payload
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    domain TEXT NOT NULL CHECK(domain IN (
        'journal','business_activity','health_metric',
        'productivity_session','financial_transaction','goal')),
    occurred_on TEXT NOT NULL,
    content TEXT,
    payload TEXT NOT NULL,
    generated TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_records_owner ON records(owner);
CREATE INDEX IF NOT EXISTS idx_records_domain ON records(domain);
CREATE INDEX IF NOT EXISTS idx_records_occurred ON records(occurred_on);
CREATE INDEX IF NOT EXISTS idx_records_deleted ON records(deleted_at);

-- Tag side table so tag filters stay plain scalar queries
CREATE TABLE IF NOT EXISTS record_tags (
    record_id TEXT NOT NULL REFERENCES records(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (record_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_record_tags_tag ON record_tags(tag);

-- Per-record coordination state machine (persisted so partial work is retriable)
CREATE TABLE IF NOT EXISTS coordination (
    record_id TEXT PRIMARY KEY REFERENCES records(id) ON DELETE CASCADE,
    state TEXT NOT NULL CHECK(state IN (
        'submitted','embedding_pending','metrics_pending','settled','failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_coordination_state ON coordination(state);

-- Audit log of every mutation
CREATE TABLE IF NOT EXISTS record_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN (
        'create','update','delete','settle','fail','retry')),
    record_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
fn vec_table_sql() -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS records_vec USING vec0(\n\
         id TEXT PRIMARY KEY,\n\
         embedding FLOAT[{EMBEDDING_DIM}]\n\
         );"
    )
}

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&vec_table_sql())?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
