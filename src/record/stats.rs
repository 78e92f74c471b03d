//! Store statistics for observability and sanity checks.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Result;

/// Snapshot of store contents and coordination backlog.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub active_records: i64,
    pub tombstoned_records: i64,
    /// Active record counts keyed by domain.
    pub by_domain: BTreeMap<String, i64>,
    /// Coordination row counts keyed by state; `settled` included.
    pub coordination: BTreeMap<String, i64>,
    /// Rows in the vector index (settled embeddings).
    pub embedded_records: i64,
    /// On-disk size; `None` for in-memory databases.
    pub db_size_bytes: Option<u64>,
}

/// Gather store statistics in one pass of cheap aggregate queries.
pub fn store_stats(conn: &Connection) -> Result<StoreStats> {
    let active_records: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE deleted_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    let tombstoned_records: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE deleted_at IS NOT NULL",
        [],
        |row| row.get(0),
    )?;

    let mut by_domain = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT domain, COUNT(*) FROM records WHERE deleted_at IS NULL GROUP BY domain",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (domain, count) = row?;
        by_domain.insert(domain, count);
    }

    let mut coordination = BTreeMap::new();
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM coordination GROUP BY state")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (state, count) = row?;
        coordination.insert(state, count);
    }

    let embedded_records: i64 =
        conn.query_row("SELECT COUNT(*) FROM records_vec", [], |row| row.get(0))?;

    let db_size_bytes = conn
        .path()
        .filter(|p| !p.is_empty())
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len());

    Ok(StoreStats {
        active_records,
        tombstoned_records,
        by_domain,
        coordination,
        embedded_records,
        db_size_bytes,
    })
}
