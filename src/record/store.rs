//! Record Store — the canonical write and read path for typed records.
//!
//! [`submit_record`] runs the full write pipeline inside a transaction:
//! domain validation, identity + timestamp assignment, tag sync, the
//! initial coordination row, and an audit log entry. Mutations happen only
//! through [`update_record`] and [`delete_record`]; derived fields are
//! written exclusively by the metrics engine.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::record::metrics;
use crate::record::types::{
    Domain, DomainPayload, Generated, NewRecord, Record, RecordUpdate,
};
use crate::record::{goals, now_rfc3339};

/// Kind of change emitted by a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Change notification consumed by the consistency coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct Change {
    pub record_id: String,
    pub domain: Domain,
    pub kind: ChangeKind,
}

/// Result returned from a submit operation.
#[derive(Debug, Serialize)]
pub struct SubmitResult {
    /// UUID of the stored record.
    pub id: String,
    pub domain: Domain,
    /// Change notification for the coordinator.
    #[serde(skip)]
    pub change: Change,
}

/// Filters for [`query_records`]. All fields are optional and combine with
/// AND; results are ordered by occurrence date descending, then id.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub owner: Option<String>,
    pub domain: Option<Domain>,
    pub tag: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<usize>,
}

/// Full write path: validate → assign identity → insert → tags →
/// coordination row → audit log. All inside one transaction.
///
/// The record is visible to plain queries as soon as this returns; the
/// embedding and settled metrics follow through the coordinator.
pub fn submit_record(conn: &mut Connection, new: NewRecord) -> Result<SubmitResult> {
    let mut payload = new.payload;
    payload.validate()?;
    derive_word_count(&mut payload, new.content.as_deref());

    let tx = conn.transaction().map_err(StoreError::Database)?;

    if let DomainPayload::Goal(ref g) = payload {
        goals::check_parent(&tx, None, g.parent_goal.as_deref())?;
    }

    let id = uuid::Uuid::now_v7().to_string();
    let domain = payload.domain();
    let now = now_rfc3339();
    let generated = metrics::recompute_generated_payload(&payload);
    let payload_json = serde_json::to_string(&payload).map_err(anyhow::Error::from)?;
    let generated_json = serde_json::to_string(&generated).map_err(anyhow::Error::from)?;

    tx.execute(
        "INSERT INTO records (id, owner, domain, occurred_on, content, payload, generated, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            new.owner,
            domain.as_str(),
            new.occurred_on.to_string(),
            new.content,
            payload_json,
            generated_json,
            now,
        ],
    )?;

    replace_tags(&tx, &id, &new.tags)?;

    // Durable queue entry for the coordinator; retriable after a crash.
    tx.execute(
        "INSERT INTO coordination (record_id, state, attempts, updated_at) \
         VALUES (?1, 'submitted', 0, ?2)",
        params![id, now],
    )?;

    write_audit_log(&tx, "create", &id, Some(&serde_json::json!({"domain": domain.as_str()})))?;

    tx.commit()?;
    tracing::debug!(id = %id, domain = %domain, "record submitted");

    Ok(SubmitResult {
        change: Change {
            record_id: id.clone(),
            domain,
            kind: ChangeKind::Created,
        },
        id,
        domain,
    })
}

/// Apply an explicit field update. Last-writer-wins; `updated_at` is
/// monotonically non-decreasing. Replacing content re-queues coordination
/// from `submitted` so the embedding is refreshed from the new state.
pub fn update_record(
    conn: &mut Connection,
    record_id: &str,
    update: RecordUpdate,
) -> Result<Record> {
    let tx = conn.transaction().map_err(StoreError::Database)?;

    let mut record = fetch_record(&tx, record_id)?
        .filter(|r| r.deleted_at.is_none())
        .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;

    if let Some(payload) = update.payload {
        if payload.domain() != record.domain() {
            return Err(StoreError::validation(
                "payload",
                format!(
                    "domain is immutable: record is {}, update is {}",
                    record.domain(),
                    payload.domain()
                ),
            ));
        }
        payload.validate()?;
        if let DomainPayload::Goal(ref g) = payload {
            goals::check_parent(&tx, Some(record_id), g.parent_goal.as_deref())?;
        }
        record.payload = payload;
    }
    if let Some(occurred_on) = update.occurred_on {
        record.occurred_on = occurred_on;
    }

    let content_changed = match update.content {
        Some(content) => {
            let changed = content != record.content;
            record.content = content;
            changed
        }
        None => false,
    };
    derive_word_count(&mut record.payload, record.content.as_deref());

    if let Some(tags) = update.tags {
        record.tags = tags;
        replace_tags(&tx, record_id, &record.tags)?;
    }

    // Monotonic even if the wall clock stepped backwards.
    let now = now_rfc3339();
    record.updated_at = if now > record.updated_at { now } else { record.updated_at };
    record.generated = metrics::recompute_generated_payload(&record.payload);

    let payload_json = serde_json::to_string(&record.payload).map_err(anyhow::Error::from)?;
    let generated_json =
        serde_json::to_string(&record.generated).map_err(anyhow::Error::from)?;

    tx.execute(
        "UPDATE records SET occurred_on = ?1, content = ?2, payload = ?3, generated = ?4, updated_at = ?5 \
         WHERE id = ?6",
        params![
            record.occurred_on.to_string(),
            record.content,
            payload_json,
            generated_json,
            record.updated_at,
            record_id,
        ],
    )?;

    if content_changed {
        tx.execute(
            "INSERT INTO coordination (record_id, state, attempts, last_error, updated_at) \
             VALUES (?1, 'submitted', 0, NULL, ?2) \
             ON CONFLICT(record_id) DO UPDATE SET \
                 state = 'submitted', attempts = 0, last_error = NULL, updated_at = ?2",
            params![record_id, record.updated_at],
        )?;
    }

    write_audit_log(
        &tx,
        "update",
        record_id,
        Some(&serde_json::json!({"content_changed": content_changed})),
    )?;

    tx.commit()?;
    Ok(record)
}

/// Fetch one record by id. `NotFound` if absent or tombstoned.
pub fn get_record(conn: &Connection, record_id: &str) -> Result<Record> {
    fetch_record(conn, record_id)?
        .filter(|r| r.deleted_at.is_none())
        .ok_or_else(|| StoreError::NotFound(record_id.to_string()))
}

/// Query records by owner/domain/tag/date range. Pure read; excludes
/// tombstones; ordered by occurrence date descending, then id for
/// determinism.
pub fn query_records(conn: &Connection, query: &RecordQuery) -> Result<Vec<Record>> {
    let mut sql = String::from(
        "SELECT r.id, r.owner, r.domain, r.occurred_on, r.content, r.payload, \
         r.generated, r.created_at, r.updated_at, r.deleted_at \
         FROM records r WHERE r.deleted_at IS NULL",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref owner) = query.owner {
        params_vec.push(Box::new(owner.clone()));
        sql.push_str(&format!(" AND r.owner = ?{}", params_vec.len()));
    }
    if let Some(domain) = query.domain {
        params_vec.push(Box::new(domain.as_str()));
        sql.push_str(&format!(" AND r.domain = ?{}", params_vec.len()));
    }
    if let Some(ref tag) = query.tag {
        params_vec.push(Box::new(tag.clone()));
        sql.push_str(&format!(
            " AND r.id IN (SELECT record_id FROM record_tags WHERE tag = ?{})",
            params_vec.len()
        ));
    }
    if let Some(from) = query.from {
        params_vec.push(Box::new(from.to_string()));
        sql.push_str(&format!(" AND r.occurred_on >= ?{}", params_vec.len()));
    }
    if let Some(to) = query.to {
        params_vec.push(Box::new(to.to_string()));
        sql.push_str(&format!(" AND r.occurred_on <= ?{}", params_vec.len()));
    }

    sql.push_str(" ORDER BY r.occurred_on DESC, r.id DESC");
    if let Some(limit) = query.limit {
        params_vec.push(Box::new(limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", params_vec.len()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        params_vec.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), row_to_raw)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(|raw| hydrate(conn, raw)).collect()
}

/// Tombstone a record. The vector index entry and the coordination row are
/// retracted synchronously with the deletion being acknowledged; the record
/// row itself is kept as a logical tombstone.
pub fn delete_record(conn: &mut Connection, record_id: &str) -> Result<Change> {
    let tx = conn.transaction().map_err(StoreError::Database)?;

    let record = fetch_record(&tx, record_id)?
        .filter(|r| r.deleted_at.is_none())
        .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;

    let now = now_rfc3339();
    tx.execute(
        "UPDATE records SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![now, record_id],
    )?;
    tx.execute("DELETE FROM records_vec WHERE id = ?1", params![record_id])?;
    tx.execute(
        "DELETE FROM coordination WHERE record_id = ?1",
        params![record_id],
    )?;

    write_audit_log(&tx, "delete", record_id, None)?;

    tx.commit()?;
    tracing::debug!(id = %record_id, "record tombstoned");

    Ok(Change {
        record_id: record_id.to_string(),
        domain: record.domain(),
        kind: ChangeKind::Deleted,
    })
}

/// Write an entry to the record_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    record_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = now_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO record_log (operation, record_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, record_id, details_json, now],
    )?;
    Ok(())
}

// ── Internal helpers ──────────────────────────────────────────────────────────

/// Journal word counts are derived from content, never caller-supplied.
fn derive_word_count(payload: &mut DomainPayload, content: Option<&str>) {
    if let DomainPayload::Journal(j) = payload {
        j.word_count = content
            .map(|c| c.split_whitespace().count() as u32)
            .unwrap_or(0);
    }
}

/// Replace the full tag set for a record.
fn replace_tags(tx: &Transaction, record_id: &str, tags: &[String]) -> Result<()> {
    tx.execute(
        "DELETE FROM record_tags WHERE record_id = ?1",
        params![record_id],
    )?;
    let mut stmt =
        tx.prepare("INSERT OR IGNORE INTO record_tags (record_id, tag) VALUES (?1, ?2)")?;
    for tag in tags {
        stmt.execute(params![record_id, tag])?;
    }
    Ok(())
}

struct RawRow {
    id: String,
    owner: String,
    occurred_on: String,
    content: Option<String>,
    payload: String,
    generated: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        owner: row.get(1)?,
        // column 2 is the domain tag; the payload JSON is authoritative
        occurred_on: row.get(3)?,
        content: row.get(4)?,
        payload: row.get(5)?,
        generated: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

fn hydrate(conn: &Connection, raw: RawRow) -> Result<Record> {
    let payload: DomainPayload =
        serde_json::from_str(&raw.payload).map_err(anyhow::Error::from)?;
    let generated: Generated = raw
        .generated
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(anyhow::Error::from)?
        .unwrap_or_default();
    let occurred_on = raw
        .occurred_on
        .parse::<NaiveDate>()
        .map_err(anyhow::Error::from)?;

    let mut stmt =
        conn.prepare("SELECT tag FROM record_tags WHERE record_id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map(params![raw.id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(Record {
        id: raw.id,
        owner: raw.owner,
        occurred_on,
        content: raw.content,
        tags,
        payload,
        generated,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        deleted_at: raw.deleted_at,
    })
}

fn fetch_record(conn: &Connection, record_id: &str) -> Result<Option<Record>> {
    let raw = conn
        .query_row(
            "SELECT id, owner, domain, occurred_on, content, payload, generated, \
             created_at, updated_at, deleted_at FROM records WHERE id = ?1",
            params![record_id],
            row_to_raw,
        )
        .optional()?;
    raw.map(|r| hydrate(conn, r)).transpose()
}
