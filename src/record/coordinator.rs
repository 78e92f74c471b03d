//! Consistency coordinator — drives records from submitted to settled.
//!
//! A submit is acknowledged as soon as the record row commits; embedding
//! and derived-metric settlement happen afterwards, driven from the durable
//! `coordination` table. The table doubles as a retry queue: every state
//! transition is persisted, so a crash mid-pipeline leaves a row that the
//! next [`Coordinator::drive_pending`] pass picks up where it stopped.
//! Transitions are compare-and-swap on the (state, updated_at) pair, so a
//! mutation landing during the slow embedding call wins over the in-flight
//! result rather than the other way round.
//!
//! State machine per record:
//!
//! ```text
//! submitted → embedding_pending → metrics_pending → settled
//!     └──────── (no content) ──────────┘                └→ failed (exhausted)
//! ```

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::CoordinatorConfig;
use crate::embedding::EmbeddingSource;
use crate::error::{Result, StoreError};
use crate::record::store::{self, Change, SubmitResult};
use crate::record::types::{NewRecord, Record, RecordUpdate};
use crate::record::{metrics, now_rfc3339, search};

/// Coordination pipeline state for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationState {
    Submitted,
    EmbeddingPending,
    MetricsPending,
    Settled,
    Failed,
}

impl CoordinationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::EmbeddingPending => "embedding_pending",
            Self::MetricsPending => "metrics_pending",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for CoordinationState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "embedding_pending" => Ok(Self::EmbeddingPending),
            "metrics_pending" => Ok(Self::MetricsPending),
            "settled" => Ok(Self::Settled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown coordination state: {s}")),
        }
    }
}

/// Observable status of a record's coordination row.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationStatus {
    pub record_id: String,
    pub state: CoordinationState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Status is a query, never a thrown error: `Ok(None)` means no coordination
/// row exists for the id (unknown record, or one that was deleted).
pub fn coordination_status(
    conn: &Connection,
    record_id: &str,
) -> Result<Option<CoordinationStatus>> {
    let row = conn
        .query_row(
            "SELECT state, attempts, last_error FROM coordination WHERE record_id = ?1",
            params![record_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(state, attempts, last_error)| {
        let state = state
            .parse::<CoordinationState>()
            .map_err(anyhow::Error::msg)?;
        Ok(CoordinationStatus {
            record_id: record_id.to_string(),
            state,
            attempts,
            last_error,
        })
    })
    .transpose()
}

/// Map a failed coordination row to the error a caller that needs settled
/// data should see. Settled rows pass; pending rows pass too (the caller
/// handles staleness separately).
pub fn require_not_exhausted(conn: &Connection, record_id: &str) -> Result<()> {
    if let Some(status) = coordination_status(conn, record_id)? {
        if status.state == CoordinationState::Failed {
            return Err(StoreError::RetryExhausted {
                record_id: record_id.to_string(),
                attempts: status.attempts,
                reason: status
                    .last_error
                    .unwrap_or_else(|| "unknown failure".to_string()),
            });
        }
    }
    Ok(())
}

/// Re-queue a failed record for another round of attempts.
pub fn retry_failed(conn: &Connection, record_id: &str) -> Result<()> {
    let now = now_rfc3339();
    let changed = conn.execute(
        "UPDATE coordination SET state = 'submitted', attempts = 0, last_error = NULL, \
         updated_at = ?1 WHERE record_id = ?2 AND state = 'failed'",
        params![now, record_id],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!(
            "no failed coordination row for {record_id}"
        )));
    }
    store::write_audit_log(conn, "retry", record_id, None)?;
    Ok(())
}

struct PendingRow {
    record_id: String,
    state: CoordinationState,
    attempts: u32,
    updated_at: String,
}

impl PendingRow {
    /// First attempt runs immediately; retries wait out an exponential
    /// backoff from the last state change.
    fn eligible(&self, now: DateTime<Utc>, config: &CoordinatorConfig) -> bool {
        if self.attempts == 0 {
            return true;
        }
        let Ok(updated) = DateTime::parse_from_rfc3339(&self.updated_at) else {
            return true;
        };
        let exp = (self.attempts - 1).min(10);
        let delay = Duration::milliseconds((config.base_backoff_ms << exp) as i64);
        updated.with_timezone(&Utc) + delay <= now
    }
}

/// Owns the shared connection and the embedding source, and drives pending
/// coordination rows to settlement in the background.
pub struct Coordinator {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingSource>,
    config: CoordinatorConfig,
    notify: Notify,
}

impl Coordinator {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        embedder: Arc<dyn EmbeddingSource>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            conn,
            embedder,
            config,
            notify: Notify::new(),
        }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Submit a record. Returns as soon as the row commits; embedding and
    /// settlement happen asynchronously.
    pub async fn submit(&self, new: NewRecord) -> Result<SubmitResult> {
        let result = {
            let mut conn = self.conn.lock().await;
            store::submit_record(&mut conn, new)?
        };
        self.notify.notify_one();
        Ok(result)
    }

    pub async fn update(&self, record_id: &str, update: RecordUpdate) -> Result<Record> {
        let record = {
            let mut conn = self.conn.lock().await;
            store::update_record(&mut conn, record_id, update)?
        };
        self.notify.notify_one();
        Ok(record)
    }

    pub async fn delete(&self, record_id: &str) -> Result<Change> {
        let mut conn = self.conn.lock().await;
        store::delete_record(&mut conn, record_id)
    }

    /// One pass over the queue: drive every eligible row as far as it can
    /// go. Returns the number of records that reached `settled`.
    pub async fn drive_pending(&self) -> Result<usize> {
        let pending = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT record_id, state, attempts, updated_at FROM coordination \
                 WHERE state IN ('submitted', 'embedding_pending', 'metrics_pending') \
                 ORDER BY updated_at",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter_map(|(record_id, state, attempts, updated_at)| {
                    let state = state.parse::<CoordinationState>().ok()?;
                    Some(PendingRow {
                        record_id,
                        state,
                        attempts,
                        updated_at,
                    })
                })
                .collect::<Vec<_>>()
        };

        let now = Utc::now();
        let mut settled = 0;
        for row in pending {
            if !row.eligible(now, &self.config) {
                continue;
            }
            match self.drive_one(&row).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(err) => self.record_failure(&row, &err).await?,
            }
        }
        Ok(settled)
    }

    /// Spawn the background worker: wake on submit/update nudges or the
    /// poll interval, whichever comes first.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
            loop {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = self.drive_pending().await {
                    tracing::warn!(error = %err, "coordination pass failed");
                }
            }
        })
    }

    /// Drive one record as far toward `settled` as possible. Returns true
    /// when the record settled in this call.
    ///
    /// Every transition is guarded by the (state, updated_at) pair captured
    /// when the row was last read. A mutation that re-queues or deletes the
    /// row while an embedding call is in flight makes the guard miss, and
    /// the in-flight result is discarded: a vector computed from pre-update
    /// content is never stored over the re-queued row, and no vector is
    /// resurrected for a record deleted mid-flight.
    async fn drive_one(&self, row: &PendingRow) -> Result<bool> {
        let record_id = row.record_id.as_str();
        let mut token = row.updated_at.clone();

        if matches!(
            row.state,
            CoordinationState::Submitted | CoordinationState::EmbeddingPending
        ) {
            // Claim the row before the slow embedding call.
            let claim = now_rfc3339();
            let content = {
                let conn = self.conn.lock().await;
                let claimed = conn.execute(
                    "UPDATE coordination SET state = 'embedding_pending', updated_at = ?1 \
                     WHERE record_id = ?2 AND state = ?3 AND updated_at = ?4",
                    params![claim, record_id, row.state.as_str(), token],
                )? == 1;
                if !claimed {
                    // The row moved under us since the snapshot.
                    return Ok(false);
                }
                let found: Option<Option<String>> = conn
                    .query_row(
                        "SELECT content FROM records WHERE id = ?1 AND deleted_at IS NULL",
                        params![record_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                match found {
                    Some(content) => content,
                    None => {
                        // Record vanished under the queue entry; retract it.
                        conn.execute(
                            "DELETE FROM coordination WHERE record_id = ?1",
                            params![record_id],
                        )?;
                        return Ok(false);
                    }
                }
            };
            token = claim;

            // Embed without holding the connection lock.
            let vector = match content.filter(|c| !c.trim().is_empty()) {
                Some(text) => Some(self.embed(text).await?),
                None => None,
            };

            let advance = now_rfc3339();
            let conn = self.conn.lock().await;
            let advanced = conn.execute(
                "UPDATE coordination SET state = 'metrics_pending', updated_at = ?1 \
                 WHERE record_id = ?2 AND state = 'embedding_pending' AND updated_at = ?3",
                params![advance, record_id, token],
            )? == 1;
            if !advanced {
                // Content changed or the record was deleted while the
                // embedding was in flight; the computed vector is stale.
                return Ok(false);
            }
            match vector {
                Some(v) => search::upsert_embedding(&conn, record_id, &v)?,
                // Nothing to embed; make sure no stale vector survives.
                None => search::remove_embedding(&conn, record_id)?,
            }
            token = advance;
        }

        // Metrics settlement: recompute derived fields from the current raw
        // fields and mark the record settled.
        let conn = self.conn.lock().await;
        let record = match store::get_record(&conn, record_id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                conn.execute(
                    "DELETE FROM coordination WHERE record_id = ?1",
                    params![record_id],
                )?;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        let generated = metrics::recompute_generated(&record);
        let generated_json = serde_json::to_string(&generated).map_err(anyhow::Error::from)?;
        let settled = conn.execute(
            "UPDATE coordination SET state = 'settled', last_error = NULL, updated_at = ?1 \
             WHERE record_id = ?2 AND state = 'metrics_pending' AND updated_at = ?3",
            params![now_rfc3339(), record_id, token],
        )? == 1;
        if !settled {
            return Ok(false);
        }
        conn.execute(
            "UPDATE records SET generated = ?1 WHERE id = ?2",
            params![generated_json, record_id],
        )?;
        store::write_audit_log(&conn, "settle", record_id, None)?;
        tracing::debug!(id = %record_id, "record settled");
        Ok(true)
    }

    /// Run the blocking embedding call off the async runtime, bounded by
    /// the configured timeout.
    async fn embed(&self, text: String) -> Result<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let timeout = std::time::Duration::from_millis(self.config.embed_timeout_ms);
        let joined = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || embedder.embed(&text)),
        )
        .await
        .map_err(|_| {
            StoreError::Other(anyhow::anyhow!(
                "embedding timed out after {}ms",
                self.config.embed_timeout_ms
            ))
        })?;
        let vector = joined
            .map_err(|e| StoreError::Other(anyhow::anyhow!("embedding task panicked: {e}")))??;
        Ok(vector)
    }

    /// Bump the attempt counter; after the configured maximum the record is
    /// parked in `failed` until an explicit [`retry_failed`].
    ///
    /// Guarded like the forward transitions: a row that was re-queued to
    /// `submitted` (or deleted) while this attempt ran keeps its fresh
    /// counter instead of inheriting this attempt's failure.
    async fn record_failure(&self, row: &PendingRow, err: &StoreError) -> Result<()> {
        let conn = self.conn.lock().await;
        let attempts = row.attempts + 1;
        let message = err.to_string();
        if attempts >= self.config.max_attempts {
            let parked = conn.execute(
                "UPDATE coordination SET state = 'failed', attempts = ?1, last_error = ?2, \
                 updated_at = ?3 WHERE record_id = ?4 \
                 AND state IN ('embedding_pending', 'metrics_pending')",
                params![attempts, message, now_rfc3339(), row.record_id],
            )?;
            if parked == 1 {
                store::write_audit_log(&conn, "fail", &row.record_id, None)?;
                tracing::error!(
                    id = %row.record_id,
                    attempts,
                    error = %message,
                    "coordination retries exhausted"
                );
            }
        } else {
            conn.execute(
                "UPDATE coordination SET attempts = ?1, last_error = ?2, updated_at = ?3 \
                 WHERE record_id = ?4 \
                 AND state IN ('embedding_pending', 'metrics_pending')",
                params![attempts, message, now_rfc3339(), row.record_id],
            )?;
            tracing::warn!(
                id = %row.record_id,
                attempts,
                error = %message,
                "coordination attempt failed, will retry"
            );
        }
        Ok(())
    }
}
