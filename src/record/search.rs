//! Embedding Index — vector upsert/remove and filtered KNN search.
//!
//! Vectors live in the `records_vec` vec0 table, keyed by record id and
//! L2-normalized on write so L2 distance ranks candidates identically to
//! cosine distance. Search overfetches KNN candidates and applies scalar
//! filters (owner, domain, date range, tags, tombstones) as hard
//! post-conditions — recall may degrade, filters never do. The candidate
//! window widens progressively, so fewer than `k` results are returned only
//! when fewer matching candidates exist.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::embedding::EMBEDDING_DIM;
use crate::error::{Result, StoreError};
use crate::record::store;
use crate::record::types::{Domain, Record};
use crate::record::{embedding_to_bytes, normalize};

/// Initial KNN candidates fetched per requested result.
const OVERFETCH_FACTOR: usize = 4;

/// Scalar filters applied after the KNN fetch. All optional; tags match if
/// the record's tag set intersects the given set.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub owner: Option<String>,
    pub domains: Option<Vec<Domain>>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub tags: Vec<String>,
}

/// One search hit: the full record plus its cosine-equivalent distance.
#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub record: Record,
    pub distance: f64,
}

/// Non-fatal marker: results were served while writes were still settling.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StaleRead {
    /// Content-bearing live records whose coordination has not settled.
    pub pending: usize,
}

/// Response from a vector search.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// `Some` when the index snapshot may lag recent writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<StaleRead>,
}

/// Insert or replace the vector for a record id.
///
/// Fails with `DimensionMismatch` if the vector length ≠ [`EMBEDDING_DIM`].
/// The stored copy is L2-normalized.
pub fn upsert_embedding(conn: &Connection, record_id: &str, vector: &[f32]) -> Result<()> {
    check_dimensions(vector)?;
    let mut v = vector.to_vec();
    normalize(&mut v);

    // vec0 has no UPSERT; replace is delete + insert
    conn.execute("DELETE FROM records_vec WHERE id = ?1", params![record_id])?;
    conn.execute(
        "INSERT INTO records_vec (id, embedding) VALUES (?1, ?2)",
        params![record_id, embedding_to_bytes(&v)],
    )?;
    Ok(())
}

/// Remove a record's vector. No-op (not an error) if absent.
pub fn remove_embedding(conn: &Connection, record_id: &str) -> Result<()> {
    conn.execute("DELETE FROM records_vec WHERE id = ?1", params![record_id])?;
    Ok(())
}

/// K-nearest-neighbor search by cosine distance with hard scalar filters.
///
/// An empty index returns an empty result set, not an error. Ties on
/// distance break toward the more recent occurrence date, then id.
pub fn search(
    conn: &Connection,
    query_vector: &[f32],
    k: usize,
    filter: &SearchFilter,
) -> Result<SearchResponse> {
    check_dimensions(query_vector)?;
    let stale = stale_marker(conn)?;
    if k == 0 {
        return Ok(SearchResponse { hits: vec![], stale });
    }

    let total: i64 = conn.query_row("SELECT COUNT(*) FROM records_vec", [], |row| row.get(0))?;
    if total == 0 {
        return Ok(SearchResponse { hits: vec![], stale });
    }

    let mut q = query_vector.to_vec();
    normalize(&mut q);
    let query_bytes = embedding_to_bytes(&q);

    // Widen the candidate window until k survivors are found or the whole
    // index has been considered — filters are post-conditions, never
    // approximated away.
    let mut limit = (k * OVERFETCH_FACTOR).max(k);
    loop {
        let mut stmt = conn.prepare(
            "SELECT id, distance FROM records_vec \
             WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        )?;
        let candidates: Vec<(String, f64)> = stmt
            .query_map(params![query_bytes, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut survivors: Vec<(String, f64, String)> = Vec::new();
        for (id, distance) in &candidates {
            if let Some(occurred_on) = passes_filter(conn, id, filter)? {
                survivors.push((id.clone(), *distance, occurred_on));
            }
        }

        if survivors.len() >= k || candidates.len() as i64 >= total {
            // Distance ascending; ties toward more recent occurrence, then id.
            survivors.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.2.cmp(&a.2))
                    .then_with(|| a.0.cmp(&b.0))
            });
            survivors.truncate(k);

            let mut hits = Vec::with_capacity(survivors.len());
            for (id, distance, _) in survivors {
                let record = store::get_record(conn, &id)?;
                hits.push(SearchHit { record, distance });
            }
            return Ok(SearchResponse { hits, stale });
        }

        limit = (limit * 2).min(total as usize);
    }
}

/// Returns the record's occurrence date when every filter passes, `None`
/// when the candidate is rejected (tombstoned records always are).
fn passes_filter(
    conn: &Connection,
    record_id: &str,
    filter: &SearchFilter,
) -> Result<Option<String>> {
    let row: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT owner, domain, occurred_on, deleted_at FROM records WHERE id = ?1",
            params![record_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let Some((owner, domain, occurred_on, deleted_at)) = row else {
        // Vector without a record row — treat as retracted.
        return Ok(None);
    };
    if deleted_at.is_some() {
        return Ok(None);
    }
    if let Some(ref want) = filter.owner {
        if owner != *want {
            return Ok(None);
        }
    }
    if let Some(ref domains) = filter.domains {
        if !domains.iter().any(|d| d.as_str() == domain) {
            return Ok(None);
        }
    }
    if let Some(from) = filter.from {
        if occurred_on.as_str() < from.to_string().as_str() {
            return Ok(None);
        }
    }
    if let Some(to) = filter.to {
        if occurred_on.as_str() > to.to_string().as_str() {
            return Ok(None);
        }
    }
    if !filter.tags.is_empty() {
        let placeholders: Vec<String> =
            (2..=filter.tags.len() + 1).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM record_tags WHERE record_id = ?1 AND tag IN ({})",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut params_vec: Vec<&dyn rusqlite::types::ToSql> = vec![&record_id];
        for tag in &filter.tags {
            params_vec.push(tag);
        }
        let matches: i64 = stmt.query_row(params_vec.as_slice(), |row| row.get(0))?;
        if matches == 0 {
            return Ok(None);
        }
    }

    Ok(Some(occurred_on))
}

fn stale_marker(conn: &Connection) -> Result<Option<StaleRead>> {
    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM coordination c \
         JOIN records r ON r.id = c.record_id \
         WHERE c.state != 'settled' AND r.content IS NOT NULL AND r.deleted_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok((pending > 0).then_some(StaleRead {
        pending: pending as usize,
    }))
}

fn check_dimensions(vector: &[f32]) -> Result<()> {
    if vector.len() != EMBEDDING_DIM {
        return Err(StoreError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: vector.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::record::store::submit_record;
    use crate::record::types::{DomainPayload, Journal, NewRecord};
    use rusqlite::Connection;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    /// Unit vector with a spike at `seed`.
    fn spike(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[seed % EMBEDDING_DIM] = 1.0;
        v
    }

    fn settled_journal(
        conn: &mut Connection,
        content: &str,
        day: &str,
        tags: &[&str],
        emb: &[f32],
    ) -> String {
        let id = submit_record(
            conn,
            NewRecord {
                owner: "default".into(),
                occurred_on: day.parse().unwrap(),
                content: Some(content.into()),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                payload: DomainPayload::Journal(Journal::default()),
            },
        )
        .unwrap()
        .id;
        upsert_embedding(conn, &id, emb).unwrap();
        conn.execute(
            "UPDATE coordination SET state = 'settled' WHERE record_id = ?1",
            params![id],
        )
        .unwrap();
        id
    }

    #[test]
    fn upsert_rejects_wrong_dimension() {
        let conn = test_db();
        let err = upsert_embedding(&conn, "some-id", &[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: EMBEDDING_DIM, actual: 2 }
        ));
    }

    #[test]
    fn remove_absent_is_noop() {
        let conn = test_db();
        remove_embedding(&conn, "never-existed").unwrap();
    }

    #[test]
    fn empty_index_returns_empty() {
        let conn = test_db();
        let response = search(&conn, &spike(0), 5, &SearchFilter::default()).unwrap();
        assert!(response.hits.is_empty());
    }

    #[test]
    fn returns_nearest_first() {
        let mut conn = test_db();
        let near = settled_journal(&mut conn, "workout felt great", "2026-03-01", &[], &spike(0));
        let _far = settled_journal(&mut conn, "tax paperwork", "2026-03-02", &[], &spike(500));

        let response = search(&conn, &spike(0), 2, &SearchFilter::default()).unwrap();
        assert_eq!(response.hits.len(), 2);
        assert_eq!(response.hits[0].record.id, near);
        assert!(response.hits[0].distance < response.hits[1].distance);
    }

    #[test]
    fn k_larger_than_candidates_returns_all() {
        let mut conn = test_db();
        settled_journal(&mut conn, "one", "2026-03-01", &[], &spike(0));
        settled_journal(&mut conn, "two", "2026-03-02", &[], &spike(1));

        let response = search(&conn, &spike(0), 5, &SearchFilter::default()).unwrap();
        assert_eq!(response.hits.len(), 2);
    }

    #[test]
    fn domain_filter_is_hard() {
        let mut conn = test_db();
        settled_journal(&mut conn, "journal entry", "2026-03-01", &[], &spike(0));

        let response = search(
            &conn,
            &spike(0),
            5,
            &SearchFilter {
                domains: Some(vec![Domain::Goal]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(response.hits.is_empty());
    }

    #[test]
    fn date_and_tag_filters() {
        let mut conn = test_db();
        let in_range = settled_journal(
            &mut conn,
            "tagged and in range",
            "2026-03-10",
            &["fitness"],
            &spike(0),
        );
        settled_journal(&mut conn, "too old", "2025-01-01", &["fitness"], &spike(1));
        settled_journal(&mut conn, "wrong tag", "2026-03-11", &["money"], &spike(2));

        let response = search(
            &conn,
            &spike(0),
            10,
            &SearchFilter {
                from: Some("2026-03-01".parse().unwrap()),
                to: Some("2026-03-31".parse().unwrap()),
                tags: vec!["fitness".into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].record.id, in_range);
    }

    #[test]
    fn widening_finds_filtered_matches_past_overfetch() {
        let mut conn = test_db();
        // Many near neighbors of the query that the filter rejects...
        for i in 0..20 {
            settled_journal(&mut conn, "noise", "2026-03-01", &[], &spike(i));
        }
        // ...and one matching record far from the query.
        let wanted = settled_journal(
            &mut conn,
            "needle",
            "2026-03-02",
            &["needle"],
            &spike(1000),
        );

        let response = search(
            &conn,
            &spike(0),
            1,
            &SearchFilter {
                tags: vec!["needle".into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].record.id, wanted);
    }

    #[test]
    fn tombstoned_record_never_returned() {
        let mut conn = test_db();
        let id = settled_journal(&mut conn, "doomed", "2026-03-01", &[], &spike(0));
        crate::record::store::delete_record(&mut conn, &id).unwrap();

        let response = search(&conn, &spike(0), 5, &SearchFilter::default()).unwrap();
        assert!(response.hits.iter().all(|h| h.record.id != id));
    }

    #[test]
    fn distance_tie_breaks_toward_recent() {
        let mut conn = test_db();
        // Same embedding, different occurrence dates
        let older = settled_journal(&mut conn, "same text", "2026-03-01", &[], &spike(0));
        let newer = settled_journal(&mut conn, "same text", "2026-03-05", &[], &spike(0));

        let response = search(&conn, &spike(0), 2, &SearchFilter::default()).unwrap();
        assert_eq!(response.hits[0].record.id, newer);
        assert_eq!(response.hits[1].record.id, older);
    }

    #[test]
    fn stale_marker_reflects_pending_coordination() {
        let mut conn = test_db();
        // Settled record: no stale marker
        settled_journal(&mut conn, "settled", "2026-03-01", &[], &spike(0));
        let response = search(&conn, &spike(0), 5, &SearchFilter::default()).unwrap();
        assert!(response.stale.is_none());

        // A fresh submit with content leaves coordination pending
        submit_record(
            &mut conn,
            NewRecord {
                owner: "default".into(),
                occurred_on: "2026-03-02".parse().unwrap(),
                content: Some("not yet embedded".into()),
                tags: vec![],
                payload: DomainPayload::Journal(Journal::default()),
            },
        )
        .unwrap();

        let response = search(&conn, &spike(0), 5, &SearchFilter::default()).unwrap();
        let stale = response.stale.expect("stale marker expected");
        assert_eq!(stale.pending, 1);
    }
}
