//! Derived-Metrics Engine — generated fields, rollups, and correlations.
//!
//! Generated fields (goal progress percentage, session duration) are pure
//! functions of a record's raw fields: recomputing twice from the same
//! inputs yields the same outputs, which makes replay after a partial
//! coordination failure safe. Rollups bucket raw records into daily, weekly
//! (ISO, Monday start), or monthly aggregates; empty buckets are omitted
//! unless the caller asks for zero filling.

use chrono::{Datelike, Duration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::record::store::{self, RecordQuery};
use crate::record::types::{Domain, DomainPayload, Generated, ProductivitySession, Record};

// ── Generated fields ──────────────────────────────────────────────────────────

/// Recompute a record's generated fields from its raw fields. Pure and
/// idempotent; never reads stored intermediate state.
pub fn recompute_generated(record: &Record) -> Generated {
    recompute_generated_payload(&record.payload)
}

/// Payload-level recomputation used by both the store write path and the
/// coordinator's metrics step.
pub(crate) fn recompute_generated_payload(payload: &DomainPayload) -> Generated {
    match payload {
        DomainPayload::Goal(g) => Generated {
            progress_percentage: Some(progress_percentage(g.current_value, g.target_value)),
            duration_minutes: None,
        },
        DomainPayload::ProductivitySession(s) => Generated {
            progress_percentage: None,
            duration_minutes: s
                .ended_at
                .map(|end| (end - s.started_at).num_minutes()),
        },
        _ => Generated::default(),
    }
}

/// `100 * current / target` for a positive target, `0.0` otherwise.
/// Deliberately unclamped above 100 — whether over-achievement should cap
/// at 100% is a product decision, not a technical one.
pub fn progress_percentage(current_value: f64, target_value: f64) -> f64 {
    if target_value > 0.0 {
        100.0 * current_value / target_value
    } else {
        0.0
    }
}

/// Overlap in whole minutes between two session time blocks. Open sessions
/// (no end) contribute no overlap.
pub fn session_overlap_minutes(a: &ProductivitySession, b: &ProductivitySession) -> i64 {
    let (Some(a_end), Some(b_end)) = (a.ended_at, b.ended_at) else {
        return 0;
    };
    let start = a.started_at.max(b.started_at);
    let end = a_end.min(b_end);
    (end - start).num_minutes().max(0)
}

// ── Goal progress ─────────────────────────────────────────────────────────────

/// Aggregated progress for one goal.
#[derive(Debug, Serialize)]
pub struct GoalProgress {
    pub goal_id: String,
    pub target_value: f64,
    /// Base current_value plus contributing financial transactions.
    pub current_value: f64,
    pub progress_percentage: f64,
    pub contribution_count: usize,
}

/// Compute a goal's progress from a consistent snapshot of its contributing
/// records. Contributions are summed in (occurrence date, id) order — a
/// stable total order — so out-of-order arrival cannot change the result.
pub fn goal_progress(conn: &Connection, goal_id: &str) -> Result<GoalProgress> {
    let record = store::get_record(conn, goal_id)?;
    let goal = match record.payload {
        DomainPayload::Goal(g) => g,
        other => {
            return Err(StoreError::validation(
                "goal_id",
                format!("record is {}, not a goal", other.domain()),
            ))
        }
    };

    // Snapshot read: one ordered query, no shared mutable counter. Scoped
    // to the goal's owner so another owner's transactions cannot reference
    // this goal into motion.
    let transactions = store::query_records(
        conn,
        &RecordQuery {
            owner: Some(record.owner.clone()),
            domain: Some(Domain::FinancialTransaction),
            ..Default::default()
        },
    )?;
    let mut contributions: Vec<(NaiveDate, String, f64)> = transactions
        .into_iter()
        .filter_map(|r| match r.payload {
            DomainPayload::FinancialTransaction(ref t)
                if t.goal_id.as_deref() == Some(goal_id) =>
            {
                Some((r.occurred_on, r.id.clone(), t.amount_gbp))
            }
            _ => None,
        })
        .collect();
    contributions.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let contribution_count = contributions.len();
    let current_value = contributions
        .iter()
        .fold(goal.current_value, |acc, (_, _, amount)| acc + amount);

    Ok(GoalProgress {
        goal_id: goal_id.to_string(),
        target_value: goal.target_value,
        progress_percentage: progress_percentage(current_value, goal.target_value),
        current_value,
        contribution_count,
    })
}

// ── Rollups ───────────────────────────────────────────────────────────────────

/// Time-bucket granularity for rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
    /// ISO weeks, Monday start.
    Weekly,
    Monthly,
}

impl Granularity {
    /// Start of the bucket containing `date`.
    pub fn bucket_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => date,
            Self::Weekly => date - Duration::days(date.weekday().num_days_from_monday() as i64),
            Self::Monthly => date.with_day(1).expect("day 1 always valid"),
        }
    }

    fn next_bucket(&self, bucket: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => bucket + Duration::days(1),
            Self::Weekly => bucket + Duration::days(7),
            Self::Monthly => {
                let (year, month) = if bucket.month() == 12 {
                    (bucket.year() + 1, 1)
                } else {
                    (bucket.year(), bucket.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1).expect("first of month always valid")
            }
        }
    }
}

/// How a metric's per-bucket values combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Average,
}

/// Metrics that can be rolled up. Each metric implies its source domain, so
/// a mismatched domain filter is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    MoodScore,
    EnergyLevel,
    ProductivityRating,
    SleepHours,
    ExerciseMinutes,
    SessionMinutes,
    ValueRating,
    OutcomeRating,
    AmountGbp,
}

impl Metric {
    pub fn domain(&self) -> Domain {
        match self {
            Self::MoodScore | Self::EnergyLevel | Self::ProductivityRating => Domain::Journal,
            Self::SleepHours | Self::ExerciseMinutes => Domain::HealthMetric,
            Self::SessionMinutes | Self::ValueRating => Domain::ProductivitySession,
            Self::OutcomeRating => Domain::BusinessActivity,
            Self::AmountGbp => Domain::FinancialTransaction,
        }
    }

    fn aggregate(&self) -> Aggregate {
        match self {
            Self::ExerciseMinutes | Self::SessionMinutes | Self::AmountGbp => Aggregate::Sum,
            _ => Aggregate::Average,
        }
    }

    /// Extract this metric's value from a record, if present.
    fn extract(&self, record: &Record) -> Option<f64> {
        match (self, &record.payload) {
            (Self::MoodScore, DomainPayload::Journal(j)) => j.mood_score.map(f64::from),
            (Self::EnergyLevel, DomainPayload::Journal(j)) => j.energy_level.map(f64::from),
            (Self::ProductivityRating, DomainPayload::Journal(j)) => {
                j.productivity_rating.map(f64::from)
            }
            (Self::SleepHours, DomainPayload::HealthMetric(h)) => h.sleep_hours,
            (Self::ExerciseMinutes, DomainPayload::HealthMetric(h)) => {
                h.exercise_minutes.map(f64::from)
            }
            (Self::SessionMinutes, payload @ DomainPayload::ProductivitySession(_)) => {
                recompute_generated_payload(payload)
                    .duration_minutes
                    .map(|m| m as f64)
            }
            (Self::ValueRating, DomainPayload::ProductivitySession(s)) => {
                s.value_rating.map(f64::from)
            }
            (Self::OutcomeRating, DomainPayload::BusinessActivity(a)) => {
                a.outcome_rating.map(f64::from)
            }
            (Self::AmountGbp, DomainPayload::FinancialTransaction(t)) => Some(t.amount_gbp),
            _ => None,
        }
    }
}

/// Request for a time-bucketed rollup over one metric.
#[derive(Debug, Clone)]
pub struct RollupRequest {
    pub owner: Option<String>,
    pub metric: Metric,
    pub granularity: Granularity,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// When true, buckets with no contributing records are emitted with
    /// value 0. Default policy is to omit them.
    pub zero_fill: bool,
}

/// One rollup bucket: its start date and the aggregated value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupBucket {
    pub bucket_start: NaiveDate,
    pub value: f64,
    /// Records that contributed a value to this bucket.
    pub count: usize,
}

/// Compute an ordered sequence of (bucket_start, aggregate) pairs for the
/// requested metric over the time range.
pub fn rollup(conn: &Connection, request: &RollupRequest) -> Result<Vec<RollupBucket>> {
    let records = store::query_records(
        conn,
        &RecordQuery {
            owner: request.owner.clone(),
            domain: Some(request.metric.domain()),
            from: Some(request.from),
            to: Some(request.to),
            ..Default::default()
        },
    )?;

    let mut buckets: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for record in &records {
        if let Some(value) = request.metric.extract(record) {
            let start = request.granularity.bucket_start(record.occurred_on);
            let entry = buckets.entry(start).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    let aggregate = request.metric.aggregate();
    let finish = |sum: f64, count: usize| match aggregate {
        Aggregate::Sum => sum,
        Aggregate::Average => sum / count as f64,
    };

    if request.zero_fill {
        let mut out = Vec::new();
        let mut bucket = request.granularity.bucket_start(request.from);
        while bucket <= request.to {
            let (value, count) = match buckets.get(&bucket) {
                Some(&(sum, count)) => (finish(sum, count), count),
                None => (0.0, 0),
            };
            out.push(RollupBucket {
                bucket_start: bucket,
                value,
                count,
            });
            bucket = request.granularity.next_bucket(bucket);
        }
        Ok(out)
    } else {
        Ok(buckets
            .into_iter()
            .map(|(bucket_start, (sum, count))| RollupBucket {
                bucket_start,
                value: finish(sum, count),
                count,
            })
            .collect())
    }
}

// ── Correlation ───────────────────────────────────────────────────────────────

/// Request for a cross-metric correlation over shared daily buckets.
#[derive(Debug, Clone)]
pub struct CorrelateRequest {
    pub owner: Option<String>,
    pub metric_a: Metric,
    pub metric_b: Metric,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Pearson correlation of two metrics over days where both have a value.
/// Returns `None` with fewer than two shared days or zero variance.
pub fn correlate(conn: &Connection, request: &CorrelateRequest) -> Result<Option<f64>> {
    let daily = |metric: Metric| -> Result<BTreeMap<NaiveDate, f64>> {
        let buckets = rollup(
            conn,
            &RollupRequest {
                owner: request.owner.clone(),
                metric,
                granularity: Granularity::Daily,
                from: request.from,
                to: request.to,
                zero_fill: false,
            },
        )?;
        Ok(buckets
            .into_iter()
            .map(|b| (b.bucket_start, b.value))
            .collect())
    };

    let a = daily(request.metric_a)?;
    let b = daily(request.metric_b)?;
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .filter_map(|(date, &va)| b.get(date).map(|&vb| (va, vb)))
        .collect();

    Ok(pearson(&pairs))
}

fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    let n = pairs.len() as f64;
    if pairs.len() < 2 {
        return None;
    }
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (a, b) in pairs {
        let da = a - mean_a;
        let db = b - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::record::store::submit_record;
    use crate::record::types::{
        FinancialTransaction, Goal, HealthMetric, Journal, NewRecord, TransactionType,
    };
    use chrono::{TimeZone, Utc};

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn session(start_h: u32, end_h: Option<u32>) -> ProductivitySession {
        ProductivitySession {
            focus_area: "deep work".into(),
            started_at: Utc.with_ymd_and_hms(2026, 3, 1, start_h, 0, 0).unwrap(),
            ended_at: end_h.map(|h| Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()),
            energy_start: None,
            energy_end: None,
            value_rating: None,
        }
    }

    #[test]
    fn recompute_is_idempotent() {
        let payload = DomainPayload::Goal(Goal {
            title: "g".into(),
            target_value: 200.0,
            current_value: 50.0,
            target_date: None,
            parent_goal: None,
        });
        let first = recompute_generated_payload(&payload);
        let second = recompute_generated_payload(&payload);
        assert_eq!(first, second);
        assert_eq!(first.progress_percentage, Some(25.0));
    }

    #[test]
    fn progress_formula_edge_cases() {
        assert!((progress_percentage(250_000.0, 1_000_000.0) - 25.0).abs() < 1e-9);
        // target <= 0 always yields 0
        assert_eq!(progress_percentage(50.0, 0.0), 0.0);
        assert_eq!(progress_percentage(50.0, -10.0), 0.0);
        // unclamped above 100
        assert!((progress_percentage(150.0, 100.0) - 150.0).abs() < 1e-9);
    }

    #[test]
    fn open_session_has_no_duration() {
        let generated =
            recompute_generated_payload(&DomainPayload::ProductivitySession(session(9, None)));
        assert_eq!(generated.duration_minutes, None);

        let generated =
            recompute_generated_payload(&DomainPayload::ProductivitySession(session(9, Some(11))));
        assert_eq!(generated.duration_minutes, Some(120));
    }

    #[test]
    fn overlap_of_time_blocks() {
        let a = session(9, Some(12));
        let b = session(11, Some(14));
        assert_eq!(session_overlap_minutes(&a, &b), 60);
        assert_eq!(session_overlap_minutes(&b, &a), 60);

        let disjoint = session(15, Some(16));
        assert_eq!(session_overlap_minutes(&a, &disjoint), 0);

        let open = session(10, None);
        assert_eq!(session_overlap_minutes(&a, &open), 0);
    }

    fn submit_goal(conn: &mut Connection, target: f64, current: f64) -> String {
        submit_record(
            conn,
            NewRecord {
                owner: "default".into(),
                occurred_on: "2026-01-01".parse().unwrap(),
                content: None,
                tags: vec![],
                payload: DomainPayload::Goal(Goal {
                    title: "wealth".into(),
                    target_value: target,
                    current_value: current,
                    target_date: None,
                    parent_goal: None,
                }),
            },
        )
        .unwrap()
        .id
    }

    fn submit_contribution(conn: &mut Connection, goal_id: &str, amount: f64, day: &str) {
        submit_record(
            conn,
            NewRecord {
                owner: "default".into(),
                occurred_on: day.parse().unwrap(),
                content: None,
                tags: vec![],
                payload: DomainPayload::FinancialTransaction(FinancialTransaction {
                    amount_gbp: amount,
                    transaction_type: TransactionType::Investment,
                    goal_id: Some(goal_id.to_string()),
                }),
            },
        )
        .unwrap();
    }

    #[test]
    fn goal_progress_with_contribution() {
        let mut conn = test_db();
        let goal_id = submit_goal(&mut conn, 1_000_000.0, 250_000.0);

        let progress = goal_progress(&conn, &goal_id).unwrap();
        assert!((progress.progress_percentage - 25.0).abs() < 1e-9);

        submit_contribution(&mut conn, &goal_id, 50_000.0, "2026-02-01");
        let progress = goal_progress(&conn, &goal_id).unwrap();
        assert_eq!(progress.current_value, 300_000.0);
        assert!((progress.progress_percentage - 30.0).abs() < 1e-9);
        assert_eq!(progress.contribution_count, 1);
    }

    #[test]
    fn contributions_commute_over_insertion_order() {
        let amounts = [125.0, -40.0, 3_000.5, 77.25, 999.0];

        // Forward insertion order
        let mut conn_a = test_db();
        let goal_a = submit_goal(&mut conn_a, 10_000.0, 0.0);
        for (i, amount) in amounts.iter().enumerate() {
            submit_contribution(&mut conn_a, &goal_a, *amount, &format!("2026-02-{:02}", i + 1));
        }

        // Reverse insertion order, same occurrence dates
        let mut conn_b = test_db();
        let goal_b = submit_goal(&mut conn_b, 10_000.0, 0.0);
        for (i, amount) in amounts.iter().enumerate().rev() {
            submit_contribution(&mut conn_b, &goal_b, *amount, &format!("2026-02-{:02}", i + 1));
        }

        let a = goal_progress(&conn_a, &goal_a).unwrap();
        let b = goal_progress(&conn_b, &goal_b).unwrap();
        assert_eq!(a.current_value, b.current_value);
        assert!((a.progress_percentage - b.progress_percentage).abs() < 1e-9);
    }

    #[test]
    fn goal_progress_on_non_goal_rejected() {
        let mut conn = test_db();
        let id = submit_record(
            &mut conn,
            NewRecord {
                owner: "default".into(),
                occurred_on: "2026-01-01".parse().unwrap(),
                content: Some("entry".into()),
                tags: vec![],
                payload: DomainPayload::Journal(Journal::default()),
            },
        )
        .unwrap()
        .id;
        assert!(matches!(
            goal_progress(&conn, &id).unwrap_err(),
            StoreError::Validation { .. }
        ));
    }

    fn submit_health(conn: &mut Connection, day: &str, sleep: f64, exercise: u32) {
        submit_record(
            conn,
            NewRecord {
                owner: "default".into(),
                occurred_on: day.parse().unwrap(),
                content: None,
                tags: vec![],
                payload: DomainPayload::HealthMetric(HealthMetric {
                    sleep_hours: Some(sleep),
                    exercise_minutes: Some(exercise),
                    resting_heart_rate: None,
                }),
            },
        )
        .unwrap();
    }

    #[test]
    fn daily_rollup_averages_and_omits_empty_buckets() {
        let mut conn = test_db();
        submit_health(&mut conn, "2026-03-02", 8.0, 30);
        submit_health(&mut conn, "2026-03-02", 6.0, 20);
        submit_health(&mut conn, "2026-03-05", 7.0, 45);

        let buckets = rollup(
            &conn,
            &RollupRequest {
                owner: None,
                metric: Metric::SleepHours,
                granularity: Granularity::Daily,
                from: "2026-03-01".parse().unwrap(),
                to: "2026-03-07".parse().unwrap(),
                zero_fill: false,
            },
        )
        .unwrap();

        // Only the two days with data, averaged
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, "2026-03-02".parse::<NaiveDate>().unwrap());
        assert!((buckets[0].value - 7.0).abs() < 1e-9);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].bucket_start, "2026-03-05".parse::<NaiveDate>().unwrap());
    }

    #[test]
    fn zero_fill_emits_every_bucket() {
        let mut conn = test_db();
        submit_health(&mut conn, "2026-03-02", 8.0, 30);

        let buckets = rollup(
            &conn,
            &RollupRequest {
                owner: None,
                metric: Metric::ExerciseMinutes,
                granularity: Granularity::Daily,
                from: "2026-03-01".parse().unwrap(),
                to: "2026-03-03".parse().unwrap(),
                zero_fill: true,
            },
        )
        .unwrap();

        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].value, 0.0);
        assert_eq!(buckets[1].value, 30.0);
        assert_eq!(buckets[2].value, 0.0);
    }

    #[test]
    fn weekly_buckets_start_on_monday() {
        // 2026-03-04 is a Wednesday; its week starts 2026-03-02
        let start = Granularity::Weekly.bucket_start("2026-03-04".parse().unwrap());
        assert_eq!(start, "2026-03-02".parse::<NaiveDate>().unwrap());

        let mut conn = test_db();
        submit_health(&mut conn, "2026-03-03", 8.0, 30);
        submit_health(&mut conn, "2026-03-04", 8.0, 60);
        submit_health(&mut conn, "2026-03-10", 8.0, 45);

        let buckets = rollup(
            &conn,
            &RollupRequest {
                owner: None,
                metric: Metric::ExerciseMinutes,
                granularity: Granularity::Weekly,
                from: "2026-03-01".parse().unwrap(),
                to: "2026-03-14".parse().unwrap(),
                zero_fill: false,
            },
        )
        .unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].value, 90.0); // summed within the week
        assert_eq!(buckets[1].value, 45.0);
    }

    #[test]
    fn monthly_bucket_rollover() {
        assert_eq!(
            Granularity::Monthly.next_bucket("2026-12-01".parse().unwrap()),
            "2027-01-01".parse::<NaiveDate>().unwrap()
        );
    }

    #[test]
    fn correlation_of_aligned_metrics() {
        let mut conn = test_db();
        // sleep and exercise move together across five days
        for (i, (sleep, exercise)) in
            [(5.0, 10u32), (6.0, 20), (7.0, 30), (8.0, 40), (9.0, 50)].iter().enumerate()
        {
            submit_health(&mut conn, &format!("2026-03-{:02}", i + 1), *sleep, *exercise);
        }

        let r = correlate(
            &conn,
            &CorrelateRequest {
                owner: None,
                metric_a: Metric::SleepHours,
                metric_b: Metric::ExerciseMinutes,
                from: "2026-03-01".parse().unwrap(),
                to: "2026-03-31".parse().unwrap(),
            },
        )
        .unwrap()
        .expect("correlation defined");
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn correlation_undefined_without_shared_days() {
        let conn = test_db();
        let r = correlate(
            &conn,
            &CorrelateRequest {
                owner: None,
                metric_a: Metric::SleepHours,
                metric_b: Metric::MoodScore,
                from: "2026-03-01".parse().unwrap(),
                to: "2026-03-31".parse().unwrap(),
            },
        )
        .unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn pearson_zero_variance_is_none() {
        assert_eq!(pearson(&[(1.0, 2.0), (1.0, 3.0)]), None);
        assert_eq!(pearson(&[(1.0, 2.0)]), None);
    }
}
