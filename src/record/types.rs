//! Core record type definitions.
//!
//! Defines [`Domain`] (the six life-tracking domains), [`DomainPayload`]
//! (per-domain scalar fields with validation), [`Record`] (common fields +
//! payload), and [`Generated`] (derived fields cached on the record).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// The six record domains, one per life-tracking area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Free-text journal entries with mood/energy/productivity ratings.
    Journal,
    /// Meetings, decisions, and strategic initiatives.
    BusinessActivity,
    /// Sleep, exercise, and vital measurements.
    HealthMetric,
    /// Timed deep-work sessions with start/end instants.
    ProductivitySession,
    /// Money movements, optionally contributing to a goal.
    FinancialTransaction,
    /// Targets with current progress and an optional parent goal.
    Goal,
}

impl Domain {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Journal => "journal",
            Self::BusinessActivity => "business_activity",
            Self::HealthMetric => "health_metric",
            Self::ProductivitySession => "productivity_session",
            Self::FinancialTransaction => "financial_transaction",
            Self::Goal => "goal",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "journal" => Ok(Self::Journal),
            "business_activity" => Ok(Self::BusinessActivity),
            "health_metric" => Ok(Self::HealthMetric),
            "productivity_session" => Ok(Self::ProductivitySession),
            "financial_transaction" => Ok(Self::FinancialTransaction),
            "goal" => Ok(Self::Goal),
            _ => Err(format!("unknown domain: {s}")),
        }
    }
}

/// Business activity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Meeting,
    Decision,
    Transaction,
    Strategy,
    Networking,
}

/// Financial transaction category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Income,
    Expense,
    Investment,
    AssetValuation,
    Liability,
}

/// Journal entry ratings. All ratings are on a 1–10 scale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Journal {
    pub mood_score: Option<u8>,
    pub energy_level: Option<u8>,
    pub productivity_rating: Option<u8>,
    /// Derived from content at submit time; zero when content is absent.
    #[serde(default)]
    pub word_count: u32,
}

/// A business activity: meeting, decision, transaction, strategy, networking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessActivity {
    pub activity_type: ActivityType,
    pub duration_minutes: Option<u32>,
    pub outcome_rating: Option<u8>,
    pub financial_impact_gbp: Option<f64>,
}

/// A day's health measurements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetric {
    pub sleep_hours: Option<f64>,
    pub exercise_minutes: Option<u32>,
    pub resting_heart_rate: Option<u16>,
}

/// A timed productivity session. Duration is derived (`ended_at − started_at`)
/// and undefined while the session is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductivitySession {
    pub focus_area: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub energy_start: Option<u8>,
    pub energy_end: Option<u8>,
    pub value_rating: Option<u8>,
}

/// A money movement. `goal_id` marks the transaction as a contribution to
/// that goal's current value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialTransaction {
    pub amount_gbp: f64,
    pub transaction_type: TransactionType,
    pub goal_id: Option<String>,
}

/// A goal with a numeric target. `parent_goal` forms a tree; cycles are
/// rejected at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub title: String,
    pub target_value: f64,
    #[serde(default)]
    pub current_value: f64,
    pub target_date: Option<NaiveDate>,
    pub parent_goal: Option<String>,
}

/// Domain-specific payload, one variant per [`Domain`]. Common fields live
/// on [`Record`]; this is composition, not a class hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainPayload {
    Journal(Journal),
    BusinessActivity(BusinessActivity),
    HealthMetric(HealthMetric),
    ProductivitySession(ProductivitySession),
    FinancialTransaction(FinancialTransaction),
    Goal(Goal),
}

impl DomainPayload {
    pub fn domain(&self) -> Domain {
        match self {
            Self::Journal(_) => Domain::Journal,
            Self::BusinessActivity(_) => Domain::BusinessActivity,
            Self::HealthMetric(_) => Domain::HealthMetric,
            Self::ProductivitySession(_) => Domain::ProductivitySession,
            Self::FinancialTransaction(_) => Domain::FinancialTransaction,
            Self::Goal(_) => Domain::Goal,
        }
    }

    /// Validate per-domain field constraints. Called before anything is
    /// persisted; a failure here means the write is rejected outright.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Journal(j) => {
                check_rating("mood_score", j.mood_score)?;
                check_rating("energy_level", j.energy_level)?;
                check_rating("productivity_rating", j.productivity_rating)?;
            }
            Self::BusinessActivity(a) => {
                check_rating("outcome_rating", a.outcome_rating)?;
            }
            Self::HealthMetric(h) => {
                if let Some(hours) = h.sleep_hours {
                    if !(0.0..=24.0).contains(&hours) {
                        return Err(StoreError::validation(
                            "sleep_hours",
                            format!("must be within 0–24, got {hours}"),
                        ));
                    }
                }
                if let Some(bpm) = h.resting_heart_rate {
                    if !(20..=250).contains(&bpm) {
                        return Err(StoreError::validation(
                            "resting_heart_rate",
                            format!("must be within 20–250, got {bpm}"),
                        ));
                    }
                }
            }
            Self::ProductivitySession(s) => {
                check_rating("energy_start", s.energy_start)?;
                check_rating("energy_end", s.energy_end)?;
                check_rating("value_rating", s.value_rating)?;
                if let Some(end) = s.ended_at {
                    if end < s.started_at {
                        return Err(StoreError::validation(
                            "ended_at",
                            "session end precedes start",
                        ));
                    }
                }
            }
            Self::FinancialTransaction(t) => {
                if !t.amount_gbp.is_finite() {
                    return Err(StoreError::validation(
                        "amount_gbp",
                        "must be a finite number",
                    ));
                }
            }
            Self::Goal(g) => {
                if g.title.trim().is_empty() {
                    return Err(StoreError::validation("title", "must not be empty"));
                }
                if !g.target_value.is_finite() || !g.current_value.is_finite() {
                    return Err(StoreError::validation(
                        "target_value",
                        "goal values must be finite",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_rating(field: &'static str, value: Option<u8>) -> Result<()> {
    if let Some(v) = value {
        if !(1..=10).contains(&v) {
            return Err(StoreError::validation(
                field,
                format!("must be within 1–10, got {v}"),
            ));
        }
    }
    Ok(())
}

/// Derived fields, recomputed from raw fields by the metrics engine and
/// cached on the record. Always reproducible; never edited directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generated {
    /// `100 * current_value / target_value` for goals with a positive
    /// target; `0.0` otherwise. Deliberately unclamped above 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percentage: Option<f64>,

    /// Whole minutes between session start and end; `None` while open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

/// A full record: common fields plus the domain payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// UUID v7 (time-sortable) primary key. Immutable, never reused.
    pub id: String,
    /// Owner reference. Single-user deployments use one fixed owner.
    pub owner: String,
    /// Date the recorded event occurred (not when it was entered).
    pub occurred_on: NaiveDate,
    /// Free-text content; drives the embedding when present.
    pub content: Option<String>,
    /// String tags, stored in a side table for scalar filtering.
    pub tags: Vec<String>,
    /// Domain payload.
    pub payload: DomainPayload,
    /// Cached derived fields; see [`Generated`].
    pub generated: Generated,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 last-modification timestamp, monotonically non-decreasing.
    pub updated_at: String,
    /// Tombstone instant; `Some` means deleted.
    pub deleted_at: Option<String>,
}

impl Record {
    pub fn domain(&self) -> Domain {
        self.payload.domain()
    }
}

/// Input to `submit_record`: everything but identity, timestamps, and
/// generated fields, which the store assigns.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub owner: String,
    pub occurred_on: NaiveDate,
    pub content: Option<String>,
    pub tags: Vec<String>,
    pub payload: DomainPayload,
}

/// Partial update applied through `update_record`. `None` leaves the field
/// untouched; replacing content re-queues embedding coordination.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub occurred_on: Option<NaiveDate>,
    pub content: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub payload: Option<DomainPayload>,
}
