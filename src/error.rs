//! Typed errors for store, index, and coordination operations.

use thiserror::Error;

/// Errors surfaced by the record store, embedding index, and metrics engine.
///
/// Validation and not-found errors are synchronous and handled by the
/// immediate caller. Coordination failures are asynchronous: the write
/// itself succeeds, and [`RetryExhausted`](StoreError::RetryExhausted) is
/// reported through a status query on the record, never thrown at write
/// time.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A constrained field was out of range or referenced something invalid.
    /// Rejected before anything is persisted.
    #[error("validation failed for {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The operation referenced an unknown (or tombstoned) record identity.
    #[error("record not found: {0}")]
    NotFound(String),

    /// An embedding vector had the wrong number of components.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The coordinator gave up after bounded attempts. The record persists
    /// but lacks a settled embedding; remediation is external.
    #[error("coordination retries exhausted for record {record_id} after {attempts} attempts: {reason}")]
    RetryExhausted {
        record_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
