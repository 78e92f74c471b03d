//! Personal analytics store — embedding-indexed records with derived metrics.
//!
//! lifelog persists heterogeneous life-tracking records (journal entries,
//! business activities, health metrics, productivity sessions, financial
//! transactions, goals) and answers two classes of query:
//!
//! - semantic "find records like this" search via vector similarity
//!   ([sqlite-vec](https://github.com/asg017/sqlite-vec) KNN with hard
//!   scalar post-filters), and
//! - derived-metrics aggregation — goal progress percentages, session
//!   durations, time-bucketed rollups, and cross-metric correlations.
//!
//! This crate is a library-level boundary: it receives already-validated
//! records and externally-computed embedding vectors, and exposes query and
//! aggregate results. HTTP routing, authentication, transcription, and
//! insight-text generation are collaborators, not part of the core.
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) with a vec0 virtual table for vector search.
//!   Records live in a single uniform table of common fields plus a JSON
//!   domain payload.
//! - **Embeddings**: supplied by an external [`embedding::EmbeddingSource`]
//!   (fixed dimensionality, 1536) — the core never computes vectors itself.
//! - **Coordination**: a record mutation, its embedding refresh, and the
//!   derived-metrics recompute are driven through a persisted per-record
//!   state machine with bounded-backoff retries.
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — SQLite database initialization, schema, and migrations
//! - [`embedding`] — The external embedding-generator boundary
//! - [`error`] — Typed store errors
//! - [`record`] — Core engine: store, search, metrics, goals, coordinator

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod record;
