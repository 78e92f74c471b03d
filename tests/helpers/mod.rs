#![allow(dead_code)]

use chrono::NaiveDate;
use lifelog::db;
use lifelog::embedding::{EmbeddingSource, EMBEDDING_DIM};
use lifelog::record::store::{submit_record, SubmitResult};
use lifelog::record::types::{DomainPayload, Journal, NewRecord};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database().unwrap()
}

/// Deterministic embedding with a spike at position `seed`. Distinct seeds
/// produce orthogonal vectors.
pub fn test_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed % EMBEDDING_DIM] = 1.0;
    v
}

/// An embedding close to `base`: small noise in a few dimensions, so the
/// result stays the nearest neighbour of `base` after normalization.
pub fn similar_embedding(base: &[f32]) -> Vec<f32> {
    let mut v = base.to_vec();
    for (i, x) in v.iter_mut().enumerate().take(5) {
        *x += 0.01 * (i as f32 + 1.0);
    }
    v
}

pub fn journal(content: &str, day: &str) -> NewRecord {
    NewRecord {
        owner: "default".into(),
        occurred_on: day.parse::<NaiveDate>().unwrap(),
        content: Some(content.into()),
        tags: vec![],
        payload: DomainPayload::Journal(Journal {
            mood_score: Some(7),
            energy_level: Some(6),
            productivity_rating: None,
            word_count: 0,
        }),
    }
}

pub fn submit_journal(conn: &mut Connection, content: &str, day: &str) -> SubmitResult {
    submit_record(conn, journal(content, day)).unwrap()
}

/// Embedder that hashes the text to a deterministic spike vector. The same
/// text always lands on the same spike, so tests can steer similarity by
/// reusing or varying a word.
pub struct FakeEmbedder;

impl EmbeddingSource for FakeEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for word in text.split_whitespace() {
            let mut h: usize = 5381;
            for b in word.bytes() {
                h = h.wrapping_mul(33) ^ b as usize;
            }
            v[h % EMBEDDING_DIM] += 1.0;
        }
        Ok(v)
    }
}

/// Embedder that parks every call on a gate until the test releases it, so
/// a test can interleave mutations with an in-flight embedding.
///
/// `entered` fires once per call when the embedder starts waiting; send on
/// `release` to let one call proceed (it then embeds like [`FakeEmbedder`]).
pub struct GatedEmbedder {
    entered: std::sync::mpsc::Sender<()>,
    release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
}

impl GatedEmbedder {
    pub fn new() -> (
        std::sync::Arc<Self>,
        std::sync::mpsc::Receiver<()>,
        std::sync::mpsc::Sender<()>,
    ) {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let embedder = std::sync::Arc::new(Self {
            entered: entered_tx,
            release: std::sync::Mutex::new(release_rx),
        });
        (embedder, entered_rx, release_tx)
    }
}

impl EmbeddingSource for GatedEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.entered.send(()).ok();
        self.release
            .lock()
            .map_err(|_| anyhow::anyhow!("gate poisoned"))?
            .recv()
            .ok();
        FakeEmbedder.embed(text)
    }
}

/// Embedder that fails every call and counts how often it was asked.
pub struct FailingEmbedder {
    pub calls: AtomicUsize,
}

impl FailingEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl EmbeddingSource for FailingEmbedder {
    fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("embedding backend unavailable")
    }
}
