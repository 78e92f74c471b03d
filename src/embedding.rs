//! The external embedding-generator boundary.
//!
//! Provides the [`EmbeddingSource`] trait. Vectors are computed by an
//! external AI collaborator (potentially slow, potentially failing); the
//! core treats the call as opaque and never assumes synchronous success —
//! the coordinator invokes it with a timeout and bounded retries.

use anyhow::Result;

/// Number of components in every stored embedding vector.
pub const EMBEDDING_DIM: usize = 1536;

/// Trait for turning record text into a fixed-dimensionality vector.
///
/// Implementations must produce vectors of exactly [`EMBEDDING_DIM`]
/// components. All methods are synchronous — callers in async contexts
/// should use `tokio::task::spawn_blocking` (the coordinator does).
pub trait EmbeddingSource: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Return the number of dimensions this source produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}
