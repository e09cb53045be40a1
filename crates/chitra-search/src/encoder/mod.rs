pub mod clip;

use anyhow::Result;

/// Text-to-vector capability the engine searches with.
///
/// Implementations must return unit-length vectors in the same embedding
/// space as the stored corpus so a plain dot product is cosine similarity.
pub trait TextEncoder: Send + Sync {
    /// Encode a text query into an embedding vector.
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding vector dimension.
    fn dimension(&self) -> usize;
}
