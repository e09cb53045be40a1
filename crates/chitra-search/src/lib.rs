//! Semantic text-to-image search over precomputed CLIP embeddings.
//!
//! An offline job embeds an image corpus with a CLIP/SigLIP vision tower and
//! writes the vectors to a static snapshot on disk. This crate loads that
//! snapshot, encodes text queries with the matching text tower, and ranks the
//! corpus by cosine similarity.

pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod ranker;
pub mod snapshot;
pub mod store;

// Re-export primary types for convenience
pub use config::{Precision, SearchConfig};
pub use encoder::TextEncoder;
pub use engine::{global_engine, search_images, EngineCell, SearchEngine, SearchResult};
pub use error::SearchError;
pub use store::{EmbeddingStore, ScoringMatrix};
