//! Search engine lifecycle and public contract.
//!
//! `initialize` either yields a `Ready` engine or fails with
//! [`SearchError::Initialization`] — a half-initialized value cannot exist.
//! `shutdown` releases the model capability and is idempotent; calling
//! `search` afterwards is a programming error and panics rather than
//! returning a recoverable error.

use anyhow::{anyhow, Context};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::encoder::clip::ClipTextEncoder;
use crate::encoder::TextEncoder;
use crate::error::SearchError;
use crate::ranker;
use crate::store::{EmbeddingStore, ScoringMatrix};

/// One ranked hit: an identifier resolvable to a servable image file, and
/// its cosine similarity in [-1, 1].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub filename: String,
    pub score: f32,
}

pub struct SearchEngine {
    config: SearchConfig,
    store: EmbeddingStore,
    matrix: ScoringMatrix,
    /// `None` once the engine has been shut down.
    encoder: RwLock<Option<Box<dyn TextEncoder>>>,
}

impl SearchEngine {
    /// Initialize from configuration: validate, load the snapshot, derive
    /// the scoring matrix, and load the CLIP text encoder.
    pub fn initialize(config: SearchConfig) -> Result<Self, SearchError> {
        config
            .validate()
            .map_err(|msg| SearchError::Initialization(anyhow!(msg)))?;

        let encoder = ClipTextEncoder::load(&config)
            .context("failed to load text encoder")
            .map_err(SearchError::Initialization)?;

        Self::with_encoder(config, Box::new(encoder))
    }

    /// Initialize with an injected encoder capability. This is the seam the
    /// test suite uses; `initialize` routes through it.
    pub fn with_encoder(
        config: SearchConfig,
        encoder: Box<dyn TextEncoder>,
    ) -> Result<Self, SearchError> {
        config
            .validate()
            .map_err(|msg| SearchError::Initialization(anyhow!(msg)))?;

        let store = EmbeddingStore::load(&config.embeddings_dir)?;
        let matrix = store.to_scoring_matrix(
            config.precision,
            &config.device,
            config.normalize_embeddings,
        )?;

        if encoder.dimension() != store.dimension() {
            return Err(SearchError::Initialization(anyhow!(
                "encoder dimension {} does not match corpus dimension {}",
                encoder.dimension(),
                store.dimension()
            )));
        }

        tracing::info!(
            images = store.len(),
            dimension = store.dimension(),
            "search engine initialized"
        );

        Ok(Self {
            config,
            store,
            matrix,
            encoder: RwLock::new(Some(encoder)),
        })
    }

    /// Semantic search over the image corpus.
    ///
    /// Returns up to `top_k` `(filename, score)` pairs sorted by score
    /// descending. `top_k` defaults to the configured value and is clamped
    /// to the corpus size.
    ///
    /// # Panics
    ///
    /// Panics if called after [`shutdown`](Self::shutdown).
    pub fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let top_k = top_k.unwrap_or(self.config.default_top_k);

        // Fail fast, before any compute
        self.validate_query(query)?;
        if top_k == 0 {
            return Err(SearchError::InvalidQuery(
                "top_k must be a positive integer".to_string(),
            ));
        }
        let top_k = top_k.min(self.store.len());

        tracing::debug!(query = query, top_k = top_k, "searching");

        let guard = self.encoder.read();
        let encoder = guard
            .as_deref()
            .unwrap_or_else(|| panic!("SearchEngine::search called after shutdown"));

        let query_vector = encoder
            .encode(query)
            .context("query encoding failed")
            .map_err(SearchError::Search)?;

        let hits = ranker::top_k(&self.matrix, &query_vector, top_k)
            .context("similarity ranking failed")
            .map_err(SearchError::Search)?;

        let results = hits
            .into_iter()
            .filter_map(|(index, score)| {
                self.store.identifier(index).map(|filename| SearchResult {
                    filename: filename.to_string(),
                    score,
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(query = query, results = results.len(), "search completed");
        Ok(results)
    }

    fn validate_query(&self, query: &str) -> Result<(), SearchError> {
        let stripped_len = query.trim().chars().count();
        if stripped_len < self.config.min_query_len {
            return Err(SearchError::InvalidQuery(format!(
                "query too short (minimum {} characters)",
                self.config.min_query_len
            )));
        }
        if stripped_len > self.config.max_query_len {
            return Err(SearchError::InvalidQuery(format!(
                "query too long (maximum {} characters)",
                self.config.max_query_len
            )));
        }
        Ok(())
    }

    /// Number of indexed images.
    pub fn num_images(&self) -> usize {
        self.store.len()
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Release the model capability. Idempotent; safe to call repeatedly.
    /// The store and scoring matrix stay resident until drop, but `search`
    /// panics once the engine is shut down.
    pub fn shutdown(&self) {
        let mut guard = self.encoder.write();
        if guard.take().is_some() {
            tracing::info!("search engine shut down, model released");
        }
    }
}

/// Injectable get-or-create cell guaranteeing at-most-one engine
/// construction even under concurrent first access. A failed construction
/// is not cached; the next caller retries from scratch.
pub struct EngineCell {
    inner: Mutex<Option<Arc<SearchEngine>>>,
}

impl EngineCell {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn get_or_init<F>(&self, init: F) -> Result<Arc<SearchEngine>, SearchError>
    where
        F: FnOnce() -> Result<SearchEngine, SearchError>,
    {
        // Holding the lock across init serializes concurrent first access
        let mut guard = self.inner.lock();
        if let Some(engine) = guard.as_ref() {
            return Ok(Arc::clone(engine));
        }
        let engine = Arc::new(init()?);
        *guard = Some(Arc::clone(&engine));
        Ok(engine)
    }

    pub fn get(&self) -> Option<Arc<SearchEngine>> {
        self.inner.lock().clone()
    }

    /// Drop the held engine so the next `get_or_init` constructs afresh.
    pub fn reset(&self) {
        self.inner.lock().take();
    }
}

impl Default for EngineCell {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_ENGINE: EngineCell = EngineCell::new();

/// Process-wide engine built from [`SearchConfig::default`] on first use.
pub fn global_engine() -> Result<Arc<SearchEngine>, SearchError> {
    GLOBAL_ENGINE.get_or_init(|| {
        tracing::info!("creating global search engine instance");
        SearchEngine::initialize(SearchConfig::default())
    })
}

/// Search through the process-wide engine. Main entry point for consumers
/// that do not manage an engine instance themselves.
pub fn search_images(
    query: &str,
    top_k: Option<usize>,
) -> Result<Vec<SearchResult>, SearchError> {
    global_engine()?.search(query, top_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::snapshot::{write_embeddings, write_filenames, EMBEDDINGS_FILE, FILENAMES_FILE};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Deterministic encoder returning a fixed vector for every query.
    struct StaticEncoder {
        vector: Vec<f32>,
    }

    impl TextEncoder for StaticEncoder {
        fn encode(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(self.vector.clone())
        }

        fn dimension(&self) -> usize {
            self.vector.len()
        }
    }

    struct FailingEncoder {
        dimension: usize,
    }

    impl TextEncoder for FailingEncoder {
        fn encode(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Err(anyhow!("model exploded"))
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    fn unit_vectors(rows: usize, dim: usize) -> Vec<f32> {
        // Deterministic pseudo-random rows, normalized per row
        let mut data = Vec::with_capacity(rows * dim);
        let mut state = 0x2545f491u64;
        for _ in 0..rows {
            let start = data.len();
            for _ in 0..dim {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                data.push(((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5);
            }
            let norm: f32 = data[start..].iter().map(|x| x * x).sum::<f32>().sqrt();
            for v in &mut data[start..] {
                *v /= norm;
            }
        }
        data
    }

    fn write_snapshot(rows: usize, dim: usize, data: &[f32]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_embeddings(&dir.path().join(EMBEDDINGS_FILE), rows, dim, data).unwrap();
        let names: Vec<String> = (0..rows).map(|i| format!("img_{:03}.jpg", i)).collect();
        write_filenames(&dir.path().join(FILENAMES_FILE), &names).unwrap();
        dir
    }

    fn test_config(dir: &TempDir) -> SearchConfig {
        SearchConfig {
            embeddings_dir: dir.path().to_path_buf(),
            precision: Precision::Float32,
            normalize_embeddings: true,
            default_top_k: 5,
            min_query_len: 2,
            max_query_len: 512,
            ..SearchConfig::default()
        }
    }

    fn engine_with_query_vector(
        rows: usize,
        dim: usize,
        data: &[f32],
        vector: Vec<f32>,
    ) -> (SearchEngine, TempDir) {
        let dir = write_snapshot(rows, dim, data);
        let config = test_config(&dir);
        let engine =
            SearchEngine::with_encoder(config, Box::new(StaticEncoder { vector })).unwrap();
        (engine, dir)
    }

    #[test]
    fn test_num_images_matches_snapshot() {
        let data = unit_vectors(7, 16);
        let (engine, _dir) = engine_with_query_vector(7, 16, &data, vec![0.0; 16]);
        assert_eq!(engine.num_images(), 7);
    }

    #[test]
    fn test_exact_match_returns_score_one() {
        // Query vector identical to embedding index 3 must return it first
        // with cosine similarity ~1.0.
        let dim = 512;
        let data = unit_vectors(10, dim);
        let row_3 = data[3 * dim..4 * dim].to_vec();
        let (engine, _dir) = engine_with_query_vector(10, dim, &data, row_3);

        let results = engine.search("a red car", Some(1)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].filename, "img_003.jpg");
        assert!((results[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_short_query_rejected() {
        let data = unit_vectors(3, 8);
        let (engine, _dir) = engine_with_query_vector(3, 8, &data, vec![0.0; 8]);
        assert!(matches!(
            engine.search("a", Some(5)),
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_whitespace_query_rejected_by_stripped_length() {
        let data = unit_vectors(3, 8);
        let (engine, _dir) = engine_with_query_vector(3, 8, &data, vec![0.0; 8]);
        // Two spaces: raw length 2, strips to 0
        assert!(matches!(
            engine.search("  ", None),
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_overlong_query_rejected() {
        let data = unit_vectors(3, 8);
        let (engine, _dir) = engine_with_query_vector(3, 8, &data, vec![0.0; 8]);
        let long = "x".repeat(513);
        assert!(matches!(
            engine.search(&long, None),
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_zero_top_k_rejected() {
        let data = unit_vectors(3, 8);
        let (engine, _dir) = engine_with_query_vector(3, 8, &data, vec![0.0; 8]);
        assert!(matches!(
            engine.search("valid query", Some(0)),
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_top_k_beyond_corpus_returns_all() {
        let dim = 8;
        let data = unit_vectors(5, dim);
        let query = data[..dim].to_vec();
        let (engine, _dir) = engine_with_query_vector(5, dim, &data, query);

        let results = engine.search("valid query", Some(20)).unwrap();
        assert_eq!(results.len(), 5);
        for window in results.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
        for result in &results {
            assert!(result.score >= -1.0 - 1e-6 && result.score <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_search_is_deterministic() {
        let dim = 32;
        let data = unit_vectors(20, dim);
        let query = data[5 * dim..6 * dim].to_vec();
        let (engine, _dir) = engine_with_query_vector(20, dim, &data, query);

        let first = engine.search("same query", Some(10)).unwrap();
        let second = engine.search("same query", Some(10)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_encoder_failure_wrapped_as_search_error() {
        let data = unit_vectors(3, 8);
        let dir = write_snapshot(3, 8, &data);
        let config = test_config(&dir);
        let engine =
            SearchEngine::with_encoder(config, Box::new(FailingEncoder { dimension: 8 })).unwrap();
        assert!(matches!(
            engine.search("valid query", None),
            Err(SearchError::Search(_))
        ));
    }

    #[test]
    fn test_missing_filenames_file_fails_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let data = unit_vectors(2, 4);
        write_embeddings(&dir.path().join(EMBEDDINGS_FILE), 2, 4, &data).unwrap();
        let config = SearchConfig {
            embeddings_dir: dir.path().to_path_buf(),
            ..SearchConfig::default()
        };
        let result = SearchEngine::with_encoder(config, Box::new(StaticEncoder { vector: vec![0.0; 4] }));
        assert!(matches!(result, Err(SearchError::Initialization(_))));
    }

    #[test]
    fn test_shape_mismatch_fails_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let data = unit_vectors(10, 512);
        write_embeddings(&dir.path().join(EMBEDDINGS_FILE), 10, 512, &data).unwrap();
        let names: Vec<String> = (0..7).map(|i| format!("img_{}.jpg", i)).collect();
        write_filenames(&dir.path().join(FILENAMES_FILE), &names).unwrap();
        let config = SearchConfig {
            embeddings_dir: dir.path().to_path_buf(),
            ..SearchConfig::default()
        };
        let result = SearchEngine::with_encoder(
            config,
            Box::new(StaticEncoder { vector: vec![0.0; 512] }),
        );
        assert!(matches!(result, Err(SearchError::Initialization(_))));
    }

    #[test]
    fn test_encoder_dimension_mismatch_fails_initialization() {
        let data = unit_vectors(3, 8);
        let dir = write_snapshot(3, 8, &data);
        let config = test_config(&dir);
        let result =
            SearchEngine::with_encoder(config, Box::new(StaticEncoder { vector: vec![0.0; 16] }));
        assert!(matches!(result, Err(SearchError::Initialization(_))));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let data = unit_vectors(3, 8);
        let (engine, _dir) = engine_with_query_vector(3, 8, &data, vec![0.0; 8]);
        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.num_images(), 3);
    }

    #[test]
    #[should_panic(expected = "after shutdown")]
    fn test_search_after_shutdown_panics() {
        let data = unit_vectors(3, 8);
        let (engine, _dir) = engine_with_query_vector(3, 8, &data, vec![0.0; 8]);
        engine.shutdown();
        let _ = engine.search("valid query", None);
    }

    #[test]
    fn test_engine_cell_constructs_at_most_once() {
        let dim = 8;
        let data = unit_vectors(3, dim);
        let dir = write_snapshot(3, dim, &data);
        let config = test_config(&dir);

        let cell = Arc::new(EngineCell::new());
        let constructions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = Arc::clone(&cell);
            let constructions = Arc::clone(&constructions);
            let config = config.clone();
            handles.push(std::thread::spawn(move || {
                let engine = cell
                    .get_or_init(|| {
                        constructions.fetch_add(1, Ordering::SeqCst);
                        SearchEngine::with_encoder(
                            config,
                            Box::new(StaticEncoder { vector: vec![0.0; 8] }),
                        )
                    })
                    .unwrap();
                engine.num_images()
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 3);
        }
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_engine_cell_retries_after_failure() {
        let cell = EngineCell::new();
        let result = cell.get_or_init(|| {
            Err(SearchError::Initialization(anyhow!("snapshot missing")))
        });
        assert!(result.is_err());
        assert!(cell.get().is_none());

        let data = unit_vectors(2, 4);
        let dir = write_snapshot(2, 4, &data);
        let config = test_config(&dir);
        let engine = cell
            .get_or_init(|| {
                SearchEngine::with_encoder(config, Box::new(StaticEncoder { vector: vec![0.0; 4] }))
            })
            .unwrap();
        assert_eq!(engine.num_images(), 2);
    }
}
