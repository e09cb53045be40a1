//! Corpus embedding store.
//!
//! Two representations with different lifetimes: [`EmbeddingStore`] keeps the
//! lazy memory-mapped snapshot view plus the eagerly loaded filenames, and
//! [`ScoringMatrix`] is the dense, cast and normalized copy derived from it
//! exactly once at initialization. Only the matrix is touched per query.

use anyhow::anyhow;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use std::path::Path;

use crate::config::Precision;
use crate::error::SearchError;
use crate::snapshot::{self, EmbeddingsFile, EMBEDDINGS_FILE, FILENAMES_FILE};

/// Fixed corpus of image embeddings and their index-aligned filenames.
///
/// Read-only for the lifetime of the process; constructed once at engine
/// initialization from the snapshot written by the offline embedding job.
pub struct EmbeddingStore {
    embeddings: EmbeddingsFile,
    filenames: Vec<String>,
}

impl EmbeddingStore {
    /// Load the snapshot from `dir`, validating the parallel-array invariant.
    pub fn load(dir: &Path) -> Result<Self, SearchError> {
        let embeddings = EmbeddingsFile::open(&dir.join(EMBEDDINGS_FILE))
            .map_err(SearchError::Initialization)?;
        let filenames = snapshot::read_filenames(&dir.join(FILENAMES_FILE))
            .map_err(SearchError::Initialization)?;

        if embeddings.rows() != filenames.len() {
            return Err(SearchError::Initialization(anyhow!(
                "embeddings row count {} does not match filenames length {}",
                embeddings.rows(),
                filenames.len()
            )));
        }

        tracing::info!(
            images = filenames.len(),
            dimension = embeddings.dim(),
            dir = %dir.display(),
            "loaded embedding snapshot"
        );

        Ok(Self {
            embeddings,
            filenames,
        })
    }

    pub fn len(&self) -> usize {
        self.filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.embeddings.dim()
    }

    /// Filename for corpus row `i`.
    pub fn identifier(&self, i: usize) -> Option<&str> {
        self.filenames.get(i).map(String::as_str)
    }

    /// One-time conversion into the dense matrix the ranker scores against,
    /// applying the configured precision and normalization here rather than
    /// per query. Half precision is a CUDA path in the upstream models; on
    /// any other device the request is downgraded to f32 with a warning.
    pub fn to_scoring_matrix(
        &self,
        precision: Precision,
        device: &str,
        normalize: bool,
    ) -> Result<ScoringMatrix, SearchError> {
        if precision.wants_f16(device) && device != "cuda" {
            tracing::warn!(
                device = device,
                "float16 scoring requested but only supported on cuda; using float32"
            );
        }

        let (rows, dim) = (self.embeddings.rows(), self.embeddings.dim());
        let mut flat = vec![0.0f32; rows * dim];
        for (i, row) in flat.chunks_exact_mut(dim).enumerate() {
            self.embeddings.read_row(i, row);
        }

        if normalize {
            flat.par_chunks_exact_mut(dim).for_each(|row| {
                let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 1e-12 {
                    for v in row {
                        *v /= norm;
                    }
                }
            });
        }

        let data = Array2::from_shape_vec((rows, dim), flat)
            .map_err(|e| SearchError::Initialization(anyhow!("matrix shape error: {}", e)))?;
        Ok(ScoringMatrix { data })
    }
}

/// Dense, unit-normalized copy of the corpus embeddings, resident for the
/// engine's lifetime. Immutable after construction and safe to share across
/// concurrent searches.
pub struct ScoringMatrix {
    data: Array2<f32>,
}

impl ScoringMatrix {
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn dimension(&self) -> usize {
        self.data.ncols()
    }

    pub(crate) fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }
}
