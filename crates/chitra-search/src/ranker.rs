//! Similarity ranking: score the full corpus against one query vector and
//! select the top-k.
//!
//! Scoring is a single batched matrix-vector product (cosine similarity,
//! given both sides are unit-normalized); selection uses a bounded min-heap
//! rather than a full sort. Ordering among exactly tied scores is not part
//! of the contract.

use anyhow::{bail, Result};
use ndarray::ArrayView1;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::store::ScoringMatrix;

/// Entry in the min-heap for top-k selection.
#[derive(Debug, Clone, Copy)]
struct ScoredRow {
    score: f32,
    index: usize,
}

impl PartialEq for ScoredRow {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.index == other.index
    }
}

impl Eq for ScoredRow {}

impl PartialOrd for ScoredRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredRow {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: lower score is "greater" so it gets popped first,
        // keeping the highest scores in the heap
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Score every corpus row against `query` and return the `k` best
/// `(row index, score)` pairs, sorted by score descending.
///
/// `k` is clamped to the corpus size: asking for more results than exist
/// returns everything rather than erroring.
pub fn top_k(matrix: &ScoringMatrix, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
    if query.len() != matrix.dimension() {
        bail!(
            "query vector dimension {} does not match corpus dimension {}",
            query.len(),
            matrix.dimension()
        );
    }

    let k = k.min(matrix.rows());
    if k == 0 {
        return Ok(Vec::new());
    }

    // The only O(N*D) hot path: one batched matvec over the whole corpus
    let scores = matrix.view().dot(&ArrayView1::from(query));

    let mut heap: BinaryHeap<ScoredRow> = BinaryHeap::with_capacity(k + 1);
    for (index, &score) in scores.iter().enumerate() {
        heap.push(ScoredRow { score, index });
        if heap.len() > k {
            heap.pop();
        }
    }

    let mut results: Vec<(usize, f32)> = heap
        .into_iter()
        .map(|entry| (entry.index, entry.score))
        .collect();
    results.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(results)
}
