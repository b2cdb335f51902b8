//! Dataset utilities for generating and evaluating vector search.

use crate::distance::MetricKind;
use crate::error::Result;
use crate::index::brute_force::exact_search;
use crate::matrix::Matrix;
use crate::types::Key;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// `count` random vectors with components uniform in `[-1, 1)`.
pub fn random_vectors(count: usize, ndim: usize, seed: u64) -> Matrix<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..count * ndim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Matrix::from_parts(count, ndim, data)
}

/// `count` random packed bit vectors of `ndim` bits, padding bits cleared.
pub fn random_bits(count: usize, ndim: usize, seed: u64) -> Matrix<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let cols = ndim.div_ceil(8);
    let tail = ndim % 8;
    let mut data: Vec<u8> = (0..count * cols).map(|_| rng.gen()).collect();
    if tail != 0 {
        for row in data.chunks_exact_mut(cols) {
            row[cols - 1] &= 0xFFu8 << (8 - tail);
        }
    }
    Matrix::from_parts(count, cols, data)
}

/// Vectors, queries and exact neighbors for evaluation.
pub struct Dataset {
    pub vectors: Matrix<f32>,
    pub queries: Matrix<f32>,
    pub ground_truth: Vec<Vec<Key>>,
}

impl Dataset {
    /// Generate a random synthetic dataset.
    ///
    /// Vector `i` is meant to be added under key `i`.
    pub fn generate(n_vectors: usize, n_queries: usize, ndim: usize, seed: u64) -> Self {
        Self {
            vectors: random_vectors(n_vectors, ndim, seed),
            queries: random_vectors(n_queries, ndim, seed.wrapping_add(1)),
            ground_truth: Vec::new(),
        }
    }

    /// Compute ground truth neighbors with an exact scan.
    pub fn compute_ground_truth(&mut self, k: usize, metric: MetricKind) -> Result<()> {
        let results = exact_search(&self.vectors, &self.queries, k, metric)?;
        self.ground_truth = results.iter().map(|matches| matches.keys()).collect();
        Ok(())
    }
}

/// Compute recall@k between predicted and ground truth results.
///
/// Recall is the fraction of true nearest neighbors that were found.
/// Returns a value between 0.0 and 1.0.
pub fn recall_at_k(predicted: &[Key], ground_truth: &[Key], k: usize) -> f32 {
    if k == 0 {
        return 0.0;
    }
    let pred_set: HashSet<Key> = predicted.iter().take(k).copied().collect();
    let truth_set: HashSet<Key> = ground_truth.iter().take(k).copied().collect();

    let intersection = pred_set.intersection(&truth_set).count();
    intersection as f32 / k as f32
}
