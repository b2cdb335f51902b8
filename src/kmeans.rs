//! K-Means clustering for partitioning vector sets.
//!
//! Implements Lloyd's algorithm with k-means++ initialization. Typical use is
//! splitting a corpus into groups before building one shard per group.
//!
//! # Example
//!
//! ```
//! use shardex::{kmeans, random_vectors};
//!
//! let vectors = random_vectors(200, 8, 7);
//! let clustering = kmeans(&vectors, 4)?;
//! assert_eq!(clustering.assignments.len(), 200);
//! assert!(clustering.assignments.iter().all(|&c| c < 4));
//! # Ok::<(), shardex::ShardexError>(())
//! ```

use crate::config::kmeans::{DEFAULT_MAX_ITERATIONS, DEFAULT_SEED, KMEANSPP_THRESHOLD};
use crate::distance::l2sq_f32;
use crate::error::{Result, ShardexError};
use crate::matrix::Matrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Result of a k-means run.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Cluster id of every input row, in `[0, k)`.
    pub assignments: Vec<usize>,
    /// Squared Euclidean distance of every row to its centroid.
    pub distances: Vec<f32>,
    /// One row per cluster.
    pub centroids: Matrix<f32>,
    /// Lloyd iterations performed.
    pub iterations: usize,
}

impl Clustering {
    /// Number of rows assigned to each cluster.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.centroids.rows()];
        for &a in &self.assignments {
            sizes[a] += 1;
        }
        sizes
    }

    /// The `n` centroids closest to `query`, closest first.
    pub fn nearest_centroids(&self, query: &[f32], n: usize) -> Vec<usize> {
        let mut distances: Vec<(usize, f32)> = self
            .centroids
            .iter_rows()
            .enumerate()
            .map(|(idx, c)| (idx, l2sq_f32(query, c)))
            .collect();

        distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        distances.truncate(n);
        distances.into_iter().map(|(idx, _)| idx).collect()
    }
}

/// K-Means clustering algorithm.
#[derive(Debug, Clone)]
pub struct KMeans {
    k: usize,
    max_iters: usize,
    seed: u64,
}

impl KMeans {
    /// Create a new K-Means instance.
    ///
    /// # Arguments
    /// * `k` - Number of clusters
    /// * `max_iters` - Maximum Lloyd iterations
    pub fn new(k: usize, max_iters: usize) -> Self {
        Self {
            k,
            max_iters,
            seed: DEFAULT_SEED,
        }
    }

    /// Seed for centroid initialization.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Cluster the rows of `vectors`.
    ///
    /// Iterates until no assignment changes or `max_iters` is reached. A
    /// cluster left empty by an update is re-seeded with the row farthest
    /// from its current centroid.
    ///
    /// # Errors
    /// `EmptyVectorSet` for no rows, `InvalidParameter` when `k` is 0 or
    /// larger than the number of rows.
    pub fn fit(&self, vectors: &Matrix<f32>) -> Result<Clustering> {
        let n = vectors.rows();
        if n == 0 {
            return Err(ShardexError::EmptyVectorSet);
        }
        if self.k == 0 || self.k > n {
            return Err(ShardexError::invalid_parameter(format!(
                "k must be in 1..={n}, got {}",
                self.k
            )));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = if self.k > KMEANSPP_THRESHOLD {
            rand::seq::index::sample(&mut rng, n, self.k)
                .into_iter()
                .map(|i| vectors.row(i).to_vec())
                .collect()
        } else {
            kmeans_plus_plus(vectors, self.k, &mut rng)
        };

        let (mut assignments, mut distances) = assign(vectors, &centroids);
        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.max_iters {
            iterations += 1;
            centroids = update(vectors, &assignments, &distances, centroids);
            let (next, next_distances) = assign(vectors, &centroids);
            converged = next == assignments;
            assignments = next;
            distances = next_distances;
            if converged {
                break;
            }
        }

        tracing::debug!(k = self.k, rows = n, iterations, converged, "k-means finished");
        let cols = vectors.cols();
        Ok(Clustering {
            assignments,
            distances,
            centroids: Matrix::from_parts(self.k, cols, centroids.concat()),
            iterations,
        })
    }
}

/// Cluster `vectors` into `k` groups with default settings.
pub fn kmeans(vectors: &Matrix<f32>, k: usize) -> Result<Clustering> {
    KMeans::new(k, DEFAULT_MAX_ITERATIONS).fit(vectors)
}

/// Pick `k` rows, each with probability proportional to its squared
/// distance from the rows already picked.
fn kmeans_plus_plus(vectors: &Matrix<f32>, k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = vectors.rows();
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(vectors.row(rng.gen_range(0..n)).to_vec());

    let mut nearest: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| l2sq_f32(vectors.row(i), &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = nearest.iter().map(|&d| f64::from(d)).sum();
        let chosen = if total > 0.0 {
            let mut r = rng.gen_range(0.0..total);
            let mut chosen = None;
            for (i, &d) in nearest.iter().enumerate() {
                r -= f64::from(d);
                if r <= 0.0 && d > 0.0 {
                    chosen = Some(i);
                    break;
                }
            }
            // Rounding can leave r slightly positive after the last row.
            chosen.or_else(|| nearest.iter().rposition(|&d| d > 0.0)).unwrap_or(0)
        } else {
            rng.gen_range(0..n)
        };

        let centroid = vectors.row(chosen).to_vec();
        nearest
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, d)| *d = d.min(l2sq_f32(vectors.row(i), &centroid)));
        centroids.push(centroid);
    }
    centroids
}

/// Nearest centroid and its squared distance for every row.
fn assign(vectors: &Matrix<f32>, centroids: &[Vec<f32>]) -> (Vec<usize>, Vec<f32>) {
    (0..vectors.rows())
        .into_par_iter()
        .map(|i| {
            let row = vectors.row(i);
            centroids
                .iter()
                .enumerate()
                .map(|(c, centroid)| (c, l2sq_f32(row, centroid)))
                .fold((0, f32::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
        })
        .unzip()
}

/// Move every centroid to the mean of its rows.
fn update(
    vectors: &Matrix<f32>,
    assignments: &[usize],
    distances: &[f32],
    mut centroids: Vec<Vec<f32>>,
) -> Vec<Vec<f32>> {
    let k = centroids.len();
    let cols = vectors.cols();
    let mut sums = vec![vec![0.0f64; cols]; k];
    let mut counts = vec![0usize; k];
    for (i, &a) in assignments.iter().enumerate() {
        counts[a] += 1;
        for (s, &v) in sums[a].iter_mut().zip(vectors.row(i)) {
            *s += f64::from(v);
        }
    }

    // Farthest rows first, each used at most once for re-seeding.
    let mut donors: Vec<usize> = (0..assignments.len()).collect();
    donors.sort_by(|&a, &b| distances[b].total_cmp(&distances[a]).then(a.cmp(&b)));
    let mut donors = donors.into_iter();

    for (c, centroid) in centroids.iter_mut().enumerate() {
        if counts[c] == 0 {
            if let Some(donor) = donors.next() {
                tracing::trace!(cluster = c, row = donor, "re-seeding empty cluster");
                centroid.copy_from_slice(vectors.row(donor));
            }
            continue;
        }
        let count = counts[c] as f64;
        for (dst, &s) in centroid.iter_mut().zip(&sums[c]) {
            *dst = (s / count) as f32;
        }
    }
    centroids
}
