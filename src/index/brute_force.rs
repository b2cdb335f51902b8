//! Exact nearest neighbor search.
//!
//! Scans every stored vector and keeps the k closest, so results are always
//! correct at O(n) cost. Used as the ground-truth baseline for graph search
//! and by [`exact_search`] over raw datasets.

use super::hnsw::Space;
use super::matches::{BatchMatches, Match, Matches, SearchCounters};
use crate::config::search::EXACT_CHUNK_SIZE;
use crate::distance::{Metric, MetricKind};
use crate::error::{Result, ShardexError};
use crate::matrix::Matrix;
use crate::scalar::VectorElement;
use crate::storage::VectorStore;
use crate::types::{Handle, Key};
use rayon::prelude::*;
use roaring::RoaringBitmap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A vector with its computed distance, used for heap operations.
#[derive(Clone, Copy)]
struct ScoredVector {
    handle: Handle,
    distance: f64,
}

impl PartialEq for ScoredVector {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredVector {}

impl PartialOrd for ScoredVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredVector {
    // Max-heap on (distance, handle): peek() is the current worst.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.handle.cmp(&other.handle))
    }
}

fn offer(heap: &mut BinaryHeap<ScoredVector>, k: usize, item: ScoredVector) {
    if heap.len() < k {
        heap.push(item);
    } else if heap.peek().is_some_and(|worst| item < *worst) {
        heap.pop();
        heap.push(item);
    }
}

/// The `k` closest live handles among the first `count`, closest first.
pub(crate) fn scan(
    query: &[u8],
    k: usize,
    count: usize,
    space: Space<'_>,
    tombstones: &RoaringBitmap,
) -> (Vec<(Handle, f64)>, SearchCounters) {
    if k == 0 || count == 0 {
        return (Vec::new(), SearchCounters::default());
    }

    let chunks = count.div_ceil(EXACT_CHUNK_SIZE);
    let heap = (0..chunks)
        .into_par_iter()
        .map(|chunk| {
            let start = chunk * EXACT_CHUNK_SIZE;
            let end = (start + EXACT_CHUNK_SIZE).min(count);
            let mut local: BinaryHeap<ScoredVector> = BinaryHeap::with_capacity(k + 1);
            for handle in start as Handle..end as Handle {
                if tombstones.contains(handle) {
                    continue;
                }
                let distance = space.to_query(query, handle);
                offer(&mut local, k, ScoredVector { handle, distance });
            }
            local
        })
        .reduce(
            || BinaryHeap::with_capacity(k + 1),
            |mut a, b| {
                for item in b {
                    offer(&mut a, k, item);
                }
                a
            },
        );

    let scanned = count - tombstones.iter().take_while(|&h| (h as usize) < count).count();
    let counters = SearchCounters {
        visited_members: scanned,
        computed_distances: scanned,
    };
    let results = heap
        .into_sorted_vec()
        .into_iter()
        .map(|sv| (sv.handle, sv.distance))
        .collect();
    (results, counters)
}

/// Exact k-nearest-neighbor search of every query row against `dataset`.
///
/// Rows are stored as `T::SCALAR` and matched under `metric`; result keys are
/// dataset row indices as `Key::U64`. Each query's list has `min(k, rows)`
/// matches.
///
/// # Errors
/// `InvalidConfiguration` if `metric` does not support `T`,
/// `DimensionMismatch` if query and dataset widths differ, `EmptyIndex` for
/// an empty dataset.
///
/// # Example
///
/// ```
/// use shardex::{exact_search, Matrix, MetricKind};
///
/// let dataset = Matrix::new(3, 2, vec![0.0f32, 0.0, 1.0, 0.0, 5.0, 5.0]).unwrap();
/// let queries = Matrix::new(1, 2, vec![0.9f32, 0.1]).unwrap();
/// let results = exact_search(&dataset, &queries, 2, MetricKind::L2sq).unwrap();
/// assert_eq!(results[0][0].key, shardex::Key::U64(1));
/// ```
pub fn exact_search<T: VectorElement>(
    dataset: &Matrix<T>,
    queries: &Matrix<T>,
    k: usize,
    metric: MetricKind,
) -> Result<BatchMatches> {
    if queries.cols() != dataset.cols() {
        return Err(ShardexError::dimension_mismatch(dataset.cols(), queries.cols()));
    }
    if dataset.is_empty() {
        return Err(ShardexError::EmptyIndex);
    }
    let metric = Metric::new(metric, T::SCALAR, T::ndim(dataset.cols()))?;

    let vectors = VectorStore::new(metric.stride());
    let mut buf = Vec::with_capacity(metric.stride());
    for (row, values) in dataset.iter_rows().enumerate() {
        metric.encode(T::input(values), &mut buf)?;
        vectors.put(row as Handle, &buf)?;
    }

    let space = Space {
        vectors: &vectors,
        metric: &metric,
    };
    let none = RoaringBitmap::new();
    let results = (0..queries.rows())
        .into_par_iter()
        .map(|i| {
            let mut query = Vec::with_capacity(metric.stride());
            metric.encode(T::input(queries.row(i)), &mut query)?;
            let (hits, counters) = scan(&query, k, dataset.rows(), space, &none);
            let matches = hits
                .into_iter()
                .map(|(handle, distance)| Match::new(Key::U64(u64::from(handle)), distance))
                .collect();
            Ok(Matches::new(matches, counters))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(BatchMatches::new(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::random_vectors;

    #[test]
    fn test_scan_sorted_and_complete() {
        let data = random_vectors(1500, 16, 1);
        let results = exact_search(&data, &data, 10, MetricKind::L2sq).unwrap();
        assert_eq!(results.len(), 1500);
        for (i, matches) in results.iter().enumerate().take(50) {
            assert_eq!(matches.len(), 10);
            assert_eq!(matches[0].key, Key::U64(i as u64));
            assert_eq!(matches[0].distance, 0.0);
            for pair in matches.to_list().windows(2) {
                assert!(pair[0].1 <= pair[1].1);
            }
            assert_eq!(matches.computed_distances, 1500);
        }
    }

    #[test]
    fn test_k_larger_than_dataset() {
        let data = Matrix::new(3, 1, vec![0.0f32, 1.0, 2.0]).unwrap();
        let results = exact_search(&data, &data, 10, MetricKind::L2sq).unwrap();
        assert_eq!(results[2].len(), 3);
        assert_eq!(results[2].keys(), vec![Key::U64(2), Key::U64(1), Key::U64(0)]);
    }

    #[test]
    fn test_ties_break_by_row() {
        let data = Matrix::new(3, 1, vec![1.0f32, -1.0, 1.0]).unwrap();
        let query = Matrix::new(1, 1, vec![0.0f32]).unwrap();
        let results = exact_search(&data, &query, 3, MetricKind::L2sq).unwrap();
        assert_eq!(results[0].keys(), vec![Key::U64(0), Key::U64(1), Key::U64(2)]);
    }

    #[test]
    fn test_binary_rows() {
        let data = Matrix::new(2, 1, vec![0b1111_0000u8, 0b0000_1111]).unwrap();
        let query = Matrix::new(1, 1, vec![0b1110_0000u8]).unwrap();
        let results = exact_search(&data, &query, 1, MetricKind::Hamming).unwrap();
        assert_eq!(results[0][0].to_tuple(), (Key::U64(0), 1.0));
    }

    #[test]
    fn test_errors() {
        let data = Matrix::new(2, 2, vec![0.0f32; 4]).unwrap();
        let query = Matrix::new(1, 3, vec![0.0f32; 3]).unwrap();
        assert!(matches!(
            exact_search(&data, &query, 1, MetricKind::L2sq),
            Err(ShardexError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            exact_search(&data, &data, 1, MetricKind::Nphd),
            Err(ShardexError::InvalidConfiguration(_))
        ));
    }
}
