//! A single self-contained index: vectors, keys and graph under one metric.

use super::brute_force;
use super::hnsw::{Graph, Space};
use super::matches::{BatchMatches, Match, Matches};
use crate::config::{DuplicatePolicy, SearchOptions, ShardConfig};
use crate::distance::{Metric, MetricKind};
use crate::error::{Result, ShardexError};
use crate::keys::KeyStore;
use crate::matrix::Matrix;
use crate::metrics::ShardStatistics;
use crate::scalar::{decode_f32, ScalarKind, VectorElement, VectorInput};
use crate::storage::VectorStore;
use crate::types::{Handle, Key, KeyKind};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use roaring::RoaringBitmap;

/// One shard of the index.
///
/// All methods take `&self`; a shard can be shared across threads behind an
/// `Arc` and written to concurrently.
///
/// # Example
///
/// ```
/// use shardex::{KeyKind, MetricKind, ScalarKind, Shard, ShardConfig};
///
/// let shard = Shard::new(ShardConfig::new(3, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64))?;
/// shard.add(1u64, &[0.0f32, 0.0, 0.0])?;
/// shard.add(2u64, &[1.0f32, 1.0, 1.0])?;
///
/// let matches = shard.search(&[0.9f32, 0.9, 0.9], 1)?;
/// assert_eq!(matches[0].key, 2u64.into());
/// # Ok::<(), shardex::ShardexError>(())
/// ```
pub struct Shard {
    pub(crate) config: ShardConfig,
    pub(crate) metric: Metric,
    pub(crate) vectors: VectorStore,
    pub(crate) keys: KeyStore,
    pub(crate) graph: Graph,
    pub(crate) tombstones: RwLock<RoaringBitmap>,
    /// Serializes handle assignment; holds the level generator.
    alloc: Mutex<StdRng>,
    /// Shared by inserts, exclusive for save and compaction.
    pub(crate) structure: RwLock<()>,
}

impl Shard {
    /// Create an empty shard.
    ///
    /// # Errors
    /// `InvalidConfiguration` if the metric does not support the scalar kind
    /// or a tuning knob is out of range.
    pub fn new(config: ShardConfig) -> Result<Self> {
        let metric = config.validate()?;
        let vectors = VectorStore::new(metric.stride());
        let keys = KeyStore::new(config.key_kind, config.enable_key_lookups);
        let graph = Graph::new(config.connectivity, config.connectivity_base);
        Ok(Self::from_parts(config, metric, vectors, keys, graph, RoaringBitmap::new()))
    }

    pub(crate) fn from_parts(
        config: ShardConfig,
        metric: Metric,
        vectors: VectorStore,
        keys: KeyStore,
        graph: Graph,
        tombstones: RoaringBitmap,
    ) -> Self {
        let alloc = Mutex::new(StdRng::seed_from_u64(config.seed ^ vectors.len() as u64));
        Self {
            config,
            metric,
            vectors,
            keys,
            graph,
            tombstones: RwLock::new(tombstones),
            alloc,
            structure: RwLock::new(()),
        }
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn ndim(&self) -> usize {
        self.config.ndim
    }

    pub fn metric_kind(&self) -> MetricKind {
        self.config.metric
    }

    pub fn scalar_kind(&self) -> ScalarKind {
        self.config.scalar
    }

    pub fn key_kind(&self) -> KeyKind {
        self.config.key_kind
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.count() - self.tombstones.read().len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries ever added, tombstoned ones included.
    pub fn count(&self) -> usize {
        self.vectors.len()
    }

    /// True for a read-only memory-mapped shard.
    pub fn is_view(&self) -> bool {
        self.vectors.is_mapped()
    }

    /// True once the key -> handle index exists.
    pub fn key_index_built(&self) -> bool {
        self.keys.is_index_built()
    }

    fn space(&self) -> Space<'_> {
        Space {
            vectors: &self.vectors,
            metric: &self.metric,
        }
    }

    fn encode(&self, input: VectorInput<'_>) -> Result<Vec<u8>> {
        let mut encoded = Vec::with_capacity(self.metric.stride());
        self.metric.encode(input, &mut encoded)?;
        Ok(encoded)
    }

    /// Add `vector` under `key`.
    ///
    /// # Errors
    /// `ReadOnly` on a view, `KeyKindMismatch` for a key of the other kind,
    /// `DuplicateKey` for a present key under [`DuplicatePolicy::Reject`],
    /// plus the encoding errors of the input.
    ///
    /// Without key lookups nothing can be checked for uniqueness, so keys are
    /// appended as given.
    pub fn add<'a>(&self, key: impl Into<Key>, vector: impl Into<VectorInput<'a>>) -> Result<()> {
        if self.is_view() {
            return Err(ShardexError::ReadOnly);
        }
        let key = key.into();
        self.keys.check_kind(&key)?;
        let encoded = self.encode(vector.into())?;
        self.insert(key, &encoded, self.keys.lookups_enabled())
    }

    /// Add one row of `vectors` per key, on a pool of `threads` workers
    /// (0 picks the rayon default).
    ///
    /// Handle order follows completion order unless `threads == 1`. Stops at
    /// the first failing row; rows added before it stay.
    pub fn add_batch<T: VectorElement>(&self, keys: &[Key], vectors: &Matrix<T>, threads: usize) -> Result<()> {
        if keys.len() != vectors.rows() {
            return Err(ShardexError::dimension_mismatch(keys.len(), vectors.rows()));
        }
        tracing::debug!(rows = keys.len(), threads, "adding batch");
        if threads == 1 {
            for (i, &key) in keys.iter().enumerate() {
                self.add(key, T::input(vectors.row(i)))?;
            }
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| ShardexError::invalid_parameter(format!("thread pool: {e}")))?;
        pool.install(|| {
            keys.par_iter()
                .enumerate()
                .try_for_each(|(i, &key)| self.add(key, T::input(vectors.row(i))))
        })
    }

    /// Append an encoded vector and link it into the graph.
    fn insert(&self, key: Key, encoded: &[u8], check_duplicates: bool) -> Result<()> {
        if encoded.len() != self.metric.stride() {
            return Err(ShardexError::dimension_mismatch(self.metric.stride(), encoded.len()));
        }
        let _shared = self.structure.read();
        let (handle, level) = {
            let mut rng = self.alloc.lock();
            let replaced = if check_duplicates {
                self.resolve_duplicate(&key)?
            } else {
                None
            };
            let handle = Handle::try_from(self.vectors.len())
                .map_err(|_| ShardexError::invalid_parameter("shard is full"))?;
            let level = self.graph.random_level(&mut *rng);
            self.keys.push(handle, key)?;
            self.graph.push_node(handle, level)?;
            self.vectors.put(handle, encoded)?;
            // The old entry goes only once the new one is stored.
            if let Some(old) = replaced {
                self.tombstones.write().insert(old);
            }
            (handle, level)
        };
        self.graph
            .insert(handle, level, self.config.expansion_add, self.space())
    }

    /// Handle to tombstone once `key` is re-added, if the policy allows it.
    // Runs inside the allocation section, so no other insert can race it.
    fn resolve_duplicate(&self, key: &Key) -> Result<Option<Handle>> {
        let existing = self.keys.find(key, &self.tombstones.read())?;
        let Some(old) = existing else {
            return Ok(None);
        };
        match self.config.duplicate_policy {
            DuplicatePolicy::Reject => Err(ShardexError::DuplicateKey(key.to_string())),
            DuplicatePolicy::Replace => Ok(Some(old)),
        }
    }

    /// Approximate k nearest neighbors of `vector`.
    ///
    /// # Errors
    /// `EmptyIndex` when no live entry exists, plus the encoding errors of
    /// the query.
    pub fn search<'a>(&self, vector: impl Into<VectorInput<'a>>, k: usize) -> Result<Matches> {
        self.search_with(vector, k, SearchOptions::default())
    }

    /// Exact k nearest neighbors of `vector` by a full scan.
    pub fn exact_search<'a>(&self, vector: impl Into<VectorInput<'a>>, k: usize) -> Result<Matches> {
        self.search_with(vector, k, SearchOptions::default().exact())
    }

    /// Search with per-query options. `k` is clamped to the live entry count.
    pub fn search_with<'a>(
        &self,
        vector: impl Into<VectorInput<'a>>,
        k: usize,
        options: SearchOptions,
    ) -> Result<Matches> {
        let query = self.encode(vector.into())?;
        self.search_encoded(&query, k, options)
    }

    pub(crate) fn search_encoded(&self, query: &[u8], k: usize, options: SearchOptions) -> Result<Matches> {
        let tombstones = self.tombstones.read();
        let count = self.vectors.len();
        let live = count - tombstones.len() as usize;
        if live == 0 {
            return Err(ShardexError::EmptyIndex);
        }
        let k = k.min(live);

        let (hits, counters) = if options.exact {
            brute_force::scan(query, k, count, self.space(), &tombstones)
        } else {
            let expansion = options.expansion.unwrap_or(self.config.expansion_search);
            self.graph
                .search(query, k, expansion, self.space(), &tombstones)?
        };

        let matches = hits
            .into_iter()
            .map(|(handle, distance)| {
                self.keys
                    .key_at(handle)
                    .map(|key| Match::new(key, distance))
                    .ok_or_else(|| ShardexError::corrupt_graph(format!("handle {handle} has no key")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Matches::new(matches, counters))
    }

    /// One [`Matches`] per query row, searched in parallel.
    pub fn search_batch<T: VectorElement>(&self, queries: &Matrix<T>, k: usize) -> Result<BatchMatches> {
        let results = (0..queries.rows())
            .into_par_iter()
            .map(|i| self.search(T::input(queries.row(i)), k))
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchMatches::new(results))
    }

    fn handle_of(&self, key: &Key) -> Result<Option<Handle>> {
        self.keys.find(key, &self.tombstones.read())
    }

    /// Whether a live entry exists under `key`.
    ///
    /// On a view the first key-based call builds the key index.
    pub fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        Ok(self.handle_of(&key.into())?.is_some())
    }

    /// Decoded vector stored under `key`.
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Vec<f32>>> {
        let Some(handle) = self.handle_of(&key.into())? else {
            return Ok(None);
        };
        Ok(self
            .vectors
            .get(handle)
            .map(|bytes| decode_f32(self.config.scalar, self.config.ndim, &bytes)))
    }

    /// Distance between the vectors stored under two keys.
    ///
    /// # Errors
    /// `EmptyIndex` on an empty shard, `KeyNotFound` if either key is absent.
    pub fn pairwise_distance(&self, a: impl Into<Key>, b: impl Into<Key>) -> Result<f64> {
        if self.is_empty() {
            return Err(ShardexError::EmptyIndex);
        }
        let lookup = |key: Key| -> Result<Handle> {
            self.handle_of(&key)?
                .ok_or_else(|| ShardexError::KeyNotFound(key.to_string()))
        };
        let a = lookup(a.into())?;
        let b = lookup(b.into())?;
        match (self.vectors.get(a), self.vectors.get(b)) {
            (Some(va), Some(vb)) => Ok(self.metric.distance(&va, &vb)),
            _ => Err(ShardexError::corrupt_graph("key maps to a missing vector")),
        }
    }

    /// Tombstone the entry under `key`. Returns whether one existed.
    ///
    /// The graph keeps routing through removed nodes until [`Shard::compact`].
    pub fn remove(&self, key: impl Into<Key>) -> Result<bool> {
        if self.is_view() {
            return Err(ShardexError::ReadOnly);
        }
        let key = key.into();
        let _alloc = self.alloc.lock();
        let Some(handle) = self.handle_of(&key)? else {
            return Ok(false);
        };
        self.tombstones.write().insert(handle);
        self.keys.forget(&key);
        Ok(true)
    }

    /// A fresh owned shard holding only the live entries, relinked in
    /// handle order.
    pub fn compact(&self) -> Result<Shard> {
        let _exclusive = self.structure.write();
        let fresh = Shard::new(self.config.clone())?;
        let tombstones = self.tombstones.read().clone();
        for handle in 0..self.vectors.len() as Handle {
            if tombstones.contains(handle) {
                continue;
            }
            let key = self
                .keys
                .key_at(handle)
                .ok_or_else(|| ShardexError::corrupt_graph(format!("handle {handle} has no key")))?;
            let vector = self
                .vectors
                .get(handle)
                .ok_or_else(|| ShardexError::corrupt_graph(format!("handle {handle} has no vector")))?;
            fresh.insert(key, &vector, false)?;
        }
        tracing::info!(
            before = self.vectors.len(),
            after = fresh.count(),
            "compacted shard"
        );
        Ok(fresh)
    }

    /// Point-in-time statistics.
    pub fn statistics(&self) -> ShardStatistics {
        let count = self.count();
        let tombstones = self.tombstones.read().len() as usize;
        ShardStatistics {
            count,
            live: count - tombstones,
            tombstones,
            fragmentation_ratio: if count == 0 {
                0.0
            } else {
                tombstones as f32 / count as f32
            },
            ndim: self.config.ndim,
            metric: self.config.metric,
            scalar: self.config.scalar,
            key_kind: self.config.key_kind,
            max_level: self.graph.entry_point().map_or(0, |e| e.level),
            edges: self.graph.edge_count(),
            memory_bytes: self.vectors.memory_usage(),
            mapped: self.is_view(),
            key_index_built: self.keys.is_index_built(),
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("config", &self.config)
            .field("count", &self.count())
            .field("live", &self.len())
            .field("view", &self.is_view())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{random_vectors, recall_at_k};
    use std::sync::Arc;

    fn l2_shard(ndim: usize) -> Shard {
        Shard::new(ShardConfig::new(ndim, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64)).unwrap()
    }

    #[test]
    fn test_empty_shard() {
        let shard = l2_shard(4);
        assert!(shard.is_empty());
        assert!(matches!(shard.search(&[0.0f32; 4], 1), Err(ShardexError::EmptyIndex)));
        assert!(matches!(shard.pairwise_distance(1u64, 2u64), Err(ShardexError::EmptyIndex)));
    }

    #[test]
    fn test_add_search_get() {
        let shard = l2_shard(2);
        shard.add(10u64, &[0.0f32, 0.0]).unwrap();
        shard.add(20u64, &[3.0f32, 4.0]).unwrap();
        assert_eq!(shard.len(), 2);
        assert!(shard.contains(20u64).unwrap());
        assert!(!shard.contains(30u64).unwrap());
        assert_eq!(shard.get(20u64).unwrap(), Some(vec![3.0, 4.0]));
        assert_eq!(shard.pairwise_distance(10u64, 20u64).unwrap(), 25.0);

        let matches = shard.search(&[2.9f32, 4.1], 10).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].key, Key::U64(20));
    }

    #[test]
    fn test_duplicate_policies() {
        let shard = l2_shard(1);
        shard.add(1u64, &[0.0f32]).unwrap();
        assert!(matches!(shard.add(1u64, &[1.0f32]), Err(ShardexError::DuplicateKey(_))));
        assert_eq!(shard.len(), 1);

        let config = ShardConfig::new(1, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64)
            .with_duplicate_policy(DuplicatePolicy::Replace);
        let shard = Shard::new(config).unwrap();
        shard.add(1u64, &[0.0f32]).unwrap();
        shard.add(1u64, &[5.0f32]).unwrap();
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.count(), 2);
        assert_eq!(shard.get(1u64).unwrap(), Some(vec![5.0]));
        let matches = shard.search(&[0.0f32], 5).unwrap();
        assert_eq!(matches.to_list(), vec![(Key::U64(1), 25.0)]);
    }

    #[test]
    fn test_key_kind_checked() {
        let shard = l2_shard(1);
        let err = shard.add(Key::Uuid(1), &[0.0f32]).unwrap_err();
        assert!(matches!(err, ShardexError::KeyKindMismatch { .. }));
    }

    #[test]
    fn test_lookups_disabled() {
        let config = ShardConfig::new(1, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64).with_key_lookups(false);
        let shard = Shard::new(config).unwrap();
        shard.add(1u64, &[0.0f32]).unwrap();
        shard.add(2u64, &[3.0f32]).unwrap();
        // Uniqueness cannot be checked, so a repeated key is appended.
        shard.add(1u64, &[1.0f32]).unwrap();
        assert_eq!(shard.len(), 3);
        assert!(!shard.key_index_built());

        let matches = shard.search(&[0.9f32], 2).unwrap();
        assert_eq!(matches.keys(), vec![Key::U64(1), Key::U64(1)]);
        assert!(matches!(shard.contains(1u64), Err(ShardexError::LookupsDisabled)));
        assert!(matches!(shard.remove(1u64), Err(ShardexError::LookupsDisabled)));
    }

    #[test]
    fn test_failed_replace_keeps_old_entry() {
        let config = ShardConfig::new(2, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64)
            .with_duplicate_policy(DuplicatePolicy::Replace);
        let shard = Shard::new(config).unwrap();
        shard.add(1u64, &[1.0f32, 2.0]).unwrap();

        let err = shard.insert(Key::U64(1), &[0u8; 3], true).unwrap_err();
        assert!(matches!(err, ShardexError::DimensionMismatch { .. }));
        assert!(matches!(shard.add(1u64, &[1.0f32]), Err(ShardexError::DimensionMismatch { .. })));

        assert_eq!(shard.len(), 1);
        assert_eq!(shard.count(), 1);
        assert_eq!(shard.get(1u64).unwrap(), Some(vec![1.0, 2.0]));

        shard.add(1u64, &[4.0f32, 4.0]).unwrap();
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.get(1u64).unwrap(), Some(vec![4.0, 4.0]));
        assert_eq!(shard.search(&[4.0f32, 4.0], 5).unwrap().to_list(), vec![(Key::U64(1), 0.0)]);
    }

    #[test]
    fn test_remove_and_compact() {
        let shard = l2_shard(1);
        for i in 0..10u64 {
            shard.add(i, &[i as f32]).unwrap();
        }
        assert!(shard.remove(3u64).unwrap());
        assert!(!shard.remove(3u64).unwrap());
        assert_eq!(shard.len(), 9);
        assert!(!shard.contains(3u64).unwrap());

        let matches = shard.search(&[3.0f32], 3).unwrap();
        assert!(matches.keys().iter().all(|&k| k != Key::U64(3)));

        let stats = shard.statistics();
        assert_eq!(stats.tombstones, 1);

        let compacted = shard.compact().unwrap();
        assert_eq!(compacted.count(), 9);
        assert_eq!(compacted.len(), 9);
        assert_eq!(compacted.statistics().tombstones, 0);
        assert_eq!(compacted.search(&[4.0f32], 1).unwrap()[0].key, Key::U64(4));

        // Re-adding a removed key is allowed.
        shard.add(3u64, &[3.0f32]).unwrap();
        assert!(shard.contains(3u64).unwrap());
    }

    #[test]
    fn test_all_removed_is_empty() {
        let shard = l2_shard(1);
        shard.add(1u64, &[1.0f32]).unwrap();
        shard.remove(1u64).unwrap();
        assert!(matches!(shard.search(&[1.0f32], 1), Err(ShardexError::EmptyIndex)));
    }

    #[test]
    fn test_k_clamps_to_live() {
        let shard = l2_shard(1);
        for i in 0..5u64 {
            shard.add(i, &[i as f32]).unwrap();
        }
        assert_eq!(shard.search(&[0.0f32], 100).unwrap().len(), 5);
        assert_eq!(shard.exact_search(&[0.0f32], 100).unwrap().len(), 5);
    }

    #[test]
    fn test_input_validation() {
        let shard = l2_shard(4);
        assert!(matches!(
            shard.add(1u64, &[0.0f32; 3]),
            Err(ShardexError::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(shard.add(1u64, &[0u8; 4]), Err(ShardexError::InvalidConfiguration(_))));
        assert!(shard.is_empty());
    }

    #[test]
    fn test_recall_against_exact() {
        let data = random_vectors(2000, 16, 11);
        let shard = l2_shard(16);
        let keys: Vec<Key> = (0..2000u64).map(Key::U64).collect();
        shard.add_batch(&keys, &data, 1).unwrap();

        let queries = random_vectors(20, 16, 12);
        let mut recall = 0.0;
        for query in queries.iter_rows() {
            let approx = shard.search(query, 10).unwrap();
            let exact = shard.exact_search(query, 10).unwrap();
            recall += recall_at_k(&approx.keys(), &exact.keys(), 10);
        }
        assert!(recall / 20.0 > 0.9, "recall {}", recall / 20.0);
    }

    #[test]
    fn test_concurrent_add_and_search() {
        let shard = Arc::new(l2_shard(8));
        let data = random_vectors(400, 8, 5);
        let keys: Vec<Key> = (0..400u64).map(Key::U64).collect();
        shard.add_batch(&keys, &data, 4).unwrap();
        assert_eq!(shard.len(), 400);

        let results = shard.search_batch(&data, 1).unwrap();
        let hits = results
            .iter()
            .enumerate()
            .filter(|(i, m)| m[0].key == Key::U64(*i as u64))
            .count();
        assert!(hits >= 390, "self hits {hits}");
    }

    #[test]
    fn test_statistics() {
        let shard = l2_shard(2);
        shard.add(1u64, &[0.0f32, 1.0]).unwrap();
        shard.add(2u64, &[1.0f32, 0.0]).unwrap();
        let stats = shard.statistics();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.memory_bytes, 16);
        assert!(stats.edges >= 2);
        assert!(!stats.mapped);
        assert!(stats.key_index_built);
    }
}
