//! Multi-shard aggregation.
//!
//! A [`ShardCollection`] searches several independently built shards as one
//! index. The only constraint between member shards is a shared [`KeyKind`];
//! it is fixed by the first shard merged (or up front with
//! [`ShardCollection::with_key_kind`]) and checked before anything changes.
//!
//! # Example
//!
//! ```
//! use shardex::{KeyKind, MetricKind, ScalarKind, Shard, ShardCollection, ShardConfig};
//!
//! let config = ShardConfig::new(2, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64);
//! let a = Shard::new(config.clone())?;
//! a.add(1u64, &[0.0f32, 0.0])?;
//! let b = Shard::new(config)?;
//! b.add(2u64, &[5.0f32, 5.0])?;
//!
//! let mut collection = ShardCollection::new();
//! collection.merge(a)?;
//! collection.merge(b)?;
//! assert_eq!(collection.len(), 2);
//!
//! let matches = collection.search(&[4.0f32, 4.0], 2)?;
//! assert_eq!(matches.keys(), vec![2u64.into(), 1u64.into()]);
//! # Ok::<(), shardex::ShardexError>(())
//! ```

use crate::error::{Result, ShardexError};
use crate::index::{BatchMatches, Match, Matches, SearchCounters, Shard};
use crate::matrix::Matrix;
use crate::persistence::ShardMetadata;
use crate::scalar::{VectorElement, VectorInput};
use crate::types::KeyKind;
use rayon::prelude::*;
use std::path::Path;

/// Shards searched together.
#[derive(Debug, Default)]
pub struct ShardCollection {
    key_kind: Option<KeyKind>,
    shards: Vec<Shard>,
}

impl ShardCollection {
    /// An empty collection that adopts the key kind of its first shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty collection that only accepts shards keyed by `kind`.
    pub fn with_key_kind(kind: KeyKind) -> Self {
        Self {
            key_kind: Some(kind),
            shards: Vec::new(),
        }
    }

    /// Collect in-memory shards. Fails without building anything if their
    /// key kinds disagree.
    pub fn from_shards(shards: impl IntoIterator<Item = Shard>) -> Result<Self> {
        let shards: Vec<Shard> = shards.into_iter().collect();
        let mut collection = Self::new();
        collection.key_kind = common_kind(None, shards.iter().map(Shard::key_kind))?;
        collection.shards = shards;
        Ok(collection)
    }

    /// Open shard files into a new collection; see [`ShardCollection::merge_paths`].
    pub fn from_paths<P: AsRef<Path> + Sync>(paths: &[P], view: bool, threads: usize) -> Result<Self> {
        let mut collection = Self::new();
        collection.merge_paths(paths, view, threads)?;
        Ok(collection)
    }

    /// Key kind shared by every member, once known.
    pub fn key_kind(&self) -> Option<KeyKind> {
        self.key_kind
    }

    /// Live entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    fn check(&self, kind: KeyKind) -> Result<()> {
        match self.key_kind {
            Some(expected) if expected != kind => Err(ShardexError::key_kind_mismatch(expected, kind)),
            _ => Ok(()),
        }
    }

    fn commit(&mut self, shard: Shard) {
        self.key_kind.get_or_insert(shard.key_kind());
        tracing::debug!(
            shard = self.shards.len(),
            entries = shard.len(),
            view = shard.is_view(),
            "merged shard"
        );
        self.shards.push(shard);
    }

    /// Add an in-memory shard.
    ///
    /// # Errors
    /// `KeyKindMismatch` if the shard's key kind differs from the
    /// collection's; the collection is left unchanged.
    pub fn merge(&mut self, shard: Shard) -> Result<()> {
        self.check(shard.key_kind())?;
        self.commit(shard);
        Ok(())
    }

    /// Attach a shard file, memory-mapped when `view` is true.
    ///
    /// The key kind is checked from the file's metadata before the shard is
    /// opened.
    pub fn merge_path(&mut self, path: impl AsRef<Path>, view: bool) -> Result<()> {
        let path = path.as_ref();
        let metadata = Shard::metadata(path)?;
        self.check(metadata.key_kind)?;
        let shard = open(path, &metadata, view)?;
        self.commit(shard);
        Ok(())
    }

    /// Attach several shard files in path order.
    ///
    /// Every file's metadata is read and key kinds are checked (against each
    /// other and the collection) before any shard is attached. Shards are
    /// then opened one by one when `threads == 1`, or in parallel on a pool
    /// of `threads` workers (0 picks the rayon default) and committed in path
    /// order. The first shard that fails to open aborts the rest; shards
    /// attached before it stay.
    pub fn merge_paths<P: AsRef<Path> + Sync>(&mut self, paths: &[P], view: bool, threads: usize) -> Result<()> {
        let metadata = paths
            .iter()
            .map(|path| Shard::metadata(path.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        common_kind(self.key_kind, metadata.iter().map(|m| m.key_kind))?;

        if threads == 1 {
            for (i, (path, meta)) in paths.iter().zip(&metadata).enumerate() {
                let shard = open(path.as_ref(), meta, view).map_err(|e| abort(path.as_ref(), paths.len() - i, e))?;
                self.commit(shard);
            }
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| ShardexError::invalid_parameter(format!("thread pool: {e}")))?;
            let opened: Vec<Result<Shard>> = pool.install(|| {
                paths
                    .par_iter()
                    .zip(metadata.par_iter())
                    .map(|(path, meta)| open(path.as_ref(), meta, view))
                    .collect()
            });
            for (i, (path, shard)) in paths.iter().zip(opened).enumerate() {
                self.commit(shard.map_err(|e| abort(path.as_ref(), paths.len() - i, e))?);
            }
        }

        tracing::info!(
            paths = paths.len(),
            shards = self.shards.len(),
            entries = self.len(),
            "merged shard files"
        );
        Ok(())
    }

    /// The `k` nearest neighbors across every shard.
    ///
    /// Per-shard results are merged by distance, then shard order, then key.
    /// Visited and computed counters are summed over shards.
    ///
    /// # Errors
    /// `EmptyIndex` when no shard holds a live entry.
    pub fn search<'a>(&self, vector: impl Into<VectorInput<'a>>, k: usize) -> Result<Matches> {
        let vector = vector.into();
        if self.is_empty() {
            return Err(ShardexError::EmptyIndex);
        }

        let per_shard = self
            .shards
            .par_iter()
            .enumerate()
            .filter(|(_, shard)| !shard.is_empty())
            .map(|(i, shard)| shard.search(vector, k).map(|matches| (i, matches)))
            .collect::<Result<Vec<_>>>()?;

        let mut counters = SearchCounters::default();
        let mut merged: Vec<(usize, Match)> = Vec::new();
        for (i, matches) in per_shard {
            counters.absorb(matches.counters());
            merged.extend(matches.into_vec().into_iter().map(|m| (i, m)));
        }
        merged.sort_by(|(sa, a), (sb, b)| {
            a.distance
                .total_cmp(&b.distance)
                .then(sa.cmp(sb))
                .then(a.key.cmp(&b.key))
        });
        merged.truncate(k);
        Ok(Matches::new(merged.into_iter().map(|(_, m)| m).collect(), counters))
    }

    /// One [`Matches`] per query row.
    pub fn search_batch<T: VectorElement>(&self, queries: &Matrix<T>, k: usize) -> Result<BatchMatches> {
        let results = (0..queries.rows())
            .into_par_iter()
            .map(|i| self.search(T::input(queries.row(i)), k))
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchMatches::new(results))
    }
}

fn abort(path: &Path, remaining: usize, err: ShardexError) -> ShardexError {
    tracing::warn!(path = %path.display(), remaining, error = %err, "shard failed to attach, skipping the rest");
    err
}

fn open(path: &Path, metadata: &ShardMetadata, view: bool) -> Result<Shard> {
    if view {
        Shard::view_with(path, &metadata.config())
    } else {
        Shard::restore_with(path, &metadata.config())
    }
}

/// The single kind shared by `start` and every item of `kinds`.
fn common_kind(start: Option<KeyKind>, kinds: impl IntoIterator<Item = KeyKind>) -> Result<Option<KeyKind>> {
    let mut expected = start;
    for kind in kinds {
        match expected {
            None => expected = Some(kind),
            Some(e) if e != kind => return Err(ShardexError::key_kind_mismatch(e, kind)),
            Some(_) => {}
        }
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::distance::MetricKind;
    use crate::scalar::ScalarKind;
    use crate::types::Key;
    use tempfile::tempdir;

    fn shard(kind: KeyKind, keys: &[Key], offset: f32) -> Shard {
        let shard = Shard::new(ShardConfig::new(2, MetricKind::L2sq, ScalarKind::F32, kind)).unwrap();
        for (i, &key) in keys.iter().enumerate() {
            shard.add(key, &[offset + i as f32, 0.0]).unwrap();
        }
        shard
    }

    #[test]
    fn test_merge_sums_sizes() {
        let mut collection = ShardCollection::new();
        collection
            .merge(shard(KeyKind::U64, &[Key::U64(1), Key::U64(2)], 0.0))
            .unwrap();
        collection
            .merge(shard(KeyKind::U64, &[Key::U64(3)], 10.0))
            .unwrap();
        assert_eq!(collection.len(), 3);
        assert_eq!(collection.shard_count(), 2);
        assert_eq!(collection.key_kind(), Some(KeyKind::U64));
    }

    #[test]
    fn test_merge_rejects_other_kind() {
        let mut collection = ShardCollection::new();
        collection.merge(shard(KeyKind::U64, &[Key::U64(1)], 0.0)).unwrap();
        let err = collection
            .merge(shard(KeyKind::Uuid, &[Key::Uuid(9)], 0.0))
            .unwrap_err();
        assert!(matches!(err, ShardexError::KeyKindMismatch { .. }));
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.shard_count(), 1);
    }

    #[test]
    fn test_preset_kind() {
        let mut collection = ShardCollection::with_key_kind(KeyKind::Uuid);
        assert!(collection.merge(shard(KeyKind::U64, &[Key::U64(1)], 0.0)).is_err());
        assert!(collection.is_empty());
    }

    #[test]
    fn test_from_shards_validates_first() {
        let err = ShardCollection::from_shards([
            shard(KeyKind::U64, &[Key::U64(1)], 0.0),
            shard(KeyKind::Uuid, &[Key::Uuid(1)], 0.0),
        ])
        .unwrap_err();
        assert!(matches!(err, ShardexError::KeyKindMismatch { .. }));
    }

    #[test]
    fn test_search_merges_by_distance_then_shard() {
        let collection = ShardCollection::from_shards([
            shard(KeyKind::U64, &[Key::U64(5), Key::U64(6)], 0.0),
            shard(KeyKind::U64, &[Key::U64(1), Key::U64(2)], 0.0),
        ])
        .unwrap();

        let matches = collection.search(&[0.0f32, 0.0], 3).unwrap();
        // Key 5 and key 1 tie at distance 0; shard order wins over key order.
        assert_eq!(
            matches.to_list(),
            vec![(Key::U64(5), 0.0), (Key::U64(1), 0.0), (Key::U64(6), 1.0)]
        );

        let all = collection.search(&[0.0f32, 0.0], 100).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_empty_collection() {
        let collection = ShardCollection::new();
        assert!(collection.is_empty());
        assert!(matches!(collection.search(&[0.0f32, 0.0], 1), Err(ShardexError::EmptyIndex)));
    }

    #[test]
    fn test_merge_paths() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.shx");
        let b = dir.path().join("b.shx");
        let c = dir.path().join("c.shx");
        shard(KeyKind::U64, &[Key::U64(1), Key::U64(2)], 0.0).save(&a).unwrap();
        shard(KeyKind::U64, &[Key::U64(3)], 5.0).save(&b).unwrap();
        shard(KeyKind::Uuid, &[Key::Uuid(7)], 0.0).save(&c).unwrap();

        for threads in [1, 2] {
            let collection = ShardCollection::from_paths(&[&a, &b], true, threads).unwrap();
            assert_eq!(collection.len(), 3);
            assert!(collection.shards().iter().all(Shard::is_view));
            assert_eq!(collection.search(&[5.0f32, 0.0], 1).unwrap()[0].key, Key::U64(3));
        }

        let mut collection = ShardCollection::new();
        let err = collection.merge_paths(&[&a, &c], false, 1).unwrap_err();
        assert!(matches!(err, ShardexError::KeyKindMismatch { .. }));
        assert_eq!(collection.shard_count(), 0);
        assert_eq!(collection.key_kind(), None);

        collection.merge_path(&b, false).unwrap();
        assert!(!collection.shards()[0].is_view());
        assert!(collection.merge_path(&c, true).is_err());
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_merge_paths_empty() {
        let paths: [&Path; 0] = [];
        let collection = ShardCollection::from_paths(&paths, true, 1).unwrap();
        assert!(collection.is_empty());
        assert_eq!(collection.shard_count(), 0);
    }
}
