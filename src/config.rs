//! Shard configuration and named defaults.
//!
//! Tunable numbers live in the sub-modules below so they can be found and
//! documented in one place. [`ShardConfig`] fixes the four parameters a shard
//! can never change (dimensionality, metric, scalar and key kind) plus the
//! graph tuning knobs.

use crate::distance::{Metric, MetricKind};
use crate::error::{Result, ShardexError};
use crate::scalar::ScalarKind;
use crate::types::KeyKind;
use serde::{Deserialize, Serialize};

/// Defaults for the proximity graph.
pub mod graph {
    /// Default max connections per node on upper levels.
    pub const DEFAULT_CONNECTIVITY: usize = 16;

    /// Default beam width while inserting.
    pub const DEFAULT_EXPANSION_ADD: usize = 128;

    /// Default beam width while searching.
    pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

    /// Highest level a node can be assigned.
    pub const MAX_LEVEL: usize = 16;

    /// Default seed for level assignment.
    pub const DEFAULT_SEED: u64 = 42;
}

/// Defaults for k-means clustering.
pub mod kmeans {
    /// Above this many clusters, initialization samples centroids at random
    /// instead of running k-means++ (which costs O(k^2 n)).
    pub const KMEANSPP_THRESHOLD: usize = 64;

    /// Default cap on Lloyd iterations.
    pub const DEFAULT_MAX_ITERATIONS: usize = 100;

    /// Default seed.
    pub const DEFAULT_SEED: u64 = 42;
}

/// Defaults for brute-force scans.
pub mod search {
    /// Rows handed to one rayon task during an exact scan.
    pub const EXACT_CHUNK_SIZE: usize = 1024;
}

/// Limits of the container format.
pub mod format {
    /// Section alignment in bytes.
    pub const ALIGNMENT: usize = 64;

    /// Largest metadata block a reader accepts.
    pub const MAX_METADATA_LEN: usize = 1 << 20;
}

/// What `add` does with a key that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Fail with `DuplicateKey`.
    #[default]
    Reject,
    /// Tombstone the existing entry and insert the new vector under the key.
    Replace,
}

/// Parameters of one shard.
///
/// # Example
///
/// ```
/// use shardex::{KeyKind, MetricKind, ScalarKind, ShardConfig};
///
/// let config = ShardConfig::new(128, MetricKind::Cos, ScalarKind::F16, KeyKind::U64)
///     .with_connectivity(32)
///     .with_expansion_search(100);
/// assert_eq!(config.connectivity_base, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub ndim: usize,
    pub metric: MetricKind,
    pub scalar: ScalarKind,
    pub key_kind: KeyKind,
    /// Max neighbors per node on levels above 0.
    pub connectivity: usize,
    /// Max neighbors per node on level 0.
    pub connectivity_base: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
    /// Build the key -> handle index. When false, adds skip the duplicate
    /// check and key-based reads fail with `LookupsDisabled`.
    pub enable_key_lookups: bool,
    pub duplicate_policy: DuplicatePolicy,
    /// Seed for level assignment.
    pub seed: u64,
}

impl ShardConfig {
    /// Configuration with default tuning for the given fixed parameters.
    pub fn new(ndim: usize, metric: MetricKind, scalar: ScalarKind, key_kind: KeyKind) -> Self {
        Self {
            ndim,
            metric,
            scalar,
            key_kind,
            connectivity: graph::DEFAULT_CONNECTIVITY,
            connectivity_base: graph::DEFAULT_CONNECTIVITY * 2,
            expansion_add: graph::DEFAULT_EXPANSION_ADD,
            expansion_search: graph::DEFAULT_EXPANSION_SEARCH,
            enable_key_lookups: true,
            duplicate_policy: DuplicatePolicy::Reject,
            seed: graph::DEFAULT_SEED,
        }
    }

    /// Set the upper-level fan-out; level 0 gets twice as many.
    pub fn with_connectivity(mut self, connectivity: usize) -> Self {
        self.connectivity = connectivity;
        self.connectivity_base = connectivity * 2;
        self
    }

    pub fn with_expansion_add(mut self, expansion: usize) -> Self {
        self.expansion_add = expansion;
        self
    }

    pub fn with_expansion_search(mut self, expansion: usize) -> Self {
        self.expansion_search = expansion;
        self
    }

    pub fn with_key_lookups(mut self, enabled: bool) -> Self {
        self.enable_key_lookups = enabled;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check the knobs and resolve the metric.
    ///
    /// # Errors
    /// `InvalidConfiguration` for an unsupported metric/scalar pair, zero
    /// dimensions, connectivity below 2 or a zero beam width.
    pub fn validate(&self) -> Result<Metric> {
        if self.connectivity < 2 || self.connectivity_base < self.connectivity {
            return Err(ShardexError::invalid_configuration(format!(
                "connectivity must be at least 2 and not exceed connectivity_base, got {} / {}",
                self.connectivity, self.connectivity_base
            )));
        }
        if self.expansion_add == 0 || self.expansion_search == 0 {
            return Err(ShardexError::invalid_configuration(
                "expansion values must be positive",
            ));
        }
        Metric::new(self.metric, self.scalar, self.ndim)
    }
}

/// Per-query knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Beam width; the shard's `expansion_search` when unset.
    pub expansion: Option<usize>,
    /// Scan every vector instead of walking the graph.
    pub exact: bool,
}

impl SearchOptions {
    pub fn with_expansion(mut self, expansion: usize) -> Self {
        self.expansion = Some(expansion);
        self
    }

    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }
}
