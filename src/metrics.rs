//! Statistics for shard monitoring.
//!
//! [`ShardStatistics`] is a point-in-time snapshot of one shard, useful for
//! capacity planning and for deciding when a compaction pays off:
//!
//! ```ignore
//! let stats = shard.statistics();
//! println!("{}", stats.summary());
//! // ShardStatistics:
//! //   Entries: 1000 live (12 tombstones, 1.2% fragmented)
//! //   Layout: ndim=128 metric=cos scalar=f16 keys=u64
//! //   Graph: 14210 edges, max level 3
//! //   Memory: 0.24 MB (owned), key index ready
//! ```

use crate::distance::MetricKind;
use crate::scalar::ScalarKind;
use crate::types::KeyKind;

/// Snapshot of a shard's size and layout.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardStatistics {
    /// Entries ever added, tombstoned ones included.
    pub count: usize,
    /// Entries visible to search.
    pub live: usize,
    pub tombstones: usize,
    /// Tombstones / count.
    pub fragmentation_ratio: f32,
    pub ndim: usize,
    pub metric: MetricKind,
    pub scalar: ScalarKind,
    pub key_kind: KeyKind,
    /// Top level of the entry point, 0 for an empty shard.
    pub max_level: usize,
    /// Directed graph edges over all levels.
    pub edges: usize,
    /// Vector bytes held in memory or mapped.
    pub memory_bytes: usize,
    /// Backed by a file mapping.
    pub mapped: bool,
    pub key_index_built: bool,
}

impl ShardStatistics {
    /// Create a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "ShardStatistics:\n  \
             Entries: {} live ({} tombstones, {:.1}% fragmented)\n  \
             Layout: ndim={} metric={} scalar={} keys={}\n  \
             Graph: {} edges, max level {}\n  \
             Memory: {:.2} MB ({}), key index {}",
            self.live,
            self.tombstones,
            self.fragmentation_ratio * 100.0,
            self.ndim,
            self.metric,
            self.scalar,
            self.key_kind,
            self.edges,
            self.max_level,
            self.memory_bytes as f64 / (1024.0 * 1024.0),
            if self.mapped { "mapped" } else { "owned" },
            if self.key_index_built { "ready" } else { "not built" }
        )
    }
}
