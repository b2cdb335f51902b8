//! shardex: approximate nearest neighbor search over HNSW shards.
//!
//! A [`Shard`] stores fixed-width vectors under unique keys and answers
//! k-nearest-neighbor queries through a multi-level proximity graph. Shards
//! are saved to a single file that can be restored into memory or
//! memory-mapped as a read-only view, and several shards can be searched as
//! one through a [`ShardCollection`].
//!
//! # Features
//!
//! - **Metrics**: cosine, squared Euclidean, Jensen-Shannon divergence and
//!   correlation over floats; Hamming, Tanimoto, Sorensen and normalized
//!   prefix Hamming (NPHD) over packed bits
//! - **Scalar kinds**: f64, f32, f16, bf16, e5m2, fixed-point i8 and 1-bit
//! - **Concurrent inserts**: `&self` methods, per-node locking, rayon pools
//! - **Zero-copy views**: memmap2-backed shards with a lazily built key index
//! - **Companions**: exact search, k-means, matrix files and recall helpers
//!
//! # Example
//!
//! ```
//! use shardex::{KeyKind, MetricKind, ScalarKind, Shard, ShardConfig};
//!
//! let config = ShardConfig::new(4, MetricKind::Cos, ScalarKind::F16, KeyKind::U64);
//! let shard = Shard::new(config)?;
//! shard.add(7u64, &[1.0f32, 0.0, 0.0, 0.0])?;
//! shard.add(8u64, &[0.0f32, 1.0, 0.0, 0.0])?;
//!
//! let matches = shard.search(&[0.9f32, 0.1, 0.0, 0.0], 1)?;
//! assert_eq!(matches[0].key, 7u64.into());
//! # Ok::<(), shardex::ShardexError>(())
//! ```

pub mod aggregate;
pub mod config;
pub mod dataset;
pub mod distance;
pub mod error;
pub mod index;
pub mod keys;
pub mod kmeans;
pub mod matrix;
pub mod metrics;
pub mod persistence;
pub mod scalar;
pub mod storage;
pub mod types;

// Re-export commonly used types at crate root
pub use aggregate::ShardCollection;
pub use config::{DuplicatePolicy, SearchOptions, ShardConfig};
pub use dataset::{random_bits, random_vectors, recall_at_k, Dataset};
pub use distance::{distance, Metric, MetricKind};
pub use error::{Result, ShardexError};
pub use index::{exact_search, BatchMatches, Match, Matches, SearchCounters, Shard};
pub use kmeans::{kmeans, Clustering, KMeans};
pub use matrix::{load_matrix, save_matrix, Matrix, MatrixElement};
pub use metrics::ShardStatistics;
pub use persistence::ShardMetadata;
pub use scalar::{InputDtype, ScalarKind, VectorElement, VectorInput};
pub use types::{Handle, Key, KeyKind};
