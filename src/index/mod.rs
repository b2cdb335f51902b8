//! Index implementations for vector search.

pub mod brute_force;
pub mod hnsw;
pub mod matches;
pub mod shard;
mod visited;

pub use brute_force::exact_search;
pub use hnsw::{EntryPoint, Graph};
pub use matches::{BatchMatches, Match, Matches, SearchCounters};
pub use shard::Shard;
