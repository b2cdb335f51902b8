//! Hierarchical navigable small world graph over a shard's vectors.
//!
//! # Algorithm Overview
//!
//! - Each node draws a top level from a geometric distribution; level 0 holds
//!   every node and higher levels are progressively sparser
//! - Insert greedily descends from the entry point to the node's top level,
//!   then runs a bounded best-first search per level to collect candidates
//! - Neighbors are chosen with the dominance heuristic: a candidate `c` is
//!   skipped when an already kept neighbor `r` is strictly closer to `c` than
//!   the new node is. Over-full neighbor lists are pruned with the same rule
//! - Every ordering breaks distance ties by ascending handle
//!
//! # Concurrency
//!
//! Each node's neighbor lists sit behind their own `RwLock`. Readers copy a
//! list under the read lock, so a traversal sees a list either before or after
//! an update, never halfway. Inserts only ever hold one node lock at a time.
//!
//! # Layout on disk
//!
//! The graph section is a node table of `count` little-endian `u64` offsets
//! (relative to the section start) followed by one record per node:
//! `u32 level`, then for each level `0..=level` a `u32 n` and `n` `u32`
//! neighbor handles. A viewed graph reads records straight from the mapping.

use super::matches::SearchCounters;
use super::visited::with_visited;
use crate::config::graph::MAX_LEVEL;
use crate::distance::Metric;
use crate::error::{Result, ShardexError};
use crate::storage::{MappedRegion, VectorStore};
use crate::types::Handle;
use parking_lot::RwLock;
use rand::Rng;
use roaring::RoaringBitmap;
use smallvec::SmallVec;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::Write;
use std::sync::Arc;

type Links = SmallVec<[Handle; 32]>;

/// A node with its computed distance, used for heap operations.
#[derive(Clone, Copy, Debug)]
struct ScoredNode {
    handle: Handle,
    distance: f64,
}

impl PartialEq for ScoredNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredNode {}

impl PartialOrd for ScoredNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.handle.cmp(&other.handle))
    }
}

/// Distance oracle over stored vectors.
#[derive(Clone, Copy)]
pub(crate) struct Space<'a> {
    pub vectors: &'a VectorStore,
    pub metric: &'a Metric,
}

impl Space<'_> {
    #[inline]
    pub(crate) fn to_query(&self, query: &[u8], handle: Handle) -> f64 {
        match self.vectors.get(handle) {
            Some(vector) => self.metric.distance(query, &vector),
            None => f64::INFINITY,
        }
    }

    #[inline]
    fn between(&self, a: Handle, b: Handle) -> f64 {
        match self.vectors.get(a) {
            Some(vector) => self.to_query(&vector, b),
            None => f64::INFINITY,
        }
    }
}

/// Top-level node of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub handle: Handle,
    pub level: usize,
}

/// Graph connections for a node at each level.
struct NodeConnections {
    layers: Vec<Links>,
}

enum Topology {
    Owned(RwLock<Vec<Arc<RwLock<NodeConnections>>>>),
    Mapped { region: MappedRegion, count: usize },
}

/// The proximity graph of one shard.
pub struct Graph {
    topology: Topology,
    entry: RwLock<Option<EntryPoint>>,
    connectivity: usize,
    connectivity_base: usize,
    ml: f64,
}

impl Graph {
    /// Empty growable graph.
    pub fn new(connectivity: usize, connectivity_base: usize) -> Self {
        Self {
            topology: Topology::Owned(RwLock::new(Vec::new())),
            entry: RwLock::new(None),
            connectivity,
            connectivity_base,
            ml: 1.0 / (connectivity.max(2) as f64).ln(),
        }
    }

    /// Owned graph decoded from a serialized section.
    ///
    /// # Errors
    /// `CorruptGraph` if the section fails structural validation.
    pub(crate) fn from_section(
        bytes: &[u8],
        count: usize,
        entry: Option<EntryPoint>,
        connectivity: usize,
        connectivity_base: usize,
    ) -> Result<Self> {
        let section = GraphSection::new(bytes, count)?;
        let mut graph = Self::new(connectivity, connectivity_base);
        section.validate(entry, &graph)?;

        let mut nodes = Vec::with_capacity(count);
        for handle in 0..count as Handle {
            let record = section.record(handle)?;
            let layers = (0..=record.level)
                .map(|level| record.links(level).map(|links| links.collect()))
                .collect::<Result<Vec<Links>>>()?;
            nodes.push(Arc::new(RwLock::new(NodeConnections { layers })));
        }
        graph.topology = Topology::Owned(RwLock::new(nodes));
        graph.entry = RwLock::new(entry);
        Ok(graph)
    }

    /// Read-only graph over a mapped section.
    ///
    /// Every node record and link is checked here, once, so later reads can
    /// index the section without bounds failures.
    ///
    /// # Errors
    /// `CorruptGraph` if the section fails structural validation.
    pub(crate) fn mapped(
        region: MappedRegion,
        count: usize,
        entry: Option<EntryPoint>,
        connectivity: usize,
        connectivity_base: usize,
    ) -> Result<Self> {
        let mut graph = Self::new(connectivity, connectivity_base);
        GraphSection::new(region.bytes(), count)?.validate(entry, &graph)?;
        graph.topology = Topology::Mapped { region, count };
        graph.entry = RwLock::new(entry);
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        match &self.topology {
            Topology::Owned(nodes) => nodes.read().len(),
            Topology::Mapped { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_point(&self) -> Option<EntryPoint> {
        *self.entry.read()
    }

    /// Fan-out cap at `level`.
    #[inline]
    pub fn capacity(&self, level: usize) -> usize {
        if level == 0 {
            self.connectivity_base
        } else {
            self.connectivity
        }
    }

    /// Draw a top level for a new node.
    pub(crate) fn random_level<R: Rng>(&self, rng: &mut R) -> usize {
        let r: f64 = rng.gen();
        let level = (-r.ln() * self.ml).floor();
        if level.is_finite() {
            (level as usize).min(MAX_LEVEL)
        } else {
            MAX_LEVEL
        }
    }

    /// Append an unlinked node for `handle`, which must be the next free slot.
    pub(crate) fn push_node(&self, handle: Handle, level: usize) -> Result<()> {
        let Topology::Owned(nodes) = &self.topology else {
            return Err(ShardexError::ReadOnly);
        };
        let mut nodes = nodes.write();
        if handle as usize != nodes.len() {
            return Err(ShardexError::invalid_parameter(format!(
                "graph is append-only: next handle is {}, got {handle}",
                nodes.len()
            )));
        }
        let layers = vec![Links::new(); level + 1];
        nodes.push(Arc::new(RwLock::new(NodeConnections { layers })));
        Ok(())
    }

    /// Top level of `handle`.
    pub fn level(&self, handle: Handle) -> Option<usize> {
        match &self.topology {
            Topology::Owned(nodes) => {
                let node = nodes.read().get(handle as usize).cloned()?;
                let level = node.read().layers.len().checked_sub(1);
                level
            }
            Topology::Mapped { region, count } => GraphSection::new(region.bytes(), *count)
                .and_then(|section| section.record(handle))
                .ok()
                .map(|record| record.level),
        }
    }

    /// Copy of the neighbor list of `handle` at `level`.
    pub fn neighbors(&self, handle: Handle, level: usize) -> Links {
        match &self.topology {
            Topology::Owned(nodes) => {
                let Some(node) = nodes.read().get(handle as usize).cloned() else {
                    return Links::new();
                };
                let node = node.read();
                node.layers.get(level).cloned().unwrap_or_default()
            }
            Topology::Mapped { region, count } => GraphSection::new(region.bytes(), *count)
                .and_then(|section| section.record(handle))
                .and_then(|record| record.links(level).map(|links| links.collect()))
                .unwrap_or_default(),
        }
    }

    /// Total directed edges over all levels.
    pub fn edge_count(&self) -> usize {
        let count = self.len() as Handle;
        (0..count)
            .map(|handle| {
                let top = self.level(handle).unwrap_or(0);
                (0..=top).map(|level| self.neighbors(handle, level).len()).sum::<usize>()
            })
            .sum()
    }

    /// Link the already pushed node `handle` into the graph.
    pub(crate) fn insert(
        &self,
        handle: Handle,
        level: usize,
        expansion: usize,
        space: Space<'_>,
    ) -> Result<()> {
        let entry = {
            let current = *self.entry.read();
            match current {
                Some(entry) => entry,
                None => {
                    let mut slot = self.entry.write();
                    match *slot {
                        Some(entry) => entry,
                        None => {
                            *slot = Some(EntryPoint { handle, level });
                            return Ok(());
                        }
                    }
                }
            }
        };

        let query = space
            .vectors
            .get(handle)
            .ok_or_else(|| ShardexError::corrupt_graph(format!("node {handle} has no vector")))?;
        let mut counters = SearchCounters::default();

        let mut nearest = ScoredNode {
            handle: entry.handle,
            distance: space.to_query(&query, entry.handle),
        };
        for lc in (level + 1..=entry.level).rev() {
            nearest = self.greedy_closest(&query, nearest, lc, space, &mut counters);
        }

        let mut entry_points = vec![nearest];
        for lc in (0..=level.min(entry.level)).rev() {
            let mut candidates =
                self.search_layer(&query, &entry_points, expansion, lc, space, None, &mut counters);
            candidates.retain(|c| c.handle != handle);

            let cap = self.capacity(lc);
            let selected = select_neighbors(&candidates, cap, space);
            self.set_links(handle, lc, selected.iter().map(|n| n.handle).collect())?;
            for neighbor in &selected {
                self.connect(neighbor.handle, handle, lc, cap, space)?;
            }

            if !candidates.is_empty() {
                entry_points = candidates;
            }
        }

        if level > entry.level {
            let mut slot = self.entry.write();
            if slot.map_or(true, |current| level > current.level) {
                *slot = Some(EntryPoint { handle, level });
            }
        }
        Ok(())
    }

    /// Best-first search for the `k` closest live nodes.
    ///
    /// Tombstoned nodes are traversed but never returned.
    pub(crate) fn search(
        &self,
        query: &[u8],
        k: usize,
        expansion: usize,
        space: Space<'_>,
        tombstones: &RoaringBitmap,
    ) -> Result<(Vec<(Handle, f64)>, SearchCounters)> {
        let entry = self.entry_point().ok_or(ShardexError::EmptyIndex)?;
        let mut counters = SearchCounters::default();
        if k == 0 {
            return Ok((Vec::new(), counters));
        }

        let mut nearest = ScoredNode {
            handle: entry.handle,
            distance: space.to_query(query, entry.handle),
        };
        counters.computed_distances += 1;
        for lc in (1..=entry.level).rev() {
            nearest = self.greedy_closest(query, nearest, lc, space, &mut counters);
        }

        let ef = expansion.max(k);
        let mut results =
            self.search_layer(query, &[nearest], ef, 0, space, Some(tombstones), &mut counters);
        results.truncate(k);
        Ok((
            results.into_iter().map(|n| (n.handle, n.distance)).collect(),
            counters,
        ))
    }

    fn greedy_closest(
        &self,
        query: &[u8],
        mut nearest: ScoredNode,
        level: usize,
        space: Space<'_>,
        counters: &mut SearchCounters,
    ) -> ScoredNode {
        let mut changed = true;
        while changed {
            changed = false;
            for neighbor in self.neighbors(nearest.handle, level) {
                let candidate = ScoredNode {
                    handle: neighbor,
                    distance: space.to_query(query, neighbor),
                };
                counters.computed_distances += 1;
                counters.visited_members += 1;
                if candidate < nearest {
                    nearest = candidate;
                    changed = true;
                }
            }
        }
        nearest
    }

    /// Bounded best-first search on one level, closest first.
    ///
    /// With `skip`, skipped nodes extend the frontier but are kept out of the
    /// result set.
    #[allow(clippy::too_many_arguments)]
    fn search_layer(
        &self,
        query: &[u8],
        entry_points: &[ScoredNode],
        ef: usize,
        level: usize,
        space: Space<'_>,
        skip: Option<&RoaringBitmap>,
        counters: &mut SearchCounters,
    ) -> Vec<ScoredNode> {
        let excluded = |handle: Handle| skip.is_some_and(|s| s.contains(handle));

        with_visited(self.len(), |visited| {
            let mut candidates: BinaryHeap<Reverse<ScoredNode>> = BinaryHeap::with_capacity(ef);
            let mut results: BinaryHeap<ScoredNode> = BinaryHeap::with_capacity(ef + 1);

            for &ep in entry_points {
                if visited.insert(ep.handle) {
                    candidates.push(Reverse(ep));
                    if !excluded(ep.handle) {
                        results.push(ep);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }

            while let Some(Reverse(current)) = candidates.pop() {
                if results.len() >= ef && results.peek().is_some_and(|worst| current > *worst) {
                    break;
                }

                for neighbor in self.neighbors(current.handle, level) {
                    if !visited.insert(neighbor) {
                        continue;
                    }
                    let scored = ScoredNode {
                        handle: neighbor,
                        distance: space.to_query(query, neighbor),
                    };
                    counters.computed_distances += 1;

                    let admits = results.len() < ef || results.peek().is_some_and(|worst| scored < *worst);
                    if admits {
                        candidates.push(Reverse(scored));
                        if !excluded(neighbor) {
                            results.push(scored);
                            if results.len() > ef {
                                results.pop();
                            }
                        }
                    }
                }
            }

            counters.visited_members += visited.count();
            results.into_sorted_vec()
        })
    }

    fn set_links(&self, handle: Handle, level: usize, links: Links) -> Result<()> {
        let node = self.owned_node(handle)?;
        let mut node = node.write();
        let slot = node
            .layers
            .get_mut(level)
            .ok_or_else(|| ShardexError::corrupt_graph(format!("node {handle} has no level {level}")))?;
        *slot = links;
        Ok(())
    }

    /// Add `to` to the neighbors of `from`, pruning when over `cap`.
    fn connect(&self, from: Handle, to: Handle, level: usize, cap: usize, space: Space<'_>) -> Result<()> {
        let node = self.owned_node(from)?;
        let mut node = node.write();
        let Some(links) = node.layers.get_mut(level) else {
            return Err(ShardexError::corrupt_graph(format!(
                "node {from} linked at level {level} above its top level"
            )));
        };
        if links.contains(&to) {
            return Ok(());
        }
        if links.len() < cap {
            links.push(to);
            return Ok(());
        }

        let mut scored: Vec<ScoredNode> = links
            .iter()
            .copied()
            .chain(std::iter::once(to))
            .map(|handle| ScoredNode {
                handle,
                distance: space.between(from, handle),
            })
            .collect();
        scored.sort();
        *links = select_neighbors(&scored, cap, space)
            .into_iter()
            .map(|n| n.handle)
            .collect();
        Ok(())
    }

    fn owned_node(&self, handle: Handle) -> Result<Arc<RwLock<NodeConnections>>> {
        let Topology::Owned(nodes) = &self.topology else {
            return Err(ShardexError::ReadOnly);
        };
        nodes
            .read()
            .get(handle as usize)
            .cloned()
            .ok_or_else(|| ShardexError::corrupt_graph(format!("dangling handle {handle}")))
    }

    /// Serialize the first `count` nodes. Returns the bytes written.
    pub(crate) fn write_to<W: Write>(&self, count: usize, writer: &mut W) -> Result<u64> {
        if let Topology::Mapped { region, .. } = &self.topology {
            writer.write_all(region.bytes())?;
            return Ok(region.bytes().len() as u64);
        }

        let mut body = Vec::new();
        let mut table = Vec::with_capacity(count * 8);
        let table_len = (count * 8) as u64;
        for handle in 0..count as Handle {
            table.extend_from_slice(&(table_len + body.len() as u64).to_le_bytes());
            let top = self.level(handle).unwrap_or(0);
            body.extend_from_slice(&(top as u32).to_le_bytes());
            for level in 0..=top {
                let links = self.neighbors(handle, level);
                body.extend_from_slice(&(links.len() as u32).to_le_bytes());
                for neighbor in links {
                    body.extend_from_slice(&neighbor.to_le_bytes());
                }
            }
        }
        writer.write_all(&table)?;
        writer.write_all(&body)?;
        Ok(table_len + body.len() as u64)
    }
}

/// Keep candidates (sorted closest first) that no kept neighbor dominates.
///
/// `c` is dominated when some kept `r` has `d(c, r) < d(c, q)`.
fn select_neighbors(candidates: &[ScoredNode], cap: usize, space: Space<'_>) -> Vec<ScoredNode> {
    let mut kept: Vec<ScoredNode> = Vec::with_capacity(cap);
    for &candidate in candidates {
        if kept.len() >= cap {
            break;
        }
        let dominated = kept
            .iter()
            .any(|r| space.between(candidate.handle, r.handle) < candidate.distance);
        if !dominated {
            kept.push(candidate);
        }
    }
    kept
}

fn read_u32(bytes: &[u8], pos: usize) -> Option<u32> {
    let raw = bytes.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], pos: usize) -> Option<u64> {
    let raw = bytes.get(pos..pos.checked_add(8)?)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Some(u64::from_le_bytes(buf))
}

/// Borrowed reader over a serialized graph section.
struct GraphSection<'a> {
    bytes: &'a [u8],
    count: usize,
}

struct NodeRecord<'a> {
    handle: Handle,
    level: usize,
    bytes: &'a [u8],
    /// Position of the level-0 neighbor count.
    start: usize,
}

impl<'a> GraphSection<'a> {
    fn new(bytes: &'a [u8], count: usize) -> Result<Self> {
        if count.checked_mul(8).map_or(true, |table| table > bytes.len()) {
            return Err(ShardexError::corrupt_graph(format!(
                "node table for {count} nodes exceeds graph section of {} bytes",
                bytes.len()
            )));
        }
        Ok(Self { bytes, count })
    }

    fn record(&self, handle: Handle) -> Result<NodeRecord<'a>> {
        if handle as usize >= self.count {
            return Err(ShardexError::corrupt_graph(format!("handle {handle} out of range")));
        }
        let offset = read_u64(self.bytes, handle as usize * 8)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| ShardexError::corrupt_graph(format!("bad offset for node {handle}")))?;
        let level = read_u32(self.bytes, offset)
            .ok_or_else(|| ShardexError::corrupt_graph(format!("node {handle} record out of bounds")))?
            as usize;
        if level > MAX_LEVEL {
            return Err(ShardexError::corrupt_graph(format!(
                "node {handle} has level {level} above {MAX_LEVEL}"
            )));
        }
        Ok(NodeRecord {
            handle,
            level,
            bytes: self.bytes,
            start: offset + 4,
        })
    }

    fn validate(&self, entry: Option<EntryPoint>, graph: &Graph) -> Result<()> {
        let levels = (0..self.count as Handle)
            .map(|handle| self.record(handle).map(|record| record.level))
            .collect::<Result<Vec<usize>>>()?;

        for handle in 0..self.count as Handle {
            let record = self.record(handle)?;
            for level in 0..=record.level {
                let mut degree = 0usize;
                for neighbor in record.links(level)? {
                    degree += 1;
                    if neighbor == handle {
                        return Err(ShardexError::corrupt_graph(format!("node {handle} links to itself")));
                    }
                    match levels.get(neighbor as usize) {
                        None => {
                            return Err(ShardexError::corrupt_graph(format!(
                                "node {handle} links to missing node {neighbor}"
                            )))
                        }
                        Some(&top) if top < level => {
                            return Err(ShardexError::corrupt_graph(format!(
                                "node {handle} links to node {neighbor} at level {level} above its top level {top}"
                            )))
                        }
                        Some(_) => {}
                    }
                }
                if degree > graph.capacity(level) {
                    return Err(ShardexError::corrupt_graph(format!(
                        "node {handle} has {degree} neighbors at level {level}, cap is {}",
                        graph.capacity(level)
                    )));
                }
            }
        }

        match (entry, self.count) {
            (None, 0) => Ok(()),
            (None, _) => Err(ShardexError::corrupt_graph("entries present but no entry point")),
            (Some(entry), _) => match levels.get(entry.handle as usize) {
                Some(&top) if top == entry.level && levels.iter().all(|&l| l <= top) => Ok(()),
                Some(&top) => Err(ShardexError::corrupt_graph(format!(
                    "entry point {} has level {top}, expected top level {}",
                    entry.handle, entry.level
                ))),
                None => Err(ShardexError::corrupt_graph(format!(
                    "entry point {} out of range",
                    entry.handle
                ))),
            },
        }
    }
}

impl<'a> NodeRecord<'a> {
    fn links(&self, level: usize) -> Result<impl Iterator<Item = Handle> + 'a> {
        if level > self.level {
            return Err(ShardexError::corrupt_graph(format!(
                "node {} has no level {level}",
                self.handle
            )));
        }
        let truncated = || ShardexError::corrupt_graph(format!("node {} record truncated", self.handle));
        let mut pos = self.start;
        for _ in 0..level {
            let n = read_u32(self.bytes, pos).ok_or_else(truncated)? as usize;
            pos += 4 + n * 4;
        }
        let n = read_u32(self.bytes, pos).ok_or_else(truncated)? as usize;
        let raw = self
            .bytes
            .get(pos + 4..pos + 4 + n * 4)
            .ok_or_else(truncated)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
    }
}
