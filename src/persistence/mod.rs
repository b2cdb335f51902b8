//! Persistence layer: shard containers on disk.
//!
//! A shard is saved to a single self-describing file and brought back either
//! by copying every section into owned memory ([`Shard::restore`]) or by
//! memory-mapping the file and reading sections in place ([`Shard::view`]).
//!
//! # File Format
//!
//! ```text
//! [MAGIC 8B "SHARDEX\0"][VERSION u32][FLAGS u32][CHECKSUM u32][METADATA_LEN u32]
//! [METADATA bincode][zero padding to 64 bytes]
//! [VECTORS][KEYS][TOMBSTONES][GRAPH]      each section 64-byte aligned
//! ```
//!
//! The checksum covers everything after the padded metadata block. It is
//! verified by `restore`. `view` skips it and instead walks the graph section
//! once, checking every node record and link, so opening costs O(nodes +
//! edges) and never touches vector or key pages.
//!
//! # Example
//!
//! ```no_run
//! use shardex::Shard;
//!
//! let meta = Shard::metadata("vectors.shx")?;
//! let config = meta.config().with_key_lookups(false);
//! let shard = Shard::view_with("vectors.shx", &config)?;
//! println!("{} entries", shard.len());
//! # Ok::<(), shardex::ShardexError>(())
//! ```

mod format;

pub use format::{FileHeader, FormatFlags, Section, Sections, ShardMetadata, FORMAT_VERSION, MAGIC};

use crate::config::ShardConfig;
use crate::distance::Metric;
use crate::error::{Result, ShardexError};
use crate::index::hnsw::Graph;
use crate::index::Shard;
use crate::keys::KeyStore;
use crate::storage::{MappedRegion, VectorStore};
use format::padding;
use memmap2::Mmap;
use roaring::RoaringBitmap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

impl Shard {
    /// Write the shard to `path`.
    ///
    /// Inserts are blocked for the duration. The file is written next to
    /// `path` and renamed into place, so an open view of the old file stays
    /// valid.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let _exclusive = self.structure.write();
        let count = self.vectors.len();
        let tombstones: RoaringBitmap = self
            .tombstones
            .read()
            .iter()
            .take_while(|&h| (h as usize) < count)
            .collect();

        let mut body = Vec::with_capacity(count * self.metric.stride());
        let mut sections = Sections::default();

        sections.vectors.offset = body.len() as u64;
        self.vectors.write_to(count, &mut body)?;
        sections.vectors.len = body.len() as u64 - sections.vectors.offset;
        pad(&mut body);

        sections.keys.offset = body.len() as u64;
        self.keys.write_to(count, &mut body)?;
        sections.keys.len = body.len() as u64 - sections.keys.offset;
        pad(&mut body);

        sections.tombstones.offset = body.len() as u64;
        tombstones.serialize_into(&mut body)?;
        sections.tombstones.len = body.len() as u64 - sections.tombstones.offset;
        pad(&mut body);

        sections.graph.offset = body.len() as u64;
        sections.graph.len = self.graph.write_to(count, &mut body)?;

        let entry = self.graph.entry_point();
        let metadata = ShardMetadata {
            ndim: self.config.ndim,
            metric: self.config.metric,
            scalar: self.config.scalar,
            key_kind: self.config.key_kind,
            count: count as u64,
            live: (count - tombstones.len() as usize) as u64,
            connectivity: self.config.connectivity,
            connectivity_base: self.config.connectivity_base,
            expansion_add: self.config.expansion_add,
            expansion_search: self.config.expansion_search,
            entry: entry.map(|e| (e.handle, e.level as u32)),
            max_level: entry.map_or(0, |e| e.level as u32),
            sections,
        };
        let metadata_bytes = metadata.to_bytes()?;

        let mut flags = FormatFlags::default();
        if !tombstones.is_empty() {
            flags.set(FormatFlags::HAS_TOMBSTONES);
        }
        if self.config.key_kind.width() == 16 {
            flags.set(FormatFlags::WIDE_KEYS);
        }
        let header = FileHeader::new(flags, crc32fast::hash(&body), metadata_bytes.len() as u32);

        let staging = staging_path(path);
        {
            let file = File::create(&staging)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&metadata_bytes)?;
            writer.write_all(&vec![0u8; padding(FileHeader::SIZE + metadata_bytes.len())])?;
            writer.write_all(&body)?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        std::fs::rename(&staging, path)?;

        tracing::info!(
            path = %path.display(),
            count,
            live = metadata.live,
            bytes = header.data_start() + body.len(),
            "saved shard"
        );
        Ok(())
    }

    /// Read only the prelude and metadata block of a shard file.
    ///
    /// Never touches the vector or graph sections.
    pub fn metadata(path: impl AsRef<Path>) -> Result<ShardMetadata> {
        let mut file = File::open(path.as_ref())?;
        let mut prelude = [0u8; FileHeader::SIZE];
        file.read_exact(&mut prelude).map_err(truncated)?;
        let header = FileHeader::from_bytes(&prelude)?;
        let mut block = vec![0u8; header.metadata_len as usize];
        file.read_exact(&mut block).map_err(truncated)?;
        ShardMetadata::from_bytes(&block)
    }

    /// Load a shard file into owned memory, verifying its checksum and graph.
    pub fn restore(path: impl AsRef<Path>) -> Result<Shard> {
        let metadata = Self::metadata(path.as_ref())?;
        Self::restore_with(path, &metadata.config())
    }

    /// [`Shard::restore`] with caller-chosen runtime settings.
    ///
    /// # Errors
    /// `InvalidConfiguration` when `config` disagrees with the file on ndim,
    /// metric, scalar kind or key kind.
    pub fn restore_with(path: impl AsRef<Path>, config: &ShardConfig) -> Result<Shard> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let (header, metadata) = read_prelude(&bytes)?;
        let data = bytes
            .get(header.data_start()..)
            .ok_or_else(|| ShardexError::invalid_format("file truncated before data sections"))?;
        if crc32fast::hash(data) != header.checksum {
            return Err(ShardexError::ChecksumMismatch);
        }

        let layout = Layout::resolve(&header, &metadata, config, bytes.len())?;
        let tombstones = layout.tombstones(&bytes)?;
        let (start, len) = layout.vectors;
        let vectors = VectorStore::from_bytes(layout.metric.stride(), &bytes[start..start + len])?;
        let (start, len) = layout.keys;
        let keys = KeyStore::from_bytes(
            layout.config.key_kind,
            &bytes[start..start + len],
            layout.config.enable_key_lookups,
            &tombstones,
        )?;
        if vectors.len() != layout.count || keys.len() != layout.count {
            return Err(ShardexError::invalid_format(format!(
                "sections hold {} vectors and {} keys, metadata claims {}",
                vectors.len(),
                keys.len(),
                layout.count
            )));
        }
        let (start, len) = layout.graph;
        let graph = Graph::from_section(
            &bytes[start..start + len],
            layout.count,
            metadata.entry_point(),
            layout.config.connectivity,
            layout.config.connectivity_base,
        )?;

        tracing::info!(path = %path.display(), count = layout.count, "restored shard");
        Ok(Shard::from_parts(layout.config, layout.metric, vectors, keys, graph, tombstones))
    }

    /// Memory-map a shard file as a read-only view with key lookups enabled.
    pub fn view(path: impl AsRef<Path>) -> Result<Shard> {
        let metadata = Self::metadata(path.as_ref())?;
        Self::view_with(path, &metadata.config())
    }

    /// Memory-map a shard file as a read-only view.
    ///
    /// The graph is validated on attach. The key index is built on the first
    /// key-based call, or never when `config.enable_key_lookups` is false.
    ///
    /// # Errors
    /// `InvalidConfiguration` when `config` disagrees with the file,
    /// `CorruptGraph` when the graph section fails validation.
    pub fn view_with(path: impl AsRef<Path>, config: &ShardConfig) -> Result<Shard> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and shards are never rewritten in
        // place; `save` replaces files by rename.
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });
        let (header, metadata) = read_prelude(&mmap)?;

        let layout = Layout::resolve(&header, &metadata, config, mmap.len())?;
        let tombstones = layout.tombstones(&mmap)?;
        let region = |(start, len): (usize, usize)| MappedRegion::new(Arc::clone(&mmap), start, len);

        let vectors = VectorStore::mapped(layout.metric.stride(), layout.count, region(layout.vectors)?)?;
        let keys = KeyStore::mapped(
            layout.config.key_kind,
            layout.count,
            region(layout.keys)?,
            layout.config.enable_key_lookups,
        )?;
        let graph = Graph::mapped(
            region(layout.graph)?,
            layout.count,
            metadata.entry_point(),
            layout.config.connectivity,
            layout.config.connectivity_base,
        )?;

        tracing::info!(
            path = %path.display(),
            count = layout.count,
            lookups = layout.config.enable_key_lookups,
            "opened shard view"
        );
        Ok(Shard::from_parts(layout.config, layout.metric, vectors, keys, graph, tombstones))
    }
}

/// Absolute byte ranges of every section plus the effective configuration.
struct Layout {
    config: ShardConfig,
    metric: Metric,
    count: usize,
    live: usize,
    vectors: (usize, usize),
    keys: (usize, usize),
    tombstones: (usize, usize),
    graph: (usize, usize),
}

impl Layout {
    fn resolve(
        header: &FileHeader,
        metadata: &ShardMetadata,
        requested: &ShardConfig,
        file_len: usize,
    ) -> Result<Self> {
        let fixed = (metadata.ndim, metadata.metric, metadata.scalar, metadata.key_kind);
        let wanted = (requested.ndim, requested.metric, requested.scalar, requested.key_kind);
        if fixed != wanted {
            return Err(ShardexError::invalid_configuration(format!(
                "file holds ndim={} metric={} scalar={} keys={}, requested ndim={} metric={} scalar={} keys={}",
                fixed.0, fixed.1, fixed.2, fixed.3, wanted.0, wanted.1, wanted.2, wanted.3
            )));
        }

        // Fan-out caps are a property of the saved graph.
        let mut config = requested.clone();
        config.connectivity = metadata.connectivity;
        config.connectivity_base = metadata.connectivity_base;
        let metric = config.validate()?;

        let count = metadata.count()?;
        let live = usize::try_from(metadata.live)
            .ok()
            .filter(|&live| live <= count)
            .ok_or_else(|| ShardexError::invalid_format(format!("live count {} exceeds {count}", metadata.live)))?;
        if count > u32::MAX as usize {
            return Err(ShardexError::invalid_format(format!("entry count {count} exceeds handle space")));
        }

        let data_start = header.data_start();
        let sections = &metadata.sections;
        Ok(Self {
            config,
            metric,
            count,
            live,
            vectors: sections.vectors.range(data_start, file_len)?,
            keys: sections.keys.range(data_start, file_len)?,
            tombstones: sections.tombstones.range(data_start, file_len)?,
            graph: sections.graph.range(data_start, file_len)?,
        })
    }

    fn tombstones(&self, bytes: &[u8]) -> Result<RoaringBitmap> {
        let (start, len) = self.tombstones;
        let bitmap = RoaringBitmap::deserialize_from(&bytes[start..start + len])
            .map_err(|e| ShardexError::invalid_format(format!("tombstone section: {e}")))?;
        if bitmap.max().is_some_and(|h| h as usize >= self.count) {
            return Err(ShardexError::invalid_format("tombstone beyond entry count"));
        }
        if self.count - bitmap.len() as usize != self.live {
            return Err(ShardexError::invalid_format(format!(
                "metadata claims {} live entries, tombstones leave {}",
                self.live,
                self.count - bitmap.len() as usize
            )));
        }
        Ok(bitmap)
    }
}

fn read_prelude(bytes: &[u8]) -> Result<(FileHeader, ShardMetadata)> {
    let header = FileHeader::from_bytes(bytes)?;
    let end = FileHeader::SIZE + header.metadata_len as usize;
    let block = bytes
        .get(FileHeader::SIZE..end)
        .ok_or_else(|| ShardexError::invalid_format("file truncated inside metadata block"))?;
    Ok((header, ShardMetadata::from_bytes(block)?))
}

fn pad(body: &mut Vec<u8>) {
    body.resize(body.len() + padding(body.len()), 0);
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn truncated(err: io::Error) -> ShardexError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ShardexError::invalid_format("file truncated inside header")
    } else {
        ShardexError::Io(err)
    }
}
