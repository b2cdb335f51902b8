//! File format definitions for shard containers.

use crate::config::format::{ALIGNMENT, MAX_METADATA_LEN};
use crate::config::ShardConfig;
use crate::distance::MetricKind;
use crate::error::{Result, ShardexError};
use crate::index::hnsw::EntryPoint;
use crate::scalar::ScalarKind;
use crate::types::KeyKind;
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a shard file: "SHARDEX\0"
pub const MAGIC: [u8; 8] = *b"SHARDEX\0";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// File format flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatFlags {
    bits: u32,
}

impl FormatFlags {
    /// No special flags.
    pub const NONE: u32 = 0;
    /// The tombstone section is non-empty.
    pub const HAS_TOMBSTONES: u32 = 1 << 0;
    /// Keys are 128-bit.
    pub const WIDE_KEYS: u32 = 1 << 1;

    pub fn new(bits: u32) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn has(&self, flag: u32) -> bool {
        self.bits & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.bits |= flag;
    }
}

/// Fixed prelude at the start of every shard file.
///
/// Total size: 24 bytes
/// ```text
/// [MAGIC 8B][VERSION u32][FLAGS u32][CHECKSUM u32][METADATA_LEN u32]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: FormatFlags,
    /// CRC32 of everything after the padded metadata block.
    pub checksum: u32,
    /// Length of the bincode metadata block that follows the prelude.
    pub metadata_len: u32,
}

impl FileHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 24;

    pub fn new(flags: FormatFlags, checksum: u32, metadata_len: u32) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags,
            checksum,
            metadata_len,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        bytes[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.metadata_len.to_le_bytes());
        bytes
    }

    /// Deserialize and verify a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ShardexError::invalid_format("header too small"));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(ShardexError::invalid_format("invalid magic bytes"));
        }

        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let header = Self {
            magic,
            version: word(8),
            flags: FormatFlags::new(word(12)),
            checksum: word(16),
            metadata_len: word(20),
        };

        if header.version == 0 || header.version > FORMAT_VERSION {
            return Err(ShardexError::invalid_format(format!(
                "unsupported version {} (max supported: {})",
                header.version, FORMAT_VERSION
            )));
        }
        if header.metadata_len as usize > MAX_METADATA_LEN {
            return Err(ShardexError::invalid_format(format!(
                "metadata block of {} bytes exceeds limit {}",
                header.metadata_len, MAX_METADATA_LEN
            )));
        }
        Ok(header)
    }

    /// Offset of the first section: prelude plus metadata, padded.
    pub fn data_start(&self) -> usize {
        align_up(Self::SIZE + self.metadata_len as usize)
    }
}

/// Location of one section, relative to the start of the data area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub offset: u64,
    pub len: u64,
}

impl Section {
    pub(crate) fn range(&self, data_start: usize, file_len: usize) -> Result<(usize, usize)> {
        let offset = usize::try_from(self.offset).ok();
        let len = usize::try_from(self.len).ok();
        let start = offset.and_then(|o| o.checked_add(data_start));
        match (start, len) {
            (Some(start), Some(len)) if start.checked_add(len).is_some_and(|end| end <= file_len) => {
                Ok((start, len))
            }
            _ => Err(ShardexError::invalid_format(format!(
                "section {}+{} exceeds file size {file_len}",
                self.offset, self.len
            ))),
        }
    }
}

/// Section table of a shard file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sections {
    pub vectors: Section,
    pub keys: Section,
    pub tombstones: Section,
    pub graph: Section,
}

/// Everything needed to interpret a shard file without reading its sections.
///
/// Returned by [`Shard::metadata`](crate::Shard::metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub ndim: usize,
    pub metric: MetricKind,
    pub scalar: ScalarKind,
    pub key_kind: KeyKind,
    /// Entries including tombstoned ones.
    pub count: u64,
    pub live: u64,
    pub connectivity: usize,
    pub connectivity_base: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
    /// `(handle, level)` of the graph entry point.
    pub entry: Option<(u32, u32)>,
    pub max_level: u32,
    pub sections: Sections,
}

impl ShardMetadata {
    /// A configuration that reopens this file as it was saved, with key
    /// lookups enabled.
    pub fn config(&self) -> ShardConfig {
        let mut config = ShardConfig::new(self.ndim, self.metric, self.scalar, self.key_kind);
        config.connectivity = self.connectivity;
        config.connectivity_base = self.connectivity_base;
        config.expansion_add = self.expansion_add;
        config.expansion_search = self.expansion_search;
        config
    }

    pub(crate) fn entry_point(&self) -> Option<EntryPoint> {
        self.entry.map(|(handle, level)| EntryPoint {
            handle,
            level: level as usize,
        })
    }

    pub(crate) fn count(&self) -> Result<usize> {
        usize::try_from(self.count)
            .map_err(|_| ShardexError::invalid_format(format!("entry count {} too large", self.count)))
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_METADATA_LEN {
            return Err(ShardexError::serialization_error("metadata block too large"));
        }
        Ok(bytes)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Round `n` up to the section alignment.
#[inline]
pub(crate) fn align_up(n: usize) -> usize {
    n.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Zero bytes needed to bring `len` to the section alignment.
#[inline]
pub(crate) fn padding(len: usize) -> usize {
    align_up(len) - len
}
