//! Vector storage: an append-only column of fixed-width encoded vectors.
//!
//! Owned stores keep every vector in its own shared allocation, so growing the
//! slot table never moves bytes a reader is holding. Mapped stores are a
//! read-only window into a memory-mapped shard file.

use crate::error::{Result, ShardexError};
use crate::types::Handle;
use memmap2::Mmap;
use parking_lot::RwLock;
use std::io::Write;
use std::ops::{Deref, Range};
use std::sync::Arc;

/// A byte range of a shared memory mapping.
#[derive(Clone)]
pub(crate) struct MappedRegion {
    mmap: Arc<Mmap>,
    range: Range<usize>,
}

impl MappedRegion {
    /// Window `offset..offset + len` of `mmap`.
    pub(crate) fn new(mmap: Arc<Mmap>, offset: usize, len: usize) -> Result<Self> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| {
                ShardexError::invalid_format(format!(
                    "section {offset}+{len} exceeds file size {}",
                    mmap.len()
                ))
            })?;
        Ok(Self {
            mmap,
            range: offset..end,
        })
    }

    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.mmap[self.range.clone()]
    }
}

/// Borrowed view of one stored vector.
pub enum VectorRef<'a> {
    Owned(Arc<[u8]>),
    Mapped(&'a [u8]),
}

impl Deref for VectorRef<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            VectorRef::Owned(bytes) => bytes,
            VectorRef::Mapped(bytes) => bytes,
        }
    }
}

enum Slots {
    Owned(RwLock<Vec<Arc<[u8]>>>),
    Mapped { region: MappedRegion, count: usize },
}

/// Fixed-stride vector column.
pub struct VectorStore {
    stride: usize,
    slots: Slots,
}

impl VectorStore {
    /// Empty growable store.
    pub fn new(stride: usize) -> Self {
        Self {
            stride,
            slots: Slots::Owned(RwLock::new(Vec::new())),
        }
    }

    /// Owned store copied from `count * stride` contiguous bytes.
    pub(crate) fn from_bytes(stride: usize, bytes: &[u8]) -> Result<Self> {
        if stride == 0 || bytes.len() % stride != 0 {
            return Err(ShardexError::invalid_format(format!(
                "vector section of {} bytes is not a multiple of stride {stride}",
                bytes.len()
            )));
        }
        let slots = bytes.chunks_exact(stride).map(Arc::from).collect();
        Ok(Self {
            stride,
            slots: Slots::Owned(RwLock::new(slots)),
        })
    }

    /// Read-only store over a mapped section holding `count` vectors.
    pub(crate) fn mapped(stride: usize, count: usize, region: MappedRegion) -> Result<Self> {
        if region.bytes().len() != stride * count {
            return Err(ShardexError::invalid_format(format!(
                "vector section holds {} bytes, expected {}",
                region.bytes().len(),
                stride * count
            )));
        }
        Ok(Self {
            stride,
            slots: Slots::Mapped { region, count },
        })
    }

    /// Bytes per vector.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn len(&self) -> usize {
        match &self.slots {
            Slots::Owned(slots) => slots.read().len(),
            Slots::Mapped { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when backed by a file mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self.slots, Slots::Mapped { .. })
    }

    /// Store `bytes` at `handle`, which must be the next free slot.
    ///
    /// # Errors
    /// `ReadOnly` on a mapped store, `InvalidParameter` for any handle other
    /// than `len()`, `DimensionMismatch` for a wrong byte count.
    pub fn put(&self, handle: Handle, bytes: &[u8]) -> Result<()> {
        let Slots::Owned(slots) = &self.slots else {
            return Err(ShardexError::ReadOnly);
        };
        if bytes.len() != self.stride {
            return Err(ShardexError::dimension_mismatch(self.stride, bytes.len()));
        }
        let mut slots = slots.write();
        if handle as usize != slots.len() {
            return Err(ShardexError::invalid_parameter(format!(
                "vector store is append-only: next handle is {}, got {handle}",
                slots.len()
            )));
        }
        slots.push(Arc::from(bytes));
        Ok(())
    }

    /// Vector at `handle`, if present.
    #[inline]
    pub fn get(&self, handle: Handle) -> Option<VectorRef<'_>> {
        let index = handle as usize;
        match &self.slots {
            Slots::Owned(slots) => slots.read().get(index).cloned().map(VectorRef::Owned),
            Slots::Mapped { region, count } => {
                if index >= *count {
                    return None;
                }
                let start = index * self.stride;
                Some(VectorRef::Mapped(&region.bytes()[start..start + self.stride]))
            }
        }
    }

    /// Write the first `count` vectors back to back.
    pub(crate) fn write_to<W: Write>(&self, count: usize, writer: &mut W) -> Result<()> {
        match &self.slots {
            Slots::Owned(slots) => {
                for slot in slots.read().iter().take(count) {
                    writer.write_all(slot)?;
                }
            }
            Slots::Mapped { region, .. } => {
                writer.write_all(&region.bytes()[..count * self.stride])?;
            }
        }
        Ok(())
    }

    /// Approximate heap or mapped bytes held.
    pub fn memory_usage(&self) -> usize {
        self.len() * self.stride
    }
}
