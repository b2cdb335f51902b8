//! Key column and the key -> handle index.
//!
//! The column maps every handle to its external key and is always present.
//! The reverse index is only needed for key-based operations. Owned shards
//! build it up front and keep it current on insert. Viewed shards build it on
//! the first key-based lookup: `OnceLock` admits exactly one builder, and
//! concurrent first callers block until the index is ready.

use crate::error::{Result, ShardexError};
use crate::storage::MappedRegion;
use crate::types::{Handle, Key, KeyKind};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::io::Write;
use std::sync::OnceLock;

type KeyIndex = RwLock<HashMap<Key, Handle>>;

enum KeyColumn {
    Owned(RwLock<Vec<Key>>),
    Mapped { region: MappedRegion, count: usize },
}

/// Keys of one shard.
pub struct KeyStore {
    kind: KeyKind,
    column: KeyColumn,
    index: OnceLock<KeyIndex>,
    lookups: bool,
}

impl KeyStore {
    /// Empty growable store. With `lookups` the index starts built and empty.
    pub fn new(kind: KeyKind, lookups: bool) -> Self {
        let store = Self {
            kind,
            column: KeyColumn::Owned(RwLock::new(Vec::new())),
            index: OnceLock::new(),
            lookups,
        };
        if lookups {
            let _ = store.index.set(RwLock::new(HashMap::new()));
        }
        store
    }

    /// Owned store decoded from a key section.
    pub(crate) fn from_bytes(
        kind: KeyKind,
        bytes: &[u8],
        lookups: bool,
        tombstones: &RoaringBitmap,
    ) -> Result<Self> {
        if bytes.len() % kind.width() != 0 {
            return Err(ShardexError::invalid_format(format!(
                "key section of {} bytes is not a multiple of {}",
                bytes.len(),
                kind.width()
            )));
        }
        let keys = bytes
            .chunks_exact(kind.width())
            .map(|raw| Key::read_from(kind, raw))
            .collect();
        let store = Self {
            kind,
            column: KeyColumn::Owned(RwLock::new(keys)),
            index: OnceLock::new(),
            lookups,
        };
        if lookups {
            let _ = store.index.set(store.build_index(tombstones));
        }
        Ok(store)
    }

    /// Read-only store over a mapped key section. The index is built lazily.
    pub(crate) fn mapped(
        kind: KeyKind,
        count: usize,
        region: MappedRegion,
        lookups: bool,
    ) -> Result<Self> {
        if region.bytes().len() != count * kind.width() {
            return Err(ShardexError::invalid_format(format!(
                "key section holds {} bytes, expected {}",
                region.bytes().len(),
                count * kind.width()
            )));
        }
        Ok(Self {
            kind,
            column: KeyColumn::Mapped { region, count },
            index: OnceLock::new(),
            lookups,
        })
    }

    #[inline]
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Whether key-based operations are allowed.
    #[inline]
    pub fn lookups_enabled(&self) -> bool {
        self.lookups
    }

    /// True once the key -> handle index exists.
    pub fn is_index_built(&self) -> bool {
        self.index.get().is_some()
    }

    pub fn len(&self) -> usize {
        match &self.column {
            KeyColumn::Owned(keys) => keys.read().len(),
            KeyColumn::Mapped { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key stored for `handle`.
    pub fn key_at(&self, handle: Handle) -> Option<Key> {
        let index = handle as usize;
        match &self.column {
            KeyColumn::Owned(keys) => keys.read().get(index).copied(),
            KeyColumn::Mapped { region, count } => {
                if index >= *count {
                    return None;
                }
                let width = self.kind.width();
                let start = index * width;
                Some(Key::read_from(self.kind, &region.bytes()[start..start + width]))
            }
        }
    }

    /// Reject keys of the wrong kind.
    pub fn check_kind(&self, key: &Key) -> Result<()> {
        if key.kind() != self.kind {
            return Err(ShardexError::key_kind_mismatch(self.kind, key.kind()));
        }
        Ok(())
    }

    /// Live handle for `key`, building the index on first use.
    ///
    /// # Errors
    /// `LookupsDisabled` when the store was created without lookups,
    /// `KeyKindMismatch` for a key of the other kind.
    pub fn find(&self, key: &Key, tombstones: &RoaringBitmap) -> Result<Option<Handle>> {
        self.check_kind(key)?;
        let index = self.index(tombstones)?;
        let handle = index.read().get(key).copied();
        Ok(handle.filter(|&h| !tombstones.contains(h)))
    }

    /// Append `key` for `handle`, which must be the next free slot.
    ///
    /// Callers serialize appends and check for duplicates beforehand.
    pub(crate) fn push(&self, handle: Handle, key: Key) -> Result<()> {
        let KeyColumn::Owned(keys) = &self.column else {
            return Err(ShardexError::ReadOnly);
        };
        self.check_kind(&key)?;
        {
            let mut keys = keys.write();
            if handle as usize != keys.len() {
                return Err(ShardexError::invalid_parameter(format!(
                    "key column is append-only: next handle is {}, got {handle}",
                    keys.len()
                )));
            }
            keys.push(key);
        }
        if let Some(index) = self.index.get() {
            index.write().insert(key, handle);
        }
        Ok(())
    }

    /// Drop `key` from the index; the column keeps it for the tombstoned handle.
    pub(crate) fn forget(&self, key: &Key) {
        if let Some(index) = self.index.get() {
            index.write().remove(key);
        }
    }

    /// Write the first `count` keys in their on-disk encoding.
    pub(crate) fn write_to<W: Write>(&self, count: usize, writer: &mut W) -> Result<()> {
        match &self.column {
            KeyColumn::Owned(keys) => {
                let mut buf = Vec::with_capacity(count * self.kind.width());
                for key in keys.read().iter().take(count) {
                    key.write_to(&mut buf);
                }
                writer.write_all(&buf)?;
            }
            KeyColumn::Mapped { region, .. } => {
                writer.write_all(&region.bytes()[..count * self.kind.width()])?;
            }
        }
        Ok(())
    }

    fn index(&self, tombstones: &RoaringBitmap) -> Result<&KeyIndex> {
        if !self.lookups {
            return Err(ShardexError::LookupsDisabled);
        }
        Ok(self.index.get_or_init(|| {
            tracing::debug!(keys = self.len(), "building key index");
            self.build_index(tombstones)
        }))
    }

    // Later handles win, so a replaced key resolves to its newest entry.
    fn build_index(&self, tombstones: &RoaringBitmap) -> KeyIndex {
        let count = self.len();
        let mut map = HashMap::with_capacity(count);
        for handle in 0..count as Handle {
            if tombstones.contains(handle) {
                continue;
            }
            if let Some(key) = self.key_at(handle) {
                map.insert(key, handle);
            }
        }
        RwLock::new(map)
    }
}
