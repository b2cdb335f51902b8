//! Core identifier types shared by every shard.
//!
//! External keys ([`Key`]) and internal node handles ([`Handle`]) are kept
//! apart so a slot index can never be passed where a caller key is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal node handle: dense slot index inside one shard.
pub type Handle = u32;

/// Width and interpretation of external keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// 64-bit unsigned integer keys.
    U64,
    /// 128-bit identifiers.
    Uuid,
}

impl KeyKind {
    /// Number of bytes one key occupies in the key section.
    #[inline]
    pub const fn width(self) -> usize {
        match self {
            KeyKind::U64 => 8,
            KeyKind::Uuid => 16,
        }
    }

    /// Stable on-disk identifier.
    pub const fn id(self) -> u8 {
        match self {
            KeyKind::U64 => 0,
            KeyKind::Uuid => 1,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::U64 => write!(f, "u64"),
            KeyKind::Uuid => write!(f, "uuid"),
        }
    }
}

impl std::str::FromStr for KeyKind {
    type Err = crate::error::ShardexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u64" => Ok(KeyKind::U64),
            "uuid" | "u128" => Ok(KeyKind::Uuid),
            other => Err(crate::error::ShardexError::invalid_parameter(format!(
                "unknown key_kind '{other}'"
            ))),
        }
    }
}

/// An external key.
///
/// `Uuid` keys are stored big-endian so that ordering matches the byte order
/// of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    /// 64-bit key.
    U64(u64),
    /// 128-bit key.
    Uuid(u128),
}

impl Key {
    /// Build a 128-bit key from its 16 raw bytes.
    #[inline]
    pub const fn uuid_from_bytes(bytes: [u8; 16]) -> Self {
        Key::Uuid(u128::from_be_bytes(bytes))
    }

    /// Kind of this key.
    #[inline]
    pub const fn kind(&self) -> KeyKind {
        match self {
            Key::U64(_) => KeyKind::U64,
            Key::Uuid(_) => KeyKind::Uuid,
        }
    }

    /// Append the on-disk encoding of this key.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Key::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::Uuid(v) => out.extend_from_slice(&v.to_be_bytes()),
        }
    }

    /// Decode a key of the given kind. `bytes` must be exactly `kind.width()` long.
    pub(crate) fn read_from(kind: KeyKind, bytes: &[u8]) -> Self {
        match kind {
            KeyKind::U64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                Key::U64(u64::from_le_bytes(raw))
            }
            KeyKind::Uuid => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&bytes[..16]);
                Key::Uuid(u128::from_be_bytes(raw))
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::U64(v) => write!(f, "{v}"),
            Key::Uuid(v) => write!(f, "{v:032x}"),
        }
    }
}

impl From<u64> for Key {
    #[inline]
    fn from(v: u64) -> Self {
        Key::U64(v)
    }
}

impl From<u128> for Key {
    #[inline]
    fn from(v: u128) -> Self {
        Key::Uuid(v)
    }
}

impl From<[u8; 16]> for Key {
    #[inline]
    fn from(bytes: [u8; 16]) -> Self {
        Key::uuid_from_bytes(bytes)
    }
}
