//! Scalar encodings and the codec between caller input and stored bytes.
//!
//! A shard stores every vector as `ScalarKind::bytes_for(ndim)` little-endian
//! bytes. Callers hand vectors over as a [`VectorInput`]; [`encode`] converts
//! them into the shard's kind with these rounding rules:
//!
//! - `F64`, `F32`, `F16`, `BF16`: round-to-nearest-even down-cast.
//! - `E5M2`: round to `F16` first, then round-to-nearest-even on the dropped
//!   low mantissa byte (E5M2 is the upper byte of an IEEE half).
//! - Finite values beyond a float kind's range saturate to its largest finite
//!   value of the same sign. Non-finite input is rejected.
//! - `I8`: fixed point over `[-1, 1]`, `clamp(round(x * 127), -127, 127)`
//!   with ties rounded away from zero; decoded as `v / 127`.
//! - `B1`: packed bits, most significant bit first; padding bits past `ndim`
//!   are cleared.

use crate::error::{Result, ShardexError};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// In-memory encoding of stored vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    /// IEEE double.
    F64,
    /// IEEE single.
    F32,
    /// IEEE half.
    F16,
    /// Brain float.
    BF16,
    /// 8-bit float with 5 exponent and 2 mantissa bits.
    E5M2,
    /// Signed 8-bit fixed point over `[-1, 1]`.
    I8,
    /// One bit per dimension, packed.
    B1,
}

impl ScalarKind {
    /// Bytes needed to store one vector of `ndim` dimensions.
    #[inline]
    pub const fn bytes_for(self, ndim: usize) -> usize {
        match self {
            ScalarKind::F64 => ndim * 8,
            ScalarKind::F32 => ndim * 4,
            ScalarKind::F16 | ScalarKind::BF16 => ndim * 2,
            ScalarKind::E5M2 | ScalarKind::I8 => ndim,
            ScalarKind::B1 => ndim.div_ceil(8),
        }
    }

    /// True for every kind except packed bits.
    #[inline]
    pub const fn is_continuous(self) -> bool {
        !matches!(self, ScalarKind::B1)
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::F64 => "f64",
            ScalarKind::F32 => "f32",
            ScalarKind::F16 => "f16",
            ScalarKind::BF16 => "bf16",
            ScalarKind::E5M2 => "e5m2",
            ScalarKind::I8 => "i8",
            ScalarKind::B1 => "b1",
        };
        f.write_str(name)
    }
}

/// Representation of a caller-supplied vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDtype {
    F64,
    F32,
    F16,
    BF16,
    I8,
    /// Packed bits (`u8` bytes).
    Bits,
}

/// A borrowed caller vector, before encoding.
#[derive(Debug, Clone, Copy)]
pub enum VectorInput<'a> {
    F64(&'a [f64]),
    F32(&'a [f32]),
    F16(&'a [f16]),
    BF16(&'a [bf16]),
    I8(&'a [i8]),
    /// Packed bits, `ceil(ndim / 8)` bytes.
    Bits(&'a [u8]),
}

impl VectorInput<'_> {
    /// The dtype tag of this input.
    pub fn dtype(&self) -> InputDtype {
        match self {
            VectorInput::F64(_) => InputDtype::F64,
            VectorInput::F32(_) => InputDtype::F32,
            VectorInput::F16(_) => InputDtype::F16,
            VectorInput::BF16(_) => InputDtype::BF16,
            VectorInput::I8(_) => InputDtype::I8,
            VectorInput::Bits(_) => InputDtype::Bits,
        }
    }

    /// Number of elements supplied (bytes for `Bits`).
    pub fn len(&self) -> usize {
        match self {
            VectorInput::F64(v) => v.len(),
            VectorInput::F32(v) => v.len(),
            VectorInput::F16(v) => v.len(),
            VectorInput::BF16(v) => v.len(),
            VectorInput::I8(v) => v.len(),
            VectorInput::Bits(v) => v.len(),
        }
    }

    /// True when no elements were supplied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value `i` as f64. Not meaningful for `Bits`.
    #[inline]
    fn value(&self, i: usize) -> f64 {
        match self {
            VectorInput::F64(v) => v[i],
            VectorInput::F32(v) => f64::from(v[i]),
            VectorInput::F16(v) => v[i].to_f64(),
            VectorInput::BF16(v) => v[i].to_f64(),
            VectorInput::I8(v) => f64::from(v[i]) / 127.0,
            VectorInput::Bits(v) => f64::from(v[i]),
        }
    }
}

impl<'a> From<&'a [f64]> for VectorInput<'a> {
    fn from(v: &'a [f64]) -> Self {
        VectorInput::F64(v)
    }
}

impl<'a> From<&'a [f32]> for VectorInput<'a> {
    fn from(v: &'a [f32]) -> Self {
        VectorInput::F32(v)
    }
}

impl<'a> From<&'a [f16]> for VectorInput<'a> {
    fn from(v: &'a [f16]) -> Self {
        VectorInput::F16(v)
    }
}

impl<'a> From<&'a [bf16]> for VectorInput<'a> {
    fn from(v: &'a [bf16]) -> Self {
        VectorInput::BF16(v)
    }
}

impl<'a> From<&'a [i8]> for VectorInput<'a> {
    fn from(v: &'a [i8]) -> Self {
        VectorInput::I8(v)
    }
}

impl<'a> From<&'a [u8]> for VectorInput<'a> {
    fn from(v: &'a [u8]) -> Self {
        VectorInput::Bits(v)
    }
}

impl<'a> From<&'a Vec<f32>> for VectorInput<'a> {
    fn from(v: &'a Vec<f32>) -> Self {
        VectorInput::F32(v)
    }
}

impl<'a> From<&'a Vec<f64>> for VectorInput<'a> {
    fn from(v: &'a Vec<f64>) -> Self {
        VectorInput::F64(v)
    }
}

impl<'a> From<&'a Vec<u8>> for VectorInput<'a> {
    fn from(v: &'a Vec<u8>) -> Self {
        VectorInput::Bits(v)
    }
}

impl<'a, const N: usize> From<&'a [f32; N]> for VectorInput<'a> {
    fn from(v: &'a [f32; N]) -> Self {
        VectorInput::F32(v)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for VectorInput<'a> {
    fn from(v: &'a [u8; N]) -> Self {
        VectorInput::Bits(v)
    }
}

/// Element types that can be handed over as whole rows.
///
/// Packed `u8` rows are bit vectors with eight dimensions per byte.
pub trait VectorElement: Copy + Send + Sync + 'static {
    /// Scalar kind rows of this type are stored as by default.
    const SCALAR: ScalarKind;

    /// Borrow a row as encoder input.
    fn input(row: &[Self]) -> VectorInput<'_>;

    /// Dimensions described by a row of `cols` elements.
    fn ndim(cols: usize) -> usize {
        cols
    }
}

macro_rules! vector_element {
    ($ty:ty, $scalar:expr, $variant:ident) => {
        impl VectorElement for $ty {
            const SCALAR: ScalarKind = $scalar;

            fn input(row: &[Self]) -> VectorInput<'_> {
                VectorInput::$variant(row)
            }
        }
    };
}

vector_element!(f64, ScalarKind::F64, F64);
vector_element!(f32, ScalarKind::F32, F32);
vector_element!(f16, ScalarKind::F16, F16);
vector_element!(bf16, ScalarKind::BF16, BF16);
vector_element!(i8, ScalarKind::I8, I8);

impl VectorElement for u8 {
    const SCALAR: ScalarKind = ScalarKind::B1;

    fn input(row: &[Self]) -> VectorInput<'_> {
        VectorInput::Bits(row)
    }

    fn ndim(cols: usize) -> usize {
        cols * 8
    }
}

/// Encode `input` as `kind` into `out` (cleared first).
///
/// # Errors
/// `DimensionMismatch` on a length mismatch, `InvalidConfiguration` when the
/// input representation cannot be stored as `kind`, `InvalidParameter` on a
/// non-finite component.
pub fn encode(kind: ScalarKind, ndim: usize, input: VectorInput<'_>, out: &mut Vec<u8>) -> Result<()> {
    out.clear();

    if kind == ScalarKind::B1 {
        let VectorInput::Bits(bytes) = input else {
            return Err(ShardexError::invalid_configuration(format!(
                "b1 shards take packed bits, got {:?} input",
                input.dtype()
            )));
        };
        let expected = kind.bytes_for(ndim);
        if bytes.len() != expected {
            return Err(ShardexError::dimension_mismatch(expected, bytes.len()));
        }
        out.extend_from_slice(bytes);
        let tail = ndim % 8;
        if tail != 0 {
            if let Some(last) = out.last_mut() {
                *last &= 0xFFu8 << (8 - tail);
            }
        }
        return Ok(());
    }

    if input.dtype() == InputDtype::Bits {
        return Err(ShardexError::invalid_configuration(format!(
            "{kind} shards cannot take packed bit input"
        )));
    }
    if input.len() != ndim {
        return Err(ShardexError::dimension_mismatch(ndim, input.len()));
    }

    out.reserve(kind.bytes_for(ndim));
    for i in 0..ndim {
        let x = input.value(i);
        if !x.is_finite() {
            return Err(ShardexError::invalid_parameter(format!(
                "non-finite component at index {i}"
            )));
        }
        match kind {
            ScalarKind::F64 => out.extend_from_slice(&x.to_le_bytes()),
            ScalarKind::F32 => out.extend_from_slice(&(saturate(x, f64::from(f32::MAX)) as f32).to_le_bytes()),
            ScalarKind::F16 => out.extend_from_slice(&f16::from_f64(saturate(x, f16::MAX.to_f64())).to_le_bytes()),
            ScalarKind::BF16 => out.extend_from_slice(&bf16::from_f64(saturate(x, bf16::MAX.to_f64())).to_le_bytes()),
            ScalarKind::E5M2 => out.push(e5m2_from_f64(saturate(x, E5M2_MAX))),
            ScalarKind::I8 => {
                let q = match input {
                    VectorInput::I8(v) => v[i],
                    _ => (x * 127.0).round().clamp(-127.0, 127.0) as i8,
                };
                out.push(q as u8);
            }
            ScalarKind::B1 => unreachable!("handled above"),
        }
    }
    Ok(())
}

/// Decode a stored vector into f32 values, one per dimension.
///
/// Packed bits decode to `0.0` / `1.0`.
pub fn decode_f32(kind: ScalarKind, ndim: usize, bytes: &[u8]) -> Vec<f32> {
    match kind {
        ScalarKind::F64 => decoded::<F64>(bytes).map(|x| x as f32).collect(),
        ScalarKind::F32 => decoded::<F32>(bytes).map(|x| x as f32).collect(),
        ScalarKind::F16 => decoded::<F16>(bytes).map(|x| x as f32).collect(),
        ScalarKind::BF16 => decoded::<BF16>(bytes).map(|x| x as f32).collect(),
        ScalarKind::E5M2 => decoded::<E5M2>(bytes).map(|x| x as f32).collect(),
        ScalarKind::I8 => decoded::<I8>(bytes).map(|x| x as f32).collect(),
        ScalarKind::B1 => (0..ndim)
            .map(|i| {
                let bit = bytes[i / 8] & (0x80 >> (i % 8));
                if bit != 0 {
                    1.0
                } else {
                    0.0
                }
            })
            .collect(),
    }
}

/// Largest finite E5M2 value, `0x7B`.
const E5M2_MAX: f64 = 57344.0;

#[inline]
fn saturate(x: f64, max: f64) -> f64 {
    x.clamp(-max, max)
}

fn e5m2_from_f64(x: f64) -> u8 {
    let bits = f16::from_f64(x).to_bits();
    let upper = bits >> 8;
    let lower = bits & 0xFF;
    let exponent_all_ones = (bits & 0x7C00) == 0x7C00;
    if exponent_all_ones {
        return upper as u8;
    }
    let round_up = lower > 0x80 || (lower == 0x80 && upper & 1 == 1);
    (if round_up { upper + 1 } else { upper }) as u8
}

/// Fixed-width element decoder used by the distance kernels.
pub(crate) trait Element {
    const SIZE: usize;
    fn decode(bytes: &[u8]) -> f64;
}

pub(crate) struct F64;
pub(crate) struct F32;
pub(crate) struct F16;
pub(crate) struct BF16;
pub(crate) struct E5M2;
pub(crate) struct I8;

impl Element for F64 {
    const SIZE: usize = 8;
    #[inline(always)]
    fn decode(b: &[u8]) -> f64 {
        f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}

impl Element for F32 {
    const SIZE: usize = 4;
    #[inline(always)]
    fn decode(b: &[u8]) -> f64 {
        f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl Element for F16 {
    const SIZE: usize = 2;
    #[inline(always)]
    fn decode(b: &[u8]) -> f64 {
        f16::from_le_bytes([b[0], b[1]]).to_f64()
    }
}

impl Element for BF16 {
    const SIZE: usize = 2;
    #[inline(always)]
    fn decode(b: &[u8]) -> f64 {
        bf16::from_le_bytes([b[0], b[1]]).to_f64()
    }
}

impl Element for E5M2 {
    const SIZE: usize = 1;
    #[inline(always)]
    fn decode(b: &[u8]) -> f64 {
        f16::from_bits(u16::from(b[0]) << 8).to_f64()
    }
}

impl Element for I8 {
    const SIZE: usize = 1;
    #[inline(always)]
    fn decode(b: &[u8]) -> f64 {
        f64::from(b[0] as i8) / 127.0
    }
}

/// Iterate the decoded values of an encoded vector.
#[inline(always)]
pub(crate) fn decoded<'a, E: Element + 'a>(bytes: &'a [u8]) -> impl Iterator<Item = f64> + 'a {
    bytes.chunks_exact(E::SIZE).map(E::decode)
}
