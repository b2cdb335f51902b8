//! Distance metrics over encoded vectors.
//!
//! A [`Metric`] is resolved once per shard from its `(MetricKind, ScalarKind)`
//! pair into a plain function pointer. Unsupported pairs are rejected at
//! construction with `InvalidConfiguration`, so the hot path never branches on
//! the metric or scalar kind.
//!
//! | metric | scalar kinds |
//! |---|---|
//! | `Cos`, `L2sq`, `Pearson` | `F64`, `F32`, `F16`, `BF16`, `E5M2`, `I8` |
//! | `Divergence` | `F64`, `F32`, `F16`, `BF16`, `E5M2` |
//! | `Hamming`, `Tanimoto`, `Sorensen`, `Nphd` | `B1` |

mod binary;
mod continuous;

pub use continuous::l2sq_f32;

use crate::error::{Result, ShardexError};
use crate::scalar::{self, InputDtype, ScalarKind, VectorInput, BF16, E5M2, F16, F32, F64, I8};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported dissimilarity functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Cosine distance: 1 - cos(a, b).
    Cos,
    /// Squared Euclidean distance.
    L2sq,
    /// Jensen-Shannon divergence.
    Divergence,
    /// Correlation distance: 1 - pearson(a, b).
    Pearson,
    /// Number of differing bits.
    Hamming,
    /// Jaccard distance over set bits.
    Tanimoto,
    /// Dice distance over set bits.
    Sorensen,
    /// Normalized prefix Hamming distance over length-prefixed bit vectors.
    Nphd,
}

impl MetricKind {
    /// Every metric kind, in declaration order.
    pub const ALL: [MetricKind; 8] = [
        MetricKind::Cos,
        MetricKind::L2sq,
        MetricKind::Divergence,
        MetricKind::Pearson,
        MetricKind::Hamming,
        MetricKind::Tanimoto,
        MetricKind::Sorensen,
        MetricKind::Nphd,
    ];

    /// True for metrics over packed bits.
    #[inline]
    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            MetricKind::Hamming | MetricKind::Tanimoto | MetricKind::Sorensen | MetricKind::Nphd
        )
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Cos => "cos",
            MetricKind::L2sq => "l2sq",
            MetricKind::Divergence => "divergence",
            MetricKind::Pearson => "pearson",
            MetricKind::Hamming => "hamming",
            MetricKind::Tanimoto => "tanimoto",
            MetricKind::Sorensen => "sorensen",
            MetricKind::Nphd => "nphd",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MetricKind {
    type Err = ShardexError;

    fn from_str(s: &str) -> Result<Self> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| ShardexError::invalid_parameter(format!("unknown metric '{s}'")))
    }
}

type Kernel = fn(&[u8], &[u8]) -> f64;

fn resolve(kind: MetricKind, scalar: ScalarKind) -> Option<Kernel> {
    macro_rules! continuous {
        ($kernel:ident) => {
            match scalar {
                ScalarKind::F64 => Some(continuous::$kernel::<F64> as Kernel),
                ScalarKind::F32 => Some(continuous::$kernel::<F32> as Kernel),
                ScalarKind::F16 => Some(continuous::$kernel::<F16> as Kernel),
                ScalarKind::BF16 => Some(continuous::$kernel::<BF16> as Kernel),
                ScalarKind::E5M2 => Some(continuous::$kernel::<E5M2> as Kernel),
                ScalarKind::I8 => Some(continuous::$kernel::<I8> as Kernel),
                ScalarKind::B1 => None,
            }
        };
    }

    match (kind, scalar) {
        (MetricKind::Cos, _) => continuous!(cos),
        (MetricKind::L2sq, _) => continuous!(l2sq),
        (MetricKind::Pearson, _) => continuous!(pearson),
        (MetricKind::Divergence, ScalarKind::I8) => None,
        (MetricKind::Divergence, _) => continuous!(divergence),
        (MetricKind::Hamming, ScalarKind::B1) => Some(binary::hamming as Kernel),
        (MetricKind::Tanimoto, ScalarKind::B1) => Some(binary::tanimoto as Kernel),
        (MetricKind::Sorensen, ScalarKind::B1) => Some(binary::sorensen as Kernel),
        (MetricKind::Nphd, ScalarKind::B1) => Some(binary::nphd as Kernel),
        _ => None,
    }
}

/// A validated metric bound to one scalar kind and dimensionality.
#[derive(Clone, Copy)]
pub struct Metric {
    kind: MetricKind,
    scalar: ScalarKind,
    ndim: usize,
    kernel: Kernel,
}

impl Metric {
    /// Resolve the kernel for `(kind, scalar)`.
    ///
    /// # Errors
    /// `InvalidConfiguration` if the pair is unsupported or `ndim` is zero.
    pub fn new(kind: MetricKind, scalar: ScalarKind, ndim: usize) -> Result<Self> {
        if ndim == 0 {
            return Err(ShardexError::invalid_configuration("ndim must be positive"));
        }
        let kernel = resolve(kind, scalar).ok_or_else(|| {
            ShardexError::invalid_configuration(format!(
                "metric {kind} is not supported for {scalar} vectors"
            ))
        })?;
        Ok(Self {
            kind,
            scalar,
            ndim,
            kernel,
        })
    }

    #[inline]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    #[inline]
    pub fn scalar(&self) -> ScalarKind {
        self.scalar
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Encoded bytes per vector.
    #[inline]
    pub fn stride(&self) -> usize {
        self.scalar.bytes_for(self.ndim)
    }

    /// Distance between two encoded vectors of `stride()` bytes each.
    #[inline]
    pub fn distance(&self, a: &[u8], b: &[u8]) -> f64 {
        (self.kernel)(a, b)
    }

    /// Check that caller input of `dtype` can be stored for this metric.
    ///
    /// # Errors
    /// `InvalidConfiguration` for packed bits into a continuous metric,
    /// anything else into a binary one, and `I8` input into `Divergence`.
    pub fn validate_input(&self, dtype: InputDtype) -> Result<()> {
        let rejected = match dtype {
            InputDtype::Bits => self.scalar.is_continuous(),
            InputDtype::I8 => !self.scalar.is_continuous() || self.kind == MetricKind::Divergence,
            _ => !self.scalar.is_continuous(),
        };
        if rejected {
            return Err(ShardexError::invalid_configuration(format!(
                "{dtype:?} input cannot be used with {} over {} vectors",
                self.kind, self.scalar
            )));
        }
        Ok(())
    }

    /// Validate and encode caller input into `out`.
    pub fn encode(&self, input: VectorInput<'_>, out: &mut Vec<u8>) -> Result<()> {
        self.validate_input(input.dtype())?;
        scalar::encode(self.scalar, self.ndim, input, out)
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("kind", &self.kind)
            .field("scalar", &self.scalar)
            .field("ndim", &self.ndim)
            .finish()
    }
}

/// Distance between two caller vectors under `(metric, scalar)`.
///
/// Both vectors are encoded as `scalar` first, so the result is exactly what a
/// shard of that configuration would report.
///
/// # Example
///
/// ```
/// use shardex::{distance, MetricKind, ScalarKind};
///
/// let a = [2u8, 0xAA, 0xCC];
/// let b = [2u8, 0xAA, 0xCF];
/// let d = distance(MetricKind::Nphd, ScalarKind::B1, &a, &b, 24).unwrap();
/// assert_eq!(d, 0.125);
/// ```
pub fn distance<'a, 'b>(
    metric: MetricKind,
    scalar: ScalarKind,
    a: impl Into<VectorInput<'a>>,
    b: impl Into<VectorInput<'b>>,
    ndim: usize,
) -> Result<f64> {
    let metric = Metric::new(metric, scalar, ndim)?;
    let mut encoded_a = Vec::with_capacity(metric.stride());
    let mut encoded_b = Vec::with_capacity(metric.stride());
    metric.encode(a.into(), &mut encoded_a)?;
    metric.encode(b.into(), &mut encoded_b)?;
    Ok(metric.distance(&encoded_a, &encoded_b))
}
