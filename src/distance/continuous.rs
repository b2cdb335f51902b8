//! Distance kernels over decoded numeric components.
//!
//! Every kernel decodes both vectors with the same [`Element`] codec and
//! accumulates in `f64`, so results are identical on every platform. Results
//! are clamped to be non-negative; degenerate inputs (zero norm, zero
//! variance) are handled explicitly rather than producing NaN.

use crate::scalar::{decoded, Element};

/// Squared Euclidean distance: sum((a[i] - b[i])^2)
#[inline]
pub(crate) fn l2sq<E: Element>(a: &[u8], b: &[u8]) -> f64 {
    decoded::<E>(a)
        .zip(decoded::<E>(b))
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Cosine distance: 1 - dot(a, b) / (||a|| * ||b||)
///
/// Two zero vectors are at distance 0; a zero vector and a non-zero one at 1.
#[inline]
pub(crate) fn cos<E: Element>(a: &[u8], b: &[u8]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in decoded::<E>(a).zip(decoded::<E>(b)) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    match (norm_a == 0.0, norm_b == 0.0) {
        (true, true) => 0.0,
        (true, false) | (false, true) => 1.0,
        (false, false) => (1.0 - dot / (norm_a * norm_b).sqrt()).max(0.0),
    }
}

/// Correlation distance: 1 - pearson(a, b)
///
/// Constant vectors have no defined correlation: two constant vectors are at
/// distance 0, a constant and a varying one at 1.
#[inline]
pub(crate) fn pearson<E: Element>(a: &[u8], b: &[u8]) -> f64 {
    let mut n = 0.0f64;
    let mut sum_a = 0.0f64;
    let mut sum_b = 0.0f64;
    for (x, y) in decoded::<E>(a).zip(decoded::<E>(b)) {
        n += 1.0;
        sum_a += x;
        sum_b += y;
    }
    if n == 0.0 {
        return 0.0;
    }
    let mean_a = sum_a / n;
    let mean_b = sum_b / n;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for (x, y) in decoded::<E>(a).zip(decoded::<E>(b)) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    match (var_a == 0.0, var_b == 0.0) {
        (true, true) => 0.0,
        (true, false) | (false, true) => 1.0,
        (false, false) => (1.0 - cov / (var_a * var_b).sqrt()).max(0.0),
    }
}

/// Jensen-Shannon divergence.
///
/// Negative components are treated as zero mass.
#[inline]
pub(crate) fn divergence<E: Element>(a: &[u8], b: &[u8]) -> f64 {
    let mut sum = 0.0f64;
    for (x, y) in decoded::<E>(a).zip(decoded::<E>(b)) {
        let p = x.max(0.0);
        let q = y.max(0.0);
        let m = (p + q) * 0.5;
        if m == 0.0 {
            continue;
        }
        if p > 0.0 {
            sum += p * (p / m).ln();
        }
        if q > 0.0 {
            sum += q * (q / m).ln();
        }
    }
    (sum * 0.5).max(0.0)
}

/// Squared Euclidean distance over plain `f32` slices.
///
/// Used by clustering, which works on decoded matrices rather than stored bytes.
///
/// # Panics
/// Panics if the vectors have different dimensions.
#[inline]
pub fn l2sq_f32(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::F32;

    fn bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_l2sq_simple() {
        let a = bytes(&[0.0, 0.0]);
        let b = bytes(&[3.0, 4.0]);
        assert!((l2sq::<F32>(&a, &b) - 25.0).abs() < 1e-12);
        assert_eq!(l2sq::<F32>(&a, &a), 0.0);
    }

    #[test]
    fn test_cos_orthogonal_and_identical() {
        let a = bytes(&[1.0, 0.0]);
        let b = bytes(&[0.0, 1.0]);
        assert!((cos::<F32>(&a, &b) - 1.0).abs() < 1e-12);
        assert!(cos::<F32>(&a, &a) < 1e-12);
    }

    #[test]
    fn test_cos_zero_vectors() {
        let zero = bytes(&[0.0, 0.0]);
        let one = bytes(&[1.0, 0.0]);
        assert_eq!(cos::<F32>(&zero, &zero), 0.0);
        assert_eq!(cos::<F32>(&zero, &one), 1.0);
    }

    #[test]
    fn test_pearson() {
        let a = bytes(&[1.0, 2.0, 3.0]);
        let b = bytes(&[2.0, 4.0, 6.0]);
        let c = bytes(&[3.0, 2.0, 1.0]);
        assert!(pearson::<F32>(&a, &b) < 1e-12);
        assert!((pearson::<F32>(&a, &c) - 2.0).abs() < 1e-12);

        let flat = bytes(&[1.0, 1.0, 1.0]);
        assert_eq!(pearson::<F32>(&flat, &flat), 0.0);
        assert_eq!(pearson::<F32>(&flat, &a), 1.0);
    }

    #[test]
    fn test_divergence() {
        let p = bytes(&[0.5, 0.5, 0.0]);
        let q = bytes(&[0.0, 0.5, 0.5]);
        assert_eq!(divergence::<F32>(&p, &p), 0.0);
        // Half the mass is disjoint: JS = 0.5 * ln 2.
        let expected = 0.5 * std::f64::consts::LN_2;
        assert!((divergence::<F32>(&p, &q) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_l2sq_f32() {
        assert!((l2sq_f32(&[0.0, 0.0], &[3.0, 4.0]) - 25.0).abs() < 1e-6);
    }
}
