//! Distance kernels over packed bit vectors.

/// Number of differing bits.
#[inline]
pub(crate) fn hamming(a: &[u8], b: &[u8]) -> f64 {
    let differing: u32 = a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum();
    f64::from(differing)
}

/// Jaccard distance over set bits: 1 - |a & b| / |a | b|.
///
/// Two empty sets are identical.
#[inline]
pub(crate) fn tanimoto(a: &[u8], b: &[u8]) -> f64 {
    let mut intersection = 0u32;
    let mut union = 0u32;
    for (x, y) in a.iter().zip(b) {
        intersection += (x & y).count_ones();
        union += (x | y).count_ones();
    }
    if union == 0 {
        return 0.0;
    }
    1.0 - f64::from(intersection) / f64::from(union)
}

/// Dice distance over set bits: 1 - 2|a & b| / (|a| + |b|).
///
/// Two empty sets are identical.
#[inline]
pub(crate) fn sorensen(a: &[u8], b: &[u8]) -> f64 {
    let mut intersection = 0u32;
    let mut total = 0u32;
    for (x, y) in a.iter().zip(b) {
        intersection += (x & y).count_ones();
        total += x.count_ones() + y.count_ones();
    }
    if total == 0 {
        return 0.0;
    }
    1.0 - 2.0 * f64::from(intersection) / f64::from(total)
}

/// Normalized prefix Hamming distance.
///
/// Byte 0 of each vector is a length prefix `L` counting the meaningful data
/// bytes that follow it. Only the first `min(L_a, L_b)` data bytes are
/// compared and the distance is normalized by their bit count. The prefix
/// byte itself never takes part in the comparison. Prefixes larger than the
/// bytes actually present are clamped to them. A common length of zero yields
/// zero.
#[inline]
pub(crate) fn nphd(a: &[u8], b: &[u8]) -> f64 {
    let (Some((&len_a, data_a)), Some((&len_b, data_b))) = (a.split_first(), b.split_first()) else {
        return 0.0;
    };

    let common = usize::from(len_a)
        .min(usize::from(len_b))
        .min(data_a.len())
        .min(data_b.len());
    if common == 0 {
        return 0.0;
    }

    let differing: u32 = data_a[..common]
        .iter()
        .zip(&data_b[..common])
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    f64::from(differing) / (8.0 * common as f64)
}
