//! Distance semantics observed through shards and the free `distance` function.
//!
//! Run with: cargo test --test distances

use half::f16;
use proptest::prelude::*;
use shardex::{
    distance, random_bits, random_vectors, Key, KeyKind, MetricKind, ScalarKind, Shard, ShardConfig,
    ShardexError, VectorInput,
};
use tempfile::tempdir;

const NPHD_NDIM: usize = 264;

fn nphd_vector(length: u8, data: &[u8]) -> [u8; 33] {
    let mut vector = [0u8; 33];
    vector[0] = length;
    vector[1..1 + data.len()].copy_from_slice(data);
    vector
}

fn nphd_shard() -> Shard {
    Shard::new(ShardConfig::new(NPHD_NDIM, MetricKind::Nphd, ScalarKind::B1, KeyKind::U64)).unwrap()
}

fn nphd_pair(a: [u8; 33], b: [u8; 33]) -> f64 {
    let shard = nphd_shard();
    shard.add(0u64, &a).unwrap();
    shard.add(1u64, &b).unwrap();
    shard.pairwise_distance(0u64, 1u64).unwrap()
}

/// Owned copies of one f32 row in every input representation.
enum Row {
    F32(Vec<f32>),
    F64(Vec<f64>),
    F16(Vec<f16>),
    I8(Vec<i8>),
}

impl Row {
    fn convert(row: &[f32], dtype: &str) -> Self {
        match dtype {
            "f32" => Row::F32(row.to_vec()),
            "f64" => Row::F64(row.iter().map(|&x| f64::from(x)).collect()),
            "f16" => Row::F16(row.iter().map(|&x| f16::from_f32(x)).collect()),
            _ => Row::I8(row.iter().map(|&x| (x * 127.0).round() as i8).collect()),
        }
    }

    fn input(&self) -> VectorInput<'_> {
        match self {
            Row::F32(v) => VectorInput::F32(v),
            Row::F64(v) => VectorInput::F64(v),
            Row::F16(v) => VectorInput::F16(v),
            Row::I8(v) => VectorInput::I8(v),
        }
    }
}

#[test]
fn test_distances_continuous() {
    let ndim = 1024;
    let vectors = random_vectors(2, ndim, 17);
    let metrics = [MetricKind::Cos, MetricKind::L2sq, MetricKind::Divergence, MetricKind::Pearson];
    let scalars = [
        ScalarKind::F64,
        ScalarKind::F32,
        ScalarKind::F16,
        ScalarKind::BF16,
        ScalarKind::E5M2,
        ScalarKind::I8,
    ];

    let mut checked = 0;
    for metric in metrics {
        for scalar in scalars {
            for dtype in ["f32", "f64", "f16", "i8"] {
                let Ok(shard) = Shard::new(ShardConfig::new(ndim, metric, scalar, KeyKind::U64)) else {
                    continue;
                };
                let first = Row::convert(vectors.row(0), dtype);
                let second = Row::convert(vectors.row(1), dtype);
                match shard.add(0u64, first.input()) {
                    Ok(()) => {}
                    Err(ShardexError::InvalidConfiguration(_)) => continue,
                    Err(e) => panic!("{metric}/{scalar}/{dtype}: {e}"),
                }
                shard.add(1u64, second.input()).unwrap();

                let itself_first = shard.pairwise_distance(0u64, 0u64).unwrap();
                let itself_second = shard.pairwise_distance(1u64, 1u64).unwrap();
                let different = shard.pairwise_distance(0u64, 1u64).unwrap();
                assert!(itself_first.abs() < 1e-2, "{metric}/{scalar}/{dtype}: {itself_first}");
                assert!(itself_second.abs() < 1e-2, "{metric}/{scalar}/{dtype}: {itself_second}");
                assert!(different > 1e-6, "{metric}/{scalar}/{dtype}: {different}");
                checked += 1;
            }
        }
    }
    // Divergence accepts neither i8 storage nor i8 input.
    assert_eq!(checked, 4 * 6 * 4 - 4 - 5);
}

#[test]
fn test_out_of_range_components_saturate() {
    let cases: [(ScalarKind, f64); 4] = [
        (ScalarKind::F16, 70_000.0),
        (ScalarKind::E5M2, 70_000.0),
        (ScalarKind::BF16, 1e39),
        (ScalarKind::F32, 1e39),
    ];
    for (scalar, big) in cases {
        let shard = Shard::new(ShardConfig::new(2, MetricKind::L2sq, scalar, KeyKind::U64)).unwrap();
        shard.add(1u64, VectorInput::F64(&[big, 0.0])).unwrap();
        shard.add(2u64, VectorInput::F64(&[0.0, 1.0])).unwrap();

        assert_eq!(shard.pairwise_distance(1u64, 1u64).unwrap(), 0.0, "{scalar}");
        let apart = shard.pairwise_distance(1u64, 2u64).unwrap();
        assert!(apart.is_finite() && apart > 0.0, "{scalar}: {apart}");

        let stored = shard.get(1u64).unwrap().unwrap();
        assert!(stored.iter().all(|x| x.is_finite()), "{scalar}: {stored:?}");

        let matches = shard.search(VectorInput::F64(&[big, 0.0]), 2).unwrap();
        assert_eq!(matches.keys(), vec![Key::U64(1), Key::U64(2)], "{scalar}");
        assert!(matches.distances().iter().all(|d| d.is_finite()), "{scalar}");

        let cos = Shard::new(ShardConfig::new(2, MetricKind::Cos, scalar, KeyKind::U64)).unwrap();
        cos.add(1u64, VectorInput::F64(&[big, 0.0])).unwrap();
        cos.add(2u64, VectorInput::F64(&[0.0, 1.0])).unwrap();
        assert_eq!(cos.pairwise_distance(1u64, 2u64).unwrap(), 1.0, "{scalar}");
        assert!(cos.pairwise_distance(1u64, 1u64).unwrap() < 1e-12, "{scalar}");
    }
}

#[test]
fn test_non_finite_components_rejected() {
    let shard = Shard::new(ShardConfig::new(2, MetricKind::L2sq, ScalarKind::F16, KeyKind::U64)).unwrap();
    for bad in [f64::INFINITY, f64::NAN] {
        let err = shard.add(1u64, VectorInput::F64(&[bad, 0.0])).unwrap_err();
        assert!(matches!(err, ShardexError::InvalidParameter(_)));
    }
    assert!(shard.is_empty());
}

#[test]
fn test_distances_sparse() {
    let ndim = 1024;
    let vectors = random_bits(2, ndim, 5);
    for metric in [MetricKind::Hamming, MetricKind::Tanimoto, MetricKind::Sorensen] {
        let shard = Shard::new(ShardConfig::new(ndim, metric, ScalarKind::B1, KeyKind::U64)).unwrap();
        shard.add(0u64, vectors.row(0)).unwrap();
        shard.add(1u64, vectors.row(1)).unwrap();

        assert_eq!(shard.pairwise_distance(0u64, 0u64).unwrap(), 0.0, "{metric}");
        assert_eq!(shard.pairwise_distance(1u64, 1u64).unwrap(), 0.0, "{metric}");
        assert!(shard.pairwise_distance(0u64, 1u64).unwrap() > 0.0, "{metric}");
    }
}

#[test]
fn test_unsupported_pairs_rejected() {
    for metric in [MetricKind::Hamming, MetricKind::Nphd] {
        let err = Shard::new(ShardConfig::new(64, metric, ScalarKind::F32, KeyKind::U64)).unwrap_err();
        assert!(matches!(err, ShardexError::InvalidConfiguration(_)));
    }
    let err = Shard::new(ShardConfig::new(64, MetricKind::Cos, ScalarKind::B1, KeyKind::U64)).unwrap_err();
    assert!(matches!(err, ShardexError::InvalidConfiguration(_)));
    let err = Shard::new(ShardConfig::new(64, MetricKind::Divergence, ScalarKind::I8, KeyKind::U64)).unwrap_err();
    assert!(matches!(err, ShardexError::InvalidConfiguration(_)));
}

#[test]
fn test_nphd_identical_vectors() {
    let v = nphd_vector(4, &[0xAA, 0xBB, 0xCC, 0xDD]);
    assert_eq!(nphd_pair(v, v), 0.0);
}

#[test]
fn test_nphd_maximally_different() {
    let a = nphd_vector(4, &[0x00; 4]);
    let b = nphd_vector(4, &[0xFF; 4]);
    assert_eq!(nphd_pair(a, b), 1.0);
}

#[test]
fn test_nphd_known_values() {
    // 0xCC ^ 0xCF = 0x03: two differing bits over 16.
    let a = nphd_vector(2, &[0xAA, 0xCC]);
    let b = nphd_vector(2, &[0xAA, 0xCF]);
    assert_eq!(nphd_pair(a, b), 0.125);
}

#[test]
fn test_nphd_zero_length_prefix() {
    let a = nphd_vector(0, &[]);
    let b = nphd_vector(4, &[0xFF; 4]);
    assert_eq!(nphd_pair(a, b), 0.0);
}

#[test]
fn test_nphd_prefix_compatibility() {
    let a = nphd_vector(2, &[0xFF, 0xFF]);
    let b = nphd_vector(4, &[0xFF, 0xFF, 0x00, 0x00]);
    assert_eq!(nphd_pair(a, b), 0.0);
}

#[test]
fn test_nphd_length_byte_excluded() {
    let shard = nphd_shard();
    shard.add(0u64, &nphd_vector(1, &[0xAA])).unwrap();
    shard.add(1u64, &nphd_vector(1, &[0xAA])).unwrap();
    shard.add(2u64, &nphd_vector(1, &[0x55])).unwrap();
    assert_eq!(shard.pairwise_distance(0u64, 1u64).unwrap(), 0.0);
    assert_eq!(shard.pairwise_distance(0u64, 2u64).unwrap(), 1.0);

    // Padding past the prefix never participates.
    let mut noisy = nphd_vector(1, &[0xAA]);
    noisy[20] = 0xFF;
    let d = distance(MetricKind::Nphd, ScalarKind::B1, &nphd_vector(1, &[0xAA]), &noisy, NPHD_NDIM).unwrap();
    assert_eq!(d, 0.0);
}

#[test]
fn test_nphd_index_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nphd.shx");

    let shard = nphd_shard();
    shard.add(0u64, &nphd_vector(4, &[0xAA, 0xBB, 0xCC, 0xDD])).unwrap();
    shard.add(1u64, &nphd_vector(4, &[0xAA, 0xBB, 0xCC, 0x00])).unwrap();
    let before = shard.pairwise_distance(0u64, 1u64).unwrap();
    shard.save(&path).unwrap();

    let loaded = Shard::restore(&path).unwrap();
    assert_eq!(loaded.metric_kind(), MetricKind::Nphd);
    assert_eq!(loaded.metric_kind().to_string(), "nphd");
    assert_eq!(loaded.pairwise_distance(0u64, 1u64).unwrap(), before);
}

#[test]
fn test_nphd_search() {
    let shard = nphd_shard();
    let target = nphd_vector(4, &[0xAA, 0xBB, 0xCC, 0xDD]);
    let close = nphd_vector(4, &[0xAA, 0xBB, 0xCC, 0xDE]);
    let far = nphd_vector(4, &[0x55, 0x44, 0x33, 0x22]);
    shard.add(0u64, &target).unwrap();
    shard.add(1u64, &close).unwrap();
    shard.add(2u64, &far).unwrap();

    let matches = shard.search(&target, 3).unwrap();
    assert_eq!(matches.keys(), vec![Key::U64(0), Key::U64(1), Key::U64(2)]);
    let distances = matches.distances();
    assert_eq!(distances[0], 0.0);
    assert_eq!(distances[1], 2.0 / 32.0);
    assert!(distances[1] < distances[2]);
}

proptest! {
    #[test]
    fn prop_self_distance_is_zero(values in prop::collection::vec(-1000.0f32..1000.0, 1..64)) {
        let ndim = values.len();
        for metric in [MetricKind::L2sq, MetricKind::Cos, MetricKind::Pearson, MetricKind::Divergence] {
            let d = distance(metric, ScalarKind::F32, &values[..], &values[..], ndim).unwrap();
            prop_assert!(d.abs() < 1e-9, "{} gave {}", metric, d);
        }
    }

    #[test]
    fn prop_binary_metrics_symmetric(
        a in prop::collection::vec(any::<u8>(), 16),
        b in prop::collection::vec(any::<u8>(), 16),
    ) {
        for metric in [MetricKind::Hamming, MetricKind::Tanimoto, MetricKind::Sorensen, MetricKind::Nphd] {
            let ab = distance(metric, ScalarKind::B1, &a[..], &b[..], 128).unwrap();
            let ba = distance(metric, ScalarKind::B1, &b[..], &a[..], 128).unwrap();
            prop_assert_eq!(ab, ba);
            prop_assert!(ab >= 0.0);
        }
    }

    #[test]
    fn prop_l2sq_matches_plain_sum(
        pair in (1usize..32).prop_flat_map(|n| (
            prop::collection::vec(-10.0f32..10.0, n),
            prop::collection::vec(-10.0f32..10.0, n),
        ))
    ) {
        let (a, b) = pair;
        let expected: f64 = a.iter().zip(&b).map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        }).sum();
        let d = distance(MetricKind::L2sq, ScalarKind::F32, &a[..], &b[..], a.len()).unwrap();
        prop_assert!((d - expected).abs() < 1e-9);
    }
}
