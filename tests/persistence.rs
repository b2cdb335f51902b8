//! Save, restore and view behavior of shard files.
//!
//! Run with: cargo test --test persistence

use shardex::persistence::FileHeader;
use shardex::{
    random_vectors, Key, KeyKind, MetricKind, ScalarKind, Shard, ShardConfig, ShardexError,
};
use std::path::Path;
use tempfile::tempdir;

const NDIM: usize = 16;

fn build(count: usize, key_kind: KeyKind) -> Shard {
    let config = ShardConfig::new(NDIM, MetricKind::L2sq, ScalarKind::F32, key_kind).with_seed(5);
    let shard = Shard::new(config).unwrap();
    let vectors = random_vectors(count, NDIM, 21);
    for (i, row) in vectors.iter_rows().enumerate() {
        let key = match key_kind {
            KeyKind::U64 => Key::U64(i as u64 * 10),
            KeyKind::Uuid => Key::Uuid((i as u128) << 64 | 0xABCD),
        };
        shard.add(key, row).unwrap();
    }
    shard
}

/// Absolute offset of the graph section.
fn graph_offset(path: &Path) -> usize {
    let bytes = std::fs::read(path).unwrap();
    let header = FileHeader::from_bytes(&bytes[..FileHeader::SIZE]).unwrap();
    let meta = Shard::metadata(path).unwrap();
    header.data_start() + meta.sections.graph.offset as usize
}

#[test]
fn test_roundtrip_preserves_kinds_and_distances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shard.shx");
    let shard = build(200, KeyKind::U64);
    shard.save(&path).unwrap();

    let restored = Shard::restore(&path).unwrap();
    assert_eq!(restored.len(), 200);
    assert_eq!(restored.ndim(), NDIM);
    assert_eq!(restored.metric_kind(), MetricKind::L2sq);
    assert_eq!(restored.scalar_kind(), ScalarKind::F32);
    assert_eq!(restored.key_kind(), KeyKind::U64);
    for (a, b) in [(0u64, 10u64), (50, 1990), (700, 700)] {
        assert_eq!(
            restored.pairwise_distance(a, b).unwrap(),
            shard.pairwise_distance(a, b).unwrap()
        );
    }

    let query = random_vectors(1, NDIM, 99);
    let before = shard.search(query.row(0), 10).unwrap();
    let after = restored.search(query.row(0), 10).unwrap();
    assert_eq!(before.to_list(), after.to_list());
}

#[test]
fn test_uuid_keys_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("uuid.shx");
    let shard = build(40, KeyKind::Uuid);
    shard.save(&path).unwrap();

    for reopened in [Shard::restore(&path).unwrap(), Shard::view(&path).unwrap()] {
        assert_eq!(reopened.key_kind(), KeyKind::Uuid);
        let key = Key::Uuid(7u128 << 64 | 0xABCD);
        assert!(reopened.contains(key).unwrap());
        assert_eq!(reopened.get(key).unwrap(), shard.get(key).unwrap());
        assert!(matches!(
            reopened.contains(7u64),
            Err(ShardexError::KeyKindMismatch { .. })
        ));
    }
}

#[test]
fn test_removed_entries_stay_removed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("removed.shx");
    let shard = build(50, KeyKind::U64);
    assert!(shard.remove(30u64).unwrap());
    assert!(shard.remove(40u64).unwrap());
    shard.save(&path).unwrap();

    let meta = Shard::metadata(&path).unwrap();
    assert_eq!(meta.count, 50);
    assert_eq!(meta.live, 48);

    let restored = Shard::restore(&path).unwrap();
    assert_eq!(restored.len(), 48);
    assert!(!restored.contains(30u64).unwrap());
    let vector = shard.get(20u64).unwrap().unwrap();
    let keys = restored.search(&vector, 48).unwrap().keys();
    assert!(!keys.contains(&Key::U64(30)));
    assert!(!keys.contains(&Key::U64(40)));

    // Restored shards accept further writes.
    restored.add(30u64, &vector).unwrap();
    assert_eq!(restored.len(), 49);
}

#[test]
fn test_view_builds_key_index_lazily() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lazy.shx");
    build(100, KeyKind::U64).save(&path).unwrap();

    let view = Shard::view(&path).unwrap();
    assert!(!view.key_index_built());
    assert_eq!(view.len(), 100);

    let query = random_vectors(1, NDIM, 3);
    assert_eq!(view.search(query.row(0), 5).unwrap().len(), 5);
    assert!(!view.key_index_built());

    assert!(view.contains(990u64).unwrap());
    assert!(view.key_index_built());
    assert!(!view.contains(991u64).unwrap());
}

#[test]
fn test_view_without_lookups() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nolookup.shx");
    build(20, KeyKind::U64).save(&path).unwrap();

    let meta = Shard::metadata(&path).unwrap();
    assert_eq!(meta.key_kind, KeyKind::U64);
    let view = Shard::view_with(&path, &meta.config().with_key_lookups(false)).unwrap();

    let query = random_vectors(1, NDIM, 4);
    assert_eq!(view.search(query.row(0), 3).unwrap().len(), 3);
    assert!(matches!(view.contains(10u64), Err(ShardexError::LookupsDisabled)));
    assert!(matches!(view.get(10u64), Err(ShardexError::LookupsDisabled)));
    assert!(!view.key_index_built());
}

#[test]
fn test_view_rejects_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.shx");
    build(10, KeyKind::U64).save(&path).unwrap();

    let view = Shard::view(&path).unwrap();
    assert!(matches!(view.add(1u64, &[0.0f32; NDIM]), Err(ShardexError::ReadOnly)));
    assert!(matches!(view.remove(0u64), Err(ShardexError::ReadOnly)));
    assert_eq!(view.len(), 10);
}

#[test]
fn test_tampered_graph_detected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tampered.shx");
    build(30, KeyKind::U64).save(&path).unwrap();

    let offset = graph_offset(&path);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[offset..offset + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(Shard::view(&path), Err(ShardexError::CorruptGraph(_))));
    assert!(matches!(Shard::restore(&path), Err(ShardexError::ChecksumMismatch)));
}

#[test]
fn test_restore_with_mismatched_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mismatch.shx");
    build(10, KeyKind::U64).save(&path).unwrap();

    let wrong = [
        ShardConfig::new(NDIM + 1, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64),
        ShardConfig::new(NDIM, MetricKind::Cos, ScalarKind::F32, KeyKind::U64),
        ShardConfig::new(NDIM, MetricKind::L2sq, ScalarKind::F16, KeyKind::U64),
        ShardConfig::new(NDIM, MetricKind::L2sq, ScalarKind::F32, KeyKind::Uuid),
    ];
    for config in wrong {
        assert!(matches!(
            Shard::restore_with(&path, &config),
            Err(ShardexError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            Shard::view_with(&path, &config),
            Err(ShardexError::InvalidConfiguration(_))
        ));
    }

    // Runtime settings are free to differ.
    let tuned = ShardConfig::new(NDIM, MetricKind::L2sq, ScalarKind::F32, KeyKind::U64).with_expansion_search(128);
    let restored = Shard::restore_with(&path, &tuned).unwrap();
    assert_eq!(restored.config().expansion_search, 128);
}

#[test]
fn test_compacted_shard_saves() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("compacted.shx");
    let shard = build(60, KeyKind::U64);
    for key in (0..60u64).step_by(3) {
        shard.remove(key * 10).unwrap();
    }
    let compacted = shard.compact().unwrap();
    assert_eq!(compacted.count(), 40);
    compacted.save(&path).unwrap();

    let meta = Shard::metadata(&path).unwrap();
    assert_eq!(meta.count, 40);
    assert_eq!(meta.live, 40);
    let view = Shard::view(&path).unwrap();
    assert!(view.contains(10u64).unwrap());
    assert!(!view.contains(0u64).unwrap());
}

#[test]
fn test_concurrent_first_lookups_on_view() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("concurrent.shx");
    let shard = build(2_000, KeyKind::U64);
    shard.save(&path).unwrap();
    let expected = shard.get(1230u64).unwrap();

    let view = Shard::view(&path).unwrap();
    assert!(!view.key_index_built());

    let results: Vec<(bool, bool, Option<Vec<f32>>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let view = &view;
                scope.spawn(move || {
                    let present = (0..2_000u64).all(|i| view.contains(i * 10).unwrap());
                    let absent = !view.contains(t * 10 + 5).unwrap();
                    (present, absent, view.get(1230u64).unwrap())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(view.key_index_built());
    assert_eq!(results.len(), 8);
    for (present, absent, vector) in results {
        assert!(present);
        assert!(absent);
        assert_eq!(vector, expected);
    }
}

#[test]
fn test_view_open_reads_graph_not_vectors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("vectors_edited.shx");
    build(30, KeyKind::U64).save(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let header = FileHeader::from_bytes(&bytes[..FileHeader::SIZE]).unwrap();
    let meta = Shard::metadata(&path).unwrap();
    let start = header.data_start() + meta.sections.vectors.offset as usize;
    let mut edited = bytes.clone();
    edited[start..start + NDIM * 4].copy_from_slice(&[0u8; NDIM * 4]);
    std::fs::write(&path, &edited).unwrap();

    // Only the graph section is validated on open; the edited vector is
    // served as stored.
    let view = Shard::view(&path).unwrap();
    assert_eq!(view.get(0u64).unwrap(), Some(vec![0.0; NDIM]));
    assert!(matches!(Shard::restore(&path), Err(ShardexError::ChecksumMismatch)));
}
