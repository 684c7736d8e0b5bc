use std::collections::HashSet;
use std::sync::Arc;

use dynemb_hash_table::{
    DynamicEmbeddingTable, EmbeddingError, FrequencyRestrictPolicy, InitializerConfig,
    RestrictRequest, TableBuilder, TableConfig, TimestampRestrictPolicy,
};

fn zeros_table(name: &str, dim: usize, num_shards: usize) -> DynamicEmbeddingTable {
    DynamicEmbeddingTable::new(
        TableConfig::new(name, dim)
            .with_num_shards(num_shards)
            .with_init_capacity(8)
            .with_initializer(InitializerConfig::Zeros),
    )
    .unwrap()
}

fn rows_for(keys: &[i64], dim: usize) -> Vec<f32> {
    keys.iter()
        .flat_map(|&k| (0..dim).map(move |j| k as f32 + j as f32 / 10.0))
        .collect()
}

#[test]
fn lookup_after_upsert_round_trips_disjoint_batches() {
    let dim = 3;
    let table = zeros_table("round_trip", dim, 4);
    let batches: Vec<Vec<i64>> = vec![
        (0..100).collect(),
        (1000..1100).collect(),
        (-300..-200).collect(),
    ];
    for batch in &batches {
        table.upsert(batch, &rows_for(batch, dim)).unwrap();
    }
    for batch in &batches {
        assert_eq!(table.lookup(batch).unwrap(), rows_for(batch, dim));
    }
    assert_eq!(table.size(), 300);
}

#[test]
fn export_reimport_reproduces_mapping() {
    let dim = 2;
    let source = zeros_table("source", dim, 3);
    let keys: Vec<i64> = (0..500).map(|k| k * 7919 - 100_000).collect();
    source.upsert(&keys, &rows_for(&keys, dim)).unwrap();

    let (exported_keys, exported_values) = source.export();
    assert_eq!(exported_keys.len(), keys.len());

    let target = zeros_table("target", dim, 3);
    target.import(&exported_keys, &exported_values, dim).unwrap();
    assert_eq!(target.size(), source.size());
    assert_eq!(target.lookup(&keys).unwrap(), rows_for(&keys, dim));

    // Import order does not matter.
    let reversed_keys: Vec<i64> = exported_keys.iter().rev().copied().collect();
    let reversed_values: Vec<f32> = exported_values
        .chunks(dim)
        .rev()
        .flatten()
        .copied()
        .collect();
    let reordered = zeros_table("reordered", dim, 5);
    reordered.import(&reversed_keys, &reversed_values, dim).unwrap();
    assert_eq!(reordered.lookup(&keys).unwrap(), rows_for(&keys, dim));
}

#[test]
fn missing_key_returns_default_without_inserting() {
    let table = zeros_table("miss", 4, 2);
    let (values, exists) = table.lookup_with_exists(&[42]).unwrap();
    assert_eq!(values, vec![0.0; 4]);
    assert_eq!(exists, vec![false]);
    assert_eq!(table.size(), 0);
    assert!(!table.contains(42));
}

#[test]
fn constant_default_for_unseen_keys() {
    let table = DynamicEmbeddingTable::new(
        TableConfig::new("constant", 2)
            .with_num_shards(2)
            .with_initializer(InitializerConfig::Constant { value: 0.1 }),
    )
    .unwrap();
    table.upsert(&[2, 5], &[1.0, 1.0, 1.0, 1.0]).unwrap();

    let values = table.lookup(&[2, 5, 8]).unwrap();
    assert_eq!(values, vec![1.0, 1.0, 1.0, 1.0, 0.1, 0.1]);
}

#[test]
fn concurrent_disjoint_upserts_count_every_key() {
    let dim = 4;
    let table = Arc::new(zeros_table("concurrent", dim, 4));
    let threads = 8;
    let per_thread = 2_000;

    std::thread::scope(|scope| {
        for t in 0..threads {
            let table = Arc::clone(&table);
            scope.spawn(move || {
                let start = (t * per_thread) as i64;
                let keys: Vec<i64> = (start..start + per_thread as i64).collect();
                for chunk in keys.chunks(97) {
                    table.upsert(chunk, &rows_for(chunk, dim)).unwrap();
                }
            });
        }
    });

    assert_eq!(table.size(), threads * per_thread);
    let all: Vec<i64> = (0..(threads * per_thread) as i64).collect();
    assert_eq!(table.lookup(&all).unwrap(), rows_for(&all, dim));
}

#[test]
fn concurrent_readers_during_growth_never_see_partial_rows() {
    let dim = 8;
    let table = Arc::new(zeros_table("growth", dim, 1));
    let seed: Vec<i64> = (0..16).collect();
    table.upsert(&seed, &rows_for(&seed, dim)).unwrap();

    std::thread::scope(|scope| {
        let writer = Arc::clone(&table);
        scope.spawn(move || {
            let keys: Vec<i64> = (16..20_000).collect();
            for chunk in keys.chunks(256) {
                writer.upsert(chunk, &rows_for(chunk, dim)).unwrap();
            }
        });
        for _ in 0..4 {
            let reader = Arc::clone(&table);
            let seed = seed.clone();
            scope.spawn(move || {
                for _ in 0..200 {
                    let (values, exists) = reader.lookup_with_exists(&seed).unwrap();
                    assert!(exists.iter().all(|&e| e));
                    assert_eq!(values, rows_for(&seed, dim));
                }
            });
        }
    });
    assert_eq!(table.size(), 20_000);
}

#[test]
fn timestamp_restrict_keeps_most_recently_touched() {
    let table = TableBuilder::new(
        TableConfig::new("restrict", 2)
            .with_num_shards(3)
            .with_initializer(InitializerConfig::Zeros),
    )
    .restrict_policy(Arc::new(TimestampRestrictPolicy))
    .build()
    .unwrap();

    let keys: Vec<i64> = (0..100).collect();
    table.upsert(&keys, &rows_for(&keys, 2)).unwrap();
    // Re-touch a scattered subset so recency differs from insertion order.
    let recent = vec![3, 97, 50, 11, 64];
    table.lookup(&recent).unwrap();

    let evicted = table.restrict(&RestrictRequest::max_entries(5)).unwrap();
    assert_eq!(evicted, 95);
    assert_eq!(table.size(), 5);

    let remaining: HashSet<i64> = table.export().0.into_iter().collect();
    assert_eq!(remaining, recent.into_iter().collect());

    // Scores exist exactly for the stored keys.
    let status = table.status(&keys).unwrap();
    assert_eq!(status.iter().filter(|s| s.is_some()).count(), table.size());
}

#[test]
fn frequency_restrict_drops_rarely_used_keys() {
    let table = TableBuilder::new(TableConfig::new("freq", 1))
        .restrict_policy(Arc::new(FrequencyRestrictPolicy))
        .build()
        .unwrap();
    table.upsert(&[1, 2, 3, 4], &[0.0; 4]).unwrap();
    for _ in 0..3 {
        table.lookup(&[2, 4]).unwrap();
    }
    table.lookup(&[3]).unwrap();

    table.restrict(&RestrictRequest::max_entries(3)).unwrap();
    let mut remaining = table.export().0;
    remaining.sort_unstable();
    assert_eq!(remaining, vec![2, 3, 4]);
}

#[test]
fn max_capacity_exhaustion_is_reported() {
    let table = DynamicEmbeddingTable::new(
        TableConfig::new("bounded", 1)
            .with_init_capacity(4)
            .with_max_capacity(10),
    )
    .unwrap();
    let keys: Vec<i64> = (0..10).collect();
    table.upsert(&keys, &vec![1.0; 10]).unwrap();

    let err = table.upsert(&[10], &[1.0]).unwrap_err();
    assert_eq!(
        err,
        EmbeddingError::CapacityExhausted {
            shard: 0,
            capacity: 10,
            requested: 11
        }
    );
    assert_eq!(table.size(), 10);
}

#[test]
fn lookup_or_insert_agrees_across_threads() {
    let table = Arc::new(
        DynamicEmbeddingTable::new(
            TableConfig::new("agree", 4).with_initializer(InitializerConfig::RandomNormal {
                mean: 0.0,
                stddev: 1.0,
            }),
        )
        .unwrap(),
    );
    let keys: Vec<i64> = (0..64).collect();

    let results: Vec<Vec<f32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let keys = keys.clone();
                scope.spawn(move || table.lookup_or_insert(&keys).unwrap().0)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for values in &results[1..] {
        assert_eq!(values, &results[0]);
    }
    assert_eq!(table.lookup(&keys).unwrap(), results[0]);
    assert_eq!(table.size(), 64);
}
