use std::sync::Arc;

use dynemb_checkpoint::{
    BinaryCheckpointer, CheckpointConfig, CheckpointError, CheckpointManager, Checkpointer,
    JsonCheckpointer, ModelState, TableCheckpoint,
};
use dynemb_hash_table::{
    DynamicEmbeddingTable, InitializerConfig, RestrictRequest, TableBuilder, TableConfig,
    TimestampRestrictPolicy,
};
use dynemb_optimizer::OptimizerConfig;
use dynemb_training::{EmbeddingOptimizer, ShadowVariable, TrainingError};
use tempfile::tempdir;

fn adagrad() -> OptimizerConfig {
    OptimizerConfig::Adagrad {
        learning_rate: 0.1,
        initial_accumulator: 0.1,
        weight_decay: 0.0,
    }
}

fn table(name: &str, num_shards: usize) -> Arc<DynamicEmbeddingTable> {
    Arc::new(
        DynamicEmbeddingTable::new(
            TableConfig::new(name, 3)
                .with_num_shards(num_shards)
                .with_init_capacity(4)
                .with_initializer(InitializerConfig::Constant { value: 0.25 }),
        )
        .unwrap(),
    )
}

fn train(table: &Arc<DynamicEmbeddingTable>, optimizer: &EmbeddingOptimizer, keys: &[i64]) {
    let mut shadow = ShadowVariable::new(Arc::clone(table), "train");
    let rows = shadow.lookup(keys).unwrap();
    let gradients: Vec<f32> = rows.iter().enumerate().map(|(i, _)| (i % 5) as f32 * 0.1).collect();
    optimizer.apply_gradients(&mut shadow, &gradients).unwrap();
}

fn round_trip_through(checkpointer: impl Checkpointer) {
    let dir = tempdir().unwrap();
    let source = table("items", 4);
    let source_optimizer = EmbeddingOptimizer::new(adagrad(), &source).unwrap();
    let keys: Vec<i64> = (0..200).map(|k| k * 31 - 1000).collect();
    train(&source, &source_optimizer, &keys);
    train(&source, &source_optimizer, &keys[50..150]);

    let mut state = ModelState::new(2);
    state.add_table(TableCheckpoint::capture(&source, Some(&source_optimizer)));
    let mut manager = CheckpointManager::new(CheckpointConfig::new(dir.path()), checkpointer);
    manager.save(&state).unwrap();

    // Restore into a table with a different shard count.
    let target = table("items", 7);
    let target_optimizer = EmbeddingOptimizer::new(adagrad(), &target).unwrap();
    let restored = manager.restore_latest().unwrap();
    assert_eq!(restored.global_step, 2);
    restored
        .table("items")
        .unwrap()
        .restore_into(&target, Some(&target_optimizer))
        .unwrap();

    assert_eq!(target.size(), source.size());
    assert_eq!(target.lookup(&keys).unwrap(), source.lookup(&keys).unwrap());
    assert_eq!(target_optimizer.slots().len(), source_optimizer.slots().len());
    assert_eq!(target_optimizer.slots().get(keys[60]), source_optimizer.slots().get(keys[60]));

    // Training continues identically from the restored state.
    train(&source, &source_optimizer, &keys[100..]);
    train(&target, &target_optimizer, &keys[100..]);
    assert_eq!(target.lookup(&keys).unwrap(), source.lookup(&keys).unwrap());
}

#[test]
fn json_round_trip_restores_rows_and_slots() {
    round_trip_through(JsonCheckpointer::new());
}

#[test]
fn binary_round_trip_restores_rows_and_slots() {
    round_trip_through(BinaryCheckpointer::new());
}

#[test]
fn restore_is_independent_of_row_order() {
    let source = table("ordered", 2);
    let keys: Vec<i64> = (0..50).collect();
    let values: Vec<f32> = (0..150).map(|v| v as f32).collect();
    source.upsert(&keys, &values).unwrap();

    let mut checkpoint = TableCheckpoint::capture(&source, None);
    checkpoint.keys.reverse();
    checkpoint.values = checkpoint
        .values
        .chunks_exact(3)
        .rev()
        .flatten()
        .copied()
        .collect();

    let target = table("ordered", 5);
    target.upsert(&[999], &[9.0; 3]).unwrap();
    checkpoint.restore_into(&target, None).unwrap();

    assert!(!target.contains(999));
    assert_eq!(target.lookup(&keys).unwrap(), values);
}

#[test]
fn restrict_scores_survive_restore() {
    let build = || {
        TableBuilder::new(TableConfig::new("scored", 1).with_num_shards(3))
            .restrict_policy(Arc::new(TimestampRestrictPolicy))
            .build()
            .unwrap()
    };
    let source = build();
    let keys: Vec<i64> = (0..20).collect();
    source.upsert(&keys, &[1.0; 20]).unwrap();
    source.lookup(&[3, 17, 9]).unwrap();

    let target = build();
    TableCheckpoint::capture(&source, None)
        .restore_into(&target, None)
        .unwrap();
    assert_eq!(target.status(&keys).unwrap(), source.status(&keys).unwrap());

    target.restrict(&RestrictRequest::max_entries(3)).unwrap();
    let mut kept: Vec<i64> = target.export().0;
    kept.sort_unstable();
    assert_eq!(kept, vec![3, 9, 17]);

    // New touches rank after every restored score.
    target.upsert(&[50], &[0.0]).unwrap();
    target.restrict(&RestrictRequest::max_entries(1)).unwrap();
    assert_eq!(target.export().0, vec![50]);
}

#[test]
fn restore_rejects_slots_of_another_optimizer() {
    let source = table("mismatch", 2);
    let optimizer = EmbeddingOptimizer::new(adagrad(), &source).unwrap();
    train(&source, &optimizer, &[1, 2, 3]);
    let checkpoint = TableCheckpoint::capture(&source, Some(&optimizer));

    let target = table("mismatch", 2);
    let sgd = EmbeddingOptimizer::new(OptimizerConfig::Sgd { learning_rate: 0.1 }, &target).unwrap();
    let err = checkpoint.restore_into(&target, Some(&sgd)).unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidConfig(_)));
    assert!(target.is_empty());

    // Rows alone still restore.
    checkpoint.restore_into(&target, None).unwrap();
    assert_eq!(target.size(), 3);
}

#[test]
fn restore_invalidates_outstanding_shadows() {
    let live = table("live", 2);
    let optimizer = EmbeddingOptimizer::new(adagrad(), &live).unwrap();
    train(&live, &optimizer, &[1, 2]);
    let checkpoint = TableCheckpoint::capture(&live, Some(&optimizer));

    let mut shadow = ShadowVariable::new(Arc::clone(&live), "in_flight");
    shadow.lookup(&[1]).unwrap();
    checkpoint.restore_into(&live, Some(&optimizer)).unwrap();

    let err = optimizer
        .apply_gradients(&mut shadow, &[1.0, 1.0, 1.0])
        .unwrap_err();
    assert!(matches!(err, TrainingError::StaleShadowReference { .. }));
}
