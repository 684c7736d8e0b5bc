//! Checkpointed state of dynamic embedding tables.
//!
//! A [`TableCheckpoint`] is a flat export of one table: its keys, row-major
//! values, restrict scores and, optionally, the optimizer slot state keyed
//! by the same keys. A [`ModelState`] groups the tables of one training run
//! under a global step.

use std::collections::HashMap;

use dynemb_hash_table::{DynamicEmbeddingTable, EmbeddingError, KeyDtype, ValueDtype};
use dynemb_optimizer::{OptimizerConfig, SlotState};
use dynemb_training::EmbeddingOptimizer;
use serde::{Deserialize, Serialize};

use crate::{CheckpointError, Result};

/// Current version of the checkpoint format.
pub const FORMAT_VERSION: u32 = 1;

/// Exported contents of one dynamic embedding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    /// Name of the table.
    pub name: String,

    /// Embedding dimension.
    pub dim: usize,

    /// Key dtype of the table.
    pub key_dtype: KeyDtype,

    /// Value dtype of the table.
    pub value_dtype: ValueDtype,

    /// Number of shards at capture time. Informational; rows are routed
    /// again on restore.
    pub num_shards: usize,

    /// Exported keys.
    pub keys: Vec<i64>,

    /// Row-major values, `keys.len() * dim` elements.
    pub values: Vec<f32>,

    /// Restrict scores aligned with `keys`, present when the table had a
    /// restrict policy.
    pub scores: Option<Vec<u64>>,

    /// Optimizer configuration the slots belong to.
    pub optimizer: Option<OptimizerConfig>,

    /// Optimizer slot state per key.
    pub slots: Vec<(i64, SlotState)>,

    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
}

impl TableCheckpoint {
    /// Captures the contents of `table`, and the slot state of `optimizer`
    /// if given.
    pub fn capture(table: &DynamicEmbeddingTable, optimizer: Option<&EmbeddingOptimizer>) -> Self {
        let (keys, values, scores) = table.export_with_scores();
        let scores = table.restrict_policy().map(|_| scores);
        let mut metadata = HashMap::new();
        if let Some(policy) = table.restrict_policy() {
            metadata.insert("restrict_policy".to_string(), policy.name().to_string());
        }

        Self {
            name: table.name().to_string(),
            dim: table.dim(),
            key_dtype: table.key_dtype(),
            value_dtype: table.config().value_dtype,
            num_shards: table.num_shards(),
            keys,
            values,
            scores,
            optimizer: optimizer.map(|o| o.config().clone()),
            slots: optimizer.map(|o| o.slots().export()).unwrap_or_default(),
            metadata,
        }
    }

    /// Replaces the contents of `table` with this checkpoint, and the slot
    /// state of `optimizer` if given.
    ///
    /// Rows are routed with the table's own partitioner, so the target may
    /// have a different shard count than the source.
    ///
    /// # Errors
    ///
    /// * [`EmbeddingError::TypeMismatch`] if key or value dtype differ
    /// * [`EmbeddingError::DimensionMismatch`] if the row width differs
    /// * [`CheckpointError::InvalidConfig`] if the slots were captured with
    ///   another optimizer type
    pub fn restore_into(
        &self,
        table: &DynamicEmbeddingTable,
        optimizer: Option<&EmbeddingOptimizer>,
    ) -> Result<()> {
        if self.key_dtype != table.key_dtype() {
            return Err(EmbeddingError::TypeMismatch {
                expected: table.key_dtype().name().to_string(),
                actual: self.key_dtype.name().to_string(),
            }
            .into());
        }
        if self.value_dtype != table.config().value_dtype {
            return Err(EmbeddingError::TypeMismatch {
                expected: table.config().value_dtype.name().to_string(),
                actual: self.value_dtype.name().to_string(),
            }
            .into());
        }
        if let (Some(optimizer), Some(saved)) = (optimizer, &self.optimizer) {
            if saved.name() != optimizer.config().name() {
                return Err(CheckpointError::InvalidConfig(format!(
                    "table '{}' slots were saved for {}, optimizer is {}",
                    self.name,
                    saved.name(),
                    optimizer.config().name()
                )));
            }
        }

        table.import_replace(&self.keys, &self.values, self.scores.as_deref(), self.dim)?;
        if let Some(optimizer) = optimizer {
            optimizer.slots().clear();
            optimizer.slots().import(self.slots.iter().cloned());
        }
        Ok(())
    }

    /// Number of exported rows.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no row was exported.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// State of every table of a training run at one global step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    /// Version of the checkpoint format.
    pub version: u32,

    /// Global training step at checkpoint time.
    pub global_step: u64,

    /// Timestamp when checkpoint was created (Unix epoch seconds).
    pub timestamp: u64,

    /// Exported tables.
    pub tables: Vec<TableCheckpoint>,

    /// Additional metadata about the training run.
    pub metadata: HashMap<String, String>,
}

impl ModelState {
    /// Create a new empty model state.
    pub fn new(global_step: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            global_step,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            tables: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Add a table checkpoint.
    pub fn add_table(&mut self, table: TableCheckpoint) {
        self.tables.push(table);
    }

    /// Finds a table checkpoint by name.
    pub fn table(&self, name: &str) -> Option<&TableCheckpoint> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Set metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Total number of rows across all tables.
    pub fn total_embeddings(&self) -> usize {
        self.tables.iter().map(TableCheckpoint::len).sum()
    }

    /// Fails unless this state was written by a supported format version.
    pub fn check_version(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dynemb_hash_table::{
        InitializerConfig, TableBuilder, TableConfig, TimestampRestrictPolicy,
    };

    fn table(dim: usize, key_dtype: KeyDtype) -> DynamicEmbeddingTable {
        DynamicEmbeddingTable::new(
            TableConfig::new("items", dim)
                .with_num_shards(2)
                .with_key_dtype(key_dtype)
                .with_initializer(InitializerConfig::Zeros),
        )
        .unwrap()
    }

    #[test]
    fn test_capture_without_policy_has_no_scores() {
        let table = table(2, KeyDtype::Int64);
        table.upsert(&[1, 2], &[1.0, 1.0, 2.0, 2.0]).unwrap();

        let checkpoint = TableCheckpoint::capture(&table, None);
        assert_eq!(checkpoint.len(), 2);
        assert_eq!(checkpoint.values.len(), 4);
        assert!(checkpoint.scores.is_none());
        assert!(checkpoint.optimizer.is_none());
        assert!(checkpoint.slots.is_empty());
    }

    #[test]
    fn test_capture_with_policy_keeps_scores() {
        let table = TableBuilder::new(TableConfig::new("scored", 1))
            .restrict_policy(Arc::new(TimestampRestrictPolicy))
            .build()
            .unwrap();
        table.upsert(&[7, 8], &[0.7, 0.8]).unwrap();

        let checkpoint = TableCheckpoint::capture(&table, None);
        let scores = checkpoint.scores.as_ref().unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|&s| s > 0));
        assert_eq!(
            checkpoint.metadata.get("restrict_policy").map(String::as_str),
            Some("timestamp")
        );
    }

    #[test]
    fn test_restore_rejects_dimension_mismatch() {
        let source = table(2, KeyDtype::Int64);
        source.upsert(&[1], &[1.0, 1.0]).unwrap();
        let checkpoint = TableCheckpoint::capture(&source, None);

        let target = table(3, KeyDtype::Int64);
        let err = checkpoint.restore_into(&target, None).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Table(EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(target.is_empty());
    }

    #[test]
    fn test_restore_rejects_key_dtype_mismatch() {
        let source = table(1, KeyDtype::Int64);
        source.upsert(&[1], &[1.0]).unwrap();
        let checkpoint = TableCheckpoint::capture(&source, None);

        let target = table(1, KeyDtype::Int32);
        let err = checkpoint.restore_into(&target, None).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Table(EmbeddingError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_model_state_lookup_and_version() {
        let source = table(1, KeyDtype::Int64);
        source.upsert(&[1, 2, 3], &[1.0, 2.0, 3.0]).unwrap();

        let mut state = ModelState::new(42);
        state.add_table(TableCheckpoint::capture(&source, None));
        state.set_metadata("run", "test");

        assert_eq!(state.total_embeddings(), 3);
        assert!(state.table("items").is_some());
        assert!(state.table("missing").is_none());
        assert!(state.check_version().is_ok());

        state.version = 99;
        assert!(matches!(
            state.check_version(),
            Err(CheckpointError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: 99
            })
        ));
    }
}
