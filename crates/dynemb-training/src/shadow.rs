//! Per-step dense view of the rows a batch touches.
//!
//! A [`ShadowVariable`] is rebuilt by every [`lookup`](ShadowVariable::lookup):
//! it deduplicates the batch keys, fetches each unique row once and remembers
//! the mapping from batch positions back to unique rows. Gradients computed
//! against the batch are folded back into per-key rows by
//! [`aggregate_gradients`](ShadowVariable::aggregate_gradients) before an
//! [`EmbeddingOptimizer`](crate::EmbeddingOptimizer) consumes the shadow.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dynemb_hash_table::{DynamicEmbeddingTable, InitializerConfig, TableConfig};
//! use dynemb_training::ShadowVariable;
//!
//! let table = Arc::new(
//!     DynamicEmbeddingTable::new(
//!         TableConfig::new("items", 2).with_initializer(InitializerConfig::Zeros),
//!     )
//!     .unwrap(),
//! );
//! table.upsert(&[3], &[1.0, 2.0]).unwrap();
//!
//! let mut shadow = ShadowVariable::new(Arc::clone(&table), "items_shadow");
//! let rows = shadow.lookup(&[3, 4, 3]).unwrap();
//! assert_eq!(rows, vec![1.0, 2.0, 0.0, 0.0, 1.0, 2.0]);
//! assert_eq!(shadow.ids(), &[3, 4]);
//! assert_eq!(shadow.inverse(), &[0, 1, 0]);
//! ```

use std::sync::Arc;

use dynemb_hash_table::DynamicEmbeddingTable;
use hashbrown::HashMap;
use tracing::warn;

use crate::error::{TrainingError, TrainingResult};

/// Deduplicates `ids`, keeping first-occurrence order.
///
/// Returns the unique ids and, for every input position, the index of its id
/// in the unique list.
pub fn dedup_ids(ids: &[i64]) -> (Vec<i64>, Vec<usize>) {
    let mut unique_ids = Vec::new();
    let mut id_to_idx: HashMap<i64, usize> = HashMap::with_capacity(ids.len());
    let mut inverse = Vec::with_capacity(ids.len());

    for &id in ids {
        let unique_idx = *id_to_idx.entry(id).or_insert_with(|| {
            unique_ids.push(id);
            unique_ids.len() - 1
        });
        inverse.push(unique_idx);
    }

    (unique_ids, inverse)
}

/// Where a shadow is in its lookup/update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// Nothing looked up yet.
    Empty,
    /// Rows were fetched while the table was at `epoch`.
    Pending {
        /// Table epoch observed by the lookup.
        epoch: u64,
    },
    /// An optimizer step consumed the lookup.
    Applied,
    /// An incremental write failed part way; the rows must be looked up again.
    Invalidated,
}

/// Dense, deduplicated copy of the rows of one batch.
#[derive(Debug)]
pub struct ShadowVariable {
    name: String,
    table: Arc<DynamicEmbeddingTable>,
    max_norm: Option<f32>,
    ids: Vec<i64>,
    values: Vec<f32>,
    exists: Vec<bool>,
    inverse: Vec<usize>,
    updated: Option<Vec<f32>>,
    state: ShadowState,
}

impl ShadowVariable {
    /// Creates an empty shadow over `table`.
    pub fn new(table: Arc<DynamicEmbeddingTable>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table,
            max_norm: None,
            ids: Vec::new(),
            values: Vec::new(),
            exists: Vec::new(),
            inverse: Vec::new(),
            updated: None,
            state: ShadowState::Empty,
        }
    }

    /// Clips updated rows to an L2 norm of at most `max_norm`.
    pub fn with_max_norm(mut self, max_norm: f32) -> Self {
        self.max_norm = Some(max_norm);
        self
    }

    /// Fetches the rows of `keys` and returns them in batch order.
    ///
    /// Duplicate keys are fetched once and share a row, so every occurrence
    /// of a key sees the same values. Missing keys get the table's default
    /// and are not inserted.
    ///
    /// # Errors
    ///
    /// Returns the table's error if a key doesn't fit its key dtype. The
    /// previous lookup is kept in that case.
    pub fn lookup(&mut self, keys: &[i64]) -> TrainingResult<Vec<f32>> {
        let (ids, inverse) = dedup_ids(keys);
        let (values, exists) = self.table.lookup_with_exists(&ids)?;

        self.ids = ids;
        self.values = values;
        self.exists = exists;
        self.inverse = inverse;
        self.updated = None;
        self.state = ShadowState::Pending {
            epoch: self.table.epoch(),
        };
        Ok(self.gather())
    }

    fn gather(&self) -> Vec<f32> {
        let dim = self.dim();
        self.inverse
            .iter()
            .flat_map(|&idx| self.values[idx * dim..(idx + 1) * dim].iter().copied())
            .collect()
    }

    /// Name of the shadow.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table the shadow reads from and writes to.
    pub fn table(&self) -> &Arc<DynamicEmbeddingTable> {
        &self.table
    }

    /// Width of each row.
    pub fn dim(&self) -> usize {
        self.table.dim()
    }

    /// Configured row norm limit.
    pub fn max_norm(&self) -> Option<f32> {
        self.max_norm
    }

    /// Unique keys of the last lookup, in first-occurrence order.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// Whether each unique key was stored when it was fetched.
    pub fn exists(&self) -> &[bool] {
        &self.exists
    }

    /// Index into [`ids`](Self::ids) for every position of the last batch.
    pub fn inverse(&self) -> &[usize] {
        &self.inverse
    }

    /// Number of positions in the last batch.
    pub fn positions(&self) -> usize {
        self.inverse.len()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ShadowState {
        self.state
    }

    /// Row-major values of the unique keys.
    ///
    /// With `apply_gradients` set and an optimizer step already applied, the
    /// post-step values are returned; otherwise the fetched ones.
    pub fn read_value(&self, apply_gradients: bool) -> &[f32] {
        match (&self.updated, apply_gradients) {
            (Some(updated), true) => updated,
            _ => &self.values,
        }
    }

    /// Sums gradients of the batch positions into one row per unique key.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::ShapeMismatch`] unless `gradients` holds
    /// `positions() * dim()` values.
    pub fn aggregate_gradients(&self, gradients: &[f32]) -> TrainingResult<Vec<f32>> {
        let dim = self.dim();
        let expected = self.inverse.len() * dim;
        if gradients.len() != expected {
            return Err(TrainingError::ShapeMismatch {
                expected,
                actual: gradients.len(),
            });
        }

        let mut aggregated = vec![0.0; self.ids.len() * dim];
        for (&idx, grad) in self.inverse.iter().zip(gradients.chunks_exact(dim)) {
            aggregated[idx * dim..(idx + 1) * dim]
                .iter_mut()
                .zip(grad)
                .for_each(|(a, g)| *a += g);
        }
        Ok(aggregated)
    }

    /// Fails unless the shadow holds a lookup from the table's current epoch
    /// that no step has consumed yet.
    pub(crate) fn ensure_pending(&self) -> TrainingResult<()> {
        let reason = match self.state {
            ShadowState::Pending { epoch } if epoch == self.table.epoch() => return Ok(()),
            ShadowState::Pending { epoch } => format!(
                "table '{}' moved from epoch {epoch} to {} since lookup",
                self.table.name(),
                self.table.epoch()
            ),
            ShadowState::Empty => "no lookup was performed".to_string(),
            ShadowState::Applied => "lookup was already consumed by an update".to_string(),
            ShadowState::Invalidated => {
                "a failed incremental update left the rows partially written".to_string()
            }
        };
        warn!(shadow = %self.name, reason = %reason, "Rejected stale shadow");
        Err(TrainingError::StaleShadowReference {
            shadow: self.name.clone(),
            reason,
        })
    }

    pub(crate) fn mark_applied(&mut self, updated: Vec<f32>) {
        self.updated = Some(updated);
        self.state = ShadowState::Applied;
    }

    pub(crate) fn invalidate(&mut self) {
        self.state = ShadowState::Invalidated;
    }
}
