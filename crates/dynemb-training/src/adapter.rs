//! Applying optimizer steps to dynamic embedding tables.
//!
//! [`EmbeddingOptimizer`] turns the gradients of a [`ShadowVariable`] into
//! updated rows and writes them back to the shadow's table. Optimizer state
//! is kept per embedding key in a [`SlotStore`], so it survives across steps
//! regardless of where a key lands in a batch.

use dynemb_hash_table::{DynamicEmbeddingTable, UpdateMode};
use dynemb_optimizer::{create_optimizer, Optimizer, OptimizerConfig, SlotStore};
use tracing::{debug, info, warn};

use crate::error::{TrainingError, TrainingResult};
use crate::shadow::ShadowVariable;

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    /// Number of unique rows updated.
    pub rows: usize,
    /// Rows scaled down to the shadow's norm limit.
    pub clipped: usize,
    /// Rows the table skipped because their presence changed since lookup.
    pub skipped: usize,
}

/// Optimizer bound to the slot state of one table.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use dynemb_hash_table::{DynamicEmbeddingTable, InitializerConfig, TableConfig};
/// use dynemb_optimizer::OptimizerConfig;
/// use dynemb_training::{EmbeddingOptimizer, ShadowVariable};
///
/// let table = Arc::new(
///     DynamicEmbeddingTable::new(
///         TableConfig::new("items", 2).with_initializer(InitializerConfig::Zeros),
///     )
///     .unwrap(),
/// );
/// let optimizer =
///     EmbeddingOptimizer::new(OptimizerConfig::Sgd { learning_rate: 0.5 }, &table).unwrap();
///
/// let mut shadow = ShadowVariable::new(Arc::clone(&table), "items_shadow");
/// shadow.lookup(&[1, 1]).unwrap();
/// optimizer
///     .apply_gradients(&mut shadow, &[1.0, 1.0, 1.0, 1.0])
///     .unwrap();
///
/// assert_eq!(table.lookup(&[1]).unwrap(), vec![-1.0, -1.0]);
/// ```
pub struct EmbeddingOptimizer {
    optimizer: Box<dyn Optimizer>,
    slots: SlotStore,
}

impl std::fmt::Debug for EmbeddingOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingOptimizer")
            .field("config", self.optimizer.config())
            .field("slots", &self.slots)
            .finish()
    }
}

impl EmbeddingOptimizer {
    /// Creates an optimizer whose slot state is striped like `table`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Optimizer`] if a hyper-parameter is invalid.
    pub fn new(config: OptimizerConfig, table: &DynamicEmbeddingTable) -> TrainingResult<Self> {
        let optimizer = create_optimizer(config)?;
        let slots = SlotStore::new(table.num_shards(), table.partitioner().clone());
        Ok(Self::from_parts(optimizer, slots))
    }

    /// Wraps an existing optimizer and slot store.
    pub fn from_parts(optimizer: Box<dyn Optimizer>, slots: SlotStore) -> Self {
        Self { optimizer, slots }
    }

    /// Optimizer configuration.
    pub fn config(&self) -> &OptimizerConfig {
        self.optimizer.config()
    }

    /// Persistent per-key optimizer state.
    pub fn slots(&self) -> &SlotStore {
        &self.slots
    }

    /// Applies gradients given per batch position of the shadow's lookup.
    ///
    /// Gradients of duplicate keys are summed before the step.
    ///
    /// # Errors
    ///
    /// * [`TrainingError::ShapeMismatch`] unless `gradients` has
    ///   `positions * dim` values
    /// * [`TrainingError::StaleShadowReference`] if the shadow has no
    ///   unconsumed lookup from the table's current epoch
    /// * errors of the optimizer and of the table write
    ///
    /// On error the optimizer slots keep their pre-step state. After a failed
    /// [`UpdateMode::Incremental`] write the shadow is
    /// [`Invalidated`](crate::ShadowState::Invalidated) and must be looked up
    /// again; after a failed direct write it can be retried as is.
    pub fn apply_gradients(
        &self,
        shadow: &mut ShadowVariable,
        gradients: &[f32],
    ) -> TrainingResult<StepStats> {
        let aggregated = shadow.aggregate_gradients(gradients)?;
        self.apply_unique_gradients(shadow, &aggregated)
    }

    /// Applies gradients given per unique id of the shadow's lookup.
    ///
    /// # Errors
    ///
    /// Same as [`apply_gradients`](Self::apply_gradients), with `gradients`
    /// expected to hold `ids * dim` values.
    pub fn apply_unique_gradients(
        &self,
        shadow: &mut ShadowVariable,
        gradients: &[f32],
    ) -> TrainingResult<StepStats> {
        let dim = shadow.dim();
        let expected = shadow.ids().len() * dim;
        if gradients.len() != expected {
            return Err(TrainingError::ShapeMismatch {
                expected,
                actual: gradients.len(),
            });
        }
        shadow.ensure_pending()?;

        let old = shadow.read_value(false);
        let mut rows = old.to_vec();
        let undo = self
            .slots
            .apply(self.optimizer.as_ref(), shadow.ids(), &mut rows, gradients)?;
        let clipped = match shadow.max_norm() {
            Some(max_norm) => clip_rows(&mut rows, dim, max_norm),
            None => 0,
        };

        let table = shadow.table();
        let written = match table.update_mode() {
            UpdateMode::Direct => table.upsert(shadow.ids(), &rows).map(|()| 0),
            UpdateMode::Incremental => {
                // Rows that were absent are inserted whole; present rows
                // receive only the change.
                let deltas: Vec<f32> = rows
                    .chunks_exact(dim)
                    .zip(old.chunks_exact(dim))
                    .zip(shadow.exists())
                    .flat_map(|((new, old), &existed)| {
                        new.iter()
                            .zip(old)
                            .map(move |(n, o)| if existed { n - o } else { *n })
                    })
                    .collect();
                table
                    .accum(shadow.ids(), &deltas, shadow.exists())
                    .map(|outcome| outcome.skipped)
            }
        };
        let skipped = match written {
            Ok(skipped) => skipped,
            Err(e) => {
                // A direct write can be retried from the same shadow; a
                // partial incremental one cannot.
                self.slots.revert(undo);
                warn!(
                    shadow = %shadow.name(),
                    table = %table.name(),
                    error = %e,
                    "Table write failed, optimizer slots reverted"
                );
                if table.update_mode() == UpdateMode::Incremental {
                    shadow.invalidate();
                }
                return Err(e.into());
            }
        };

        let stats = StepStats {
            rows: shadow.ids().len(),
            clipped,
            skipped,
        };
        debug!(
            shadow = %shadow.name(),
            table = %table.name(),
            optimizer = self.optimizer.config().name(),
            rows = stats.rows,
            clipped = stats.clipped,
            skipped = stats.skipped,
            "Applied optimizer step"
        );
        shadow.mark_applied(rows);
        Ok(stats)
    }

    /// Drops slot state of keys that are no longer in `table`, returning how
    /// many were dropped.
    pub fn prune_slots(&self, table: &DynamicEmbeddingTable) -> usize {
        let pruned = self.slots.retain(|key| table.contains(key));
        if pruned > 0 {
            info!(
                table = %table.name(),
                pruned,
                remaining = self.slots.len(),
                "Pruned optimizer slots"
            );
        }
        pruned
    }
}

/// Scales every row whose L2 norm exceeds `max_norm` back onto the norm
/// ball, returning how many rows were scaled.
fn clip_rows(rows: &mut [f32], dim: usize, max_norm: f32) -> usize {
    let mut clipped = 0;
    for row in rows.chunks_exact_mut(dim) {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > max_norm {
            let scale = max_norm / norm;
            row.iter_mut().for_each(|v| *v *= scale);
            clipped += 1;
        }
    }
    clipped
}
