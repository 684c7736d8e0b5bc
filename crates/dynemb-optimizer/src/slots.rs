//! Per-key optimizer state.
//!
//! Slot state belongs to an embedding key, not to a position in a batch:
//! the same key looked up at different offsets in different steps must keep
//! accumulating into the same velocity or moments. [`SlotStore`] keeps the
//! state in a side map keyed by embedding key and striped over shards with
//! the table's partitioner, so updates of different shards don't contend.

use std::sync::Arc;

use dynemb_hash_table::Partitioner;
use hashbrown::HashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Optimizer, OptimizerError};

/// Optimizer state of a single embedding row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SlotState {
    /// Stateless optimizers (SGD).
    None,
    /// Momentum velocity.
    Momentum {
        /// Velocity buffer.
        velocity: Vec<f32>,
    },
    /// Adagrad accumulator.
    Adagrad {
        /// Accumulated squared gradients.
        accumulator: Vec<f32>,
    },
    /// Adam moments and step count.
    Adam {
        /// First moment.
        m: Vec<f32>,
        /// Second moment.
        v: Vec<f32>,
        /// Number of updates applied to this row.
        t: u64,
    },
    /// FTRL linear and squared-gradient accumulators.
    Ftrl {
        /// Linear term.
        z: Vec<f32>,
        /// Accumulated squared gradients.
        n: Vec<f32>,
    },
}

impl SlotState {
    /// Returns the name of the optimizer type owning this state.
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::None => "None",
            SlotState::Momentum { .. } => "Momentum",
            SlotState::Adagrad { .. } => "Adagrad",
            SlotState::Adam { .. } => "Adam",
            SlotState::Ftrl { .. } => "Ftrl",
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_size(&self) -> usize {
        let floats = match self {
            SlotState::None => 0,
            SlotState::Momentum { velocity } => velocity.len(),
            SlotState::Adagrad { accumulator } => accumulator.len(),
            SlotState::Adam { m, v, .. } => m.len() + v.len(),
            SlotState::Ftrl { z, n } => z.len() + n.len(),
        };
        floats * std::mem::size_of::<f32>()
    }
}

/// Slot state of the keys touched by one [`SlotStore::apply`], as it was
/// before the step.
#[derive(Debug, Clone, Default)]
pub struct SlotUndo {
    entries: Vec<(i64, Option<SlotState>)>,
}

impl SlotUndo {
    /// Number of keys recorded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no key was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of stepping the keys of one stripe.
#[derive(Default)]
struct ShardStep {
    undo: Vec<(i64, Option<SlotState>)>,
    rows: Vec<(usize, Vec<f32>)>,
    error: Option<OptimizerError>,
}

/// Slot state for every key a table has trained, striped over shards.
///
/// The number of stripes is fixed at construction; it does not follow later
/// repartitioning of the table, which only changes lock striping here.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use dynemb_hash_table::ModuloPartitioner;
/// use dynemb_optimizer::{create_optimizer, OptimizerConfig, SlotStore};
///
/// let optimizer = create_optimizer(OptimizerConfig::Adagrad {
///     learning_rate: 0.1,
///     initial_accumulator: 0.1,
///     weight_decay: 0.0,
/// })
/// .unwrap();
/// let store = SlotStore::new(4, Arc::new(ModuloPartitioner));
///
/// let mut rows = vec![1.0, 1.0, 2.0, 2.0];
/// store
///     .apply(optimizer.as_ref(), &[7, 9], &mut rows, &[0.5, 0.5, 0.5, 0.5])
///     .unwrap();
/// assert_eq!(store.len(), 2);
/// ```
pub struct SlotStore {
    shards: Vec<Mutex<HashMap<i64, SlotState>>>,
    partitioner: Arc<dyn Partitioner>,
}

impl std::fmt::Debug for SlotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotStore")
            .field("num_shards", &self.shards.len())
            .field("len", &self.len())
            .field("partitioner", &self.partitioner.name())
            .finish()
    }
}

impl SlotStore {
    /// Creates an empty store with `num_shards` stripes (at least one).
    pub fn new(num_shards: usize, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            shards: (0..num_shards.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            partitioner,
        }
    }

    fn shard_of(&self, key: i64) -> usize {
        // Clamp so a misbehaving partitioner only degrades striping.
        self.partitioner.partition(key, self.shards.len()) % self.shards.len()
    }

    fn group(&self, keys: &[i64]) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.shards.len()];
        for (pos, &key) in keys.iter().enumerate() {
            groups[self.shard_of(key)].push(pos);
        }
        groups
    }

    /// Applies `gradients` to the row-major `rows` of `keys`, creating slot
    /// state for keys seen for the first time.
    ///
    /// `keys` must be unique; each shard is updated under its own lock and
    /// shards are processed in parallel. The returned [`SlotUndo`] holds the
    /// state each key had before the step, for [`revert`](Self::revert).
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::ShapeMismatch`] if `rows` or `gradients`
    /// don't hold `keys.len()` rows of equal width, and any error of
    /// [`Optimizer::apply_gradients`]. On error neither the slot state nor
    /// `rows` is changed.
    pub fn apply(
        &self,
        optimizer: &dyn Optimizer,
        keys: &[i64],
        rows: &mut [f32],
        gradients: &[f32],
    ) -> Result<SlotUndo, OptimizerError> {
        if keys.is_empty() {
            return Ok(SlotUndo::default());
        }
        let dim = rows.len() / keys.len();
        if dim == 0 || dim * keys.len() != rows.len() {
            return Err(OptimizerError::ShapeMismatch {
                expected: keys.len() * dim.max(1),
                actual: rows.len(),
            });
        }
        if gradients.len() != rows.len() {
            return Err(OptimizerError::ShapeMismatch {
                expected: rows.len(),
                actual: gradients.len(),
            });
        }

        let groups = self.group(keys);
        let source: &[f32] = rows;
        let outcomes: Vec<ShardStep> = self
            .shards
            .par_iter()
            .zip(groups.par_iter())
            .map(|(shard, positions)| {
                let mut map = shard.lock();
                let mut step = ShardStep::default();
                for &pos in positions {
                    let key = keys[pos];
                    let span = pos * dim..(pos + 1) * dim;
                    let mut row = source[span.clone()].to_vec();
                    let previous = map.get(&key).cloned();
                    let mut slots = previous.clone().unwrap_or_else(|| optimizer.new_slots(dim));
                    if let Err(e) = optimizer.apply_gradients(&mut row, &gradients[span], &mut slots)
                    {
                        step.error = Some(e);
                        break;
                    }
                    map.insert(key, slots);
                    step.undo.push((key, previous));
                    step.rows.push((pos, row));
                }
                step
            })
            .collect();

        let mut undo = SlotUndo::default();
        let mut updated = Vec::with_capacity(keys.len());
        let mut error = None;
        for step in outcomes {
            undo.entries.extend(step.undo);
            updated.extend(step.rows);
            if error.is_none() {
                error = step.error;
            }
        }
        if let Some(error) = error {
            self.revert(undo);
            return Err(error);
        }

        for (pos, row) in updated {
            rows[pos * dim..(pos + 1) * dim].copy_from_slice(&row);
        }
        Ok(undo)
    }

    /// Puts back the slot state recorded by [`apply`](Self::apply); keys that
    /// had no state lose it again.
    ///
    /// Steps applied to the same keys after `undo` was taken are discarded.
    pub fn revert(&self, undo: SlotUndo) {
        for (key, previous) in undo.entries {
            let mut map = self.shards[self.shard_of(key)].lock();
            match previous {
                Some(slots) => {
                    map.insert(key, slots);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }

    /// Returns a copy of the slot state of `key`.
    pub fn get(&self, key: i64) -> Option<SlotState> {
        self.shards[self.shard_of(key)].lock().get(&key).cloned()
    }

    /// Returns true if `key` has slot state.
    pub fn contains(&self, key: i64) -> bool {
        self.shards[self.shard_of(key)].lock().contains_key(&key)
    }

    /// Drops the slot state of `keys`, returning how many were present.
    pub fn remove(&self, keys: &[i64]) -> usize {
        let groups = self.group(keys);
        self.shards
            .iter()
            .zip(&groups)
            .map(|(shard, positions)| {
                let mut map = shard.lock();
                positions
                    .iter()
                    .filter(|&&pos| map.remove(&keys[pos]).is_some())
                    .count()
            })
            .sum()
    }

    /// Keeps only the keys for which `keep` returns true, returning how many
    /// were dropped.
    pub fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(i64) -> bool + Sync,
    {
        self.shards
            .par_iter()
            .map(|shard| {
                let mut map = shard.lock();
                let before = map.len();
                map.retain(|&key, _| keep(key));
                before - map.len()
            })
            .sum()
    }

    /// Number of keys with slot state.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns true if no key has slot state.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all slot state.
    pub fn clear(&self) {
        self.shards.iter().for_each(|shard| shard.lock().clear());
    }

    /// Approximate heap footprint of all slot state in bytes.
    pub fn memory_usage(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .values()
                    .map(|slots| slots.memory_size() + std::mem::size_of::<i64>())
                    .sum::<usize>()
            })
            .sum()
    }

    /// Snapshot of every `(key, state)` pair.
    pub fn export(&self) -> Vec<(i64, SlotState)> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .iter()
                    .map(|(&key, slots)| (key, slots.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Inserts or replaces slot state from a snapshot.
    pub fn import(&self, entries: impl IntoIterator<Item = (i64, SlotState)>) {
        for (key, slots) in entries {
            self.shards[self.shard_of(key)].lock().insert(key, slots);
        }
    }
}
