//! The sharded dynamic embedding table.
//!
//! A [`DynamicEmbeddingTable`] maps sparse integer keys to dense `f32` rows of
//! a fixed dimension. Keys are routed to shards by a [`Partitioner`]; each
//! shard grows on demand, so the table accepts an unbounded key space. Misses
//! are answered with defaults from an [`Initializer`], and an optional
//! [`RestrictPolicy`] tracks per-key scores used to bound the table's size.
//!
//! Batched operations group keys per shard, run the per-shard work in
//! parallel on the rayon pool and reassemble results in the caller's key
//! order. A batch spanning several shards is not atomic across shards.
//!
//! # Example
//!
//! ```
//! use dynemb_hash_table::{DynamicEmbeddingTable, InitializerConfig, TableConfig};
//!
//! let config = TableConfig::new("items", 2)
//!     .with_num_shards(2)
//!     .with_initializer(InitializerConfig::Constant { value: 0.1 });
//! let table = DynamicEmbeddingTable::new(config).unwrap();
//!
//! table.upsert(&[2, 5], &[1.0, 1.0, 1.0, 1.0]).unwrap();
//! let values = table.lookup(&[2, 5, 8]).unwrap();
//! assert_eq!(values, vec![1.0, 1.0, 1.0, 1.0, 0.1, 0.1]);
//! assert_eq!(table.size(), 2);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{KeyDtype, TableConfig, UpdateMode};
use crate::error::{EmbeddingError, Result};
use crate::initializer::Initializer;
use crate::partitioner::{group_by_shard, ModuloPartitioner, Partitioner};
use crate::restrict::{RestrictPolicy, RestrictRequest, Touch};
use crate::shard::{AccumStats, KvShard};

/// Collects `src[p]` for every position `p`.
fn gather<T: Copy>(src: &[T], positions: &[usize]) -> Vec<T> {
    positions.iter().map(|&p| src[p]).collect()
}

/// Collects the `dim`-wide rows of `src` at `positions`.
fn gather_rows(src: &[f32], positions: &[usize], dim: usize) -> Vec<f32> {
    let mut rows = Vec::with_capacity(positions.len() * dim);
    for &p in positions {
        rows.extend_from_slice(&src[p * dim..(p + 1) * dim]);
    }
    rows
}

fn build_shards(config: &TableConfig, num_shards: usize) -> Result<Vec<KvShard>> {
    let per_shard = config.init_capacity_per_shard(num_shards);
    (0..num_shards)
        .map(|index| {
            KvShard::new(
                index,
                config.dim,
                per_shard,
                config.max_load_factor,
                config.max_capacity,
            )
        })
        .collect()
}

/// Builder for a [`DynamicEmbeddingTable`] with injected plug-ins.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use dynemb_hash_table::{
///     FnPartitioner, TableBuilder, TableConfig, TimestampRestrictPolicy,
/// };
///
/// fn reversed(key: i64, n: usize) -> usize {
///     n - 1 - key.rem_euclid(n as i64) as usize
/// }
///
/// let table = TableBuilder::new(TableConfig::new("users", 8).with_num_shards(4))
///     .partitioner(Arc::new(FnPartitioner::new("reversed", reversed)))
///     .restrict_policy(Arc::new(TimestampRestrictPolicy))
///     .build()
///     .unwrap();
/// assert_eq!(table.num_shards(), 4);
/// ```
pub struct TableBuilder {
    config: TableConfig,
    partitioner: Option<Arc<dyn Partitioner>>,
    initializer: Option<Arc<dyn Initializer>>,
    restrict_policy: Option<Arc<dyn RestrictPolicy>>,
}

impl TableBuilder {
    /// Starts a builder from `config`.
    pub fn new(config: TableConfig) -> Self {
        Self {
            config,
            partitioner: None,
            initializer: None,
            restrict_policy: None,
        }
    }

    /// Routes keys with `partitioner` instead of floor-mod.
    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    /// Uses `initializer` instead of the one in the config.
    pub fn initializer(mut self, initializer: Arc<dyn Initializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Enables restriction with `policy`.
    pub fn restrict_policy(mut self, policy: Arc<dyn RestrictPolicy>) -> Self {
        self.restrict_policy = Some(policy);
        self
    }

    /// Validates the configuration and allocates the shards.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] for invalid settings and
    /// [`EmbeddingError::CapacityExhausted`] if the initial shards cannot be
    /// allocated.
    pub fn build(self) -> Result<DynamicEmbeddingTable> {
        self.config.validate()?;
        let initializer = match self.initializer {
            Some(initializer) => initializer,
            None => self.config.initializer.build()?,
        };
        let partitioner = self
            .partitioner
            .unwrap_or_else(|| Arc::new(ModuloPartitioner));
        let shards = build_shards(&self.config, self.config.num_shards)?;

        info!(
            table = %self.config.name,
            dim = self.config.dim,
            num_shards = self.config.num_shards,
            partitioner = partitioner.name(),
            initializer = initializer.name(),
            restrict_policy = self.restrict_policy.as_ref().map(|p| p.name()).unwrap_or("none"),
            "Created dynamic embedding table"
        );

        Ok(DynamicEmbeddingTable {
            config: self.config,
            shards: RwLock::new(shards),
            partitioner,
            initializer,
            restrict_policy: self.restrict_policy,
            clock: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        })
    }
}

/// A sharded, dynamically growable key-value store of embedding rows.
///
/// All operations take `&self`; share the table across threads with an
/// [`Arc`].
pub struct DynamicEmbeddingTable {
    config: TableConfig,
    shards: RwLock<Vec<KvShard>>,
    partitioner: Arc<dyn Partitioner>,
    initializer: Arc<dyn Initializer>,
    restrict_policy: Option<Arc<dyn RestrictPolicy>>,
    /// Logical clock for restrict scores, advanced once per touched key.
    clock: AtomicU64,
    /// Bumped whenever the contents are replaced wholesale.
    epoch: AtomicU64,
}

impl std::fmt::Debug for DynamicEmbeddingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicEmbeddingTable")
            .field("name", &self.config.name)
            .field("dim", &self.config.dim)
            .field("num_shards", &self.num_shards())
            .field("size", &self.size())
            .field("partitioner", &self.partitioner.name())
            .field("initializer", &self.initializer.name())
            .field(
                "restrict_policy",
                &self.restrict_policy.as_ref().map(|p| p.name().to_string()),
            )
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl DynamicEmbeddingTable {
    /// Creates a table with the default partitioner and the configured
    /// initializer.
    ///
    /// # Errors
    ///
    /// See [`TableBuilder::build`].
    pub fn new(config: TableConfig) -> Result<Self> {
        TableBuilder::new(config).build()
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the embedding dimension.
    pub fn dim(&self) -> usize {
        self.config.dim
    }

    /// Returns the configuration the table was built with.
    ///
    /// `num_shards` reflects construction; see [`num_shards`](Self::num_shards)
    /// for the current count.
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Returns the key dtype.
    pub fn key_dtype(&self) -> KeyDtype {
        self.config.key_dtype
    }

    /// Returns the optimizer write-back mode.
    pub fn update_mode(&self) -> UpdateMode {
        self.config.update_mode
    }

    /// Returns the current number of shards.
    pub fn num_shards(&self) -> usize {
        self.shards.read().len()
    }

    /// Returns the partitioner routing keys to shards.
    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.partitioner
    }

    /// Returns the restrict policy, if any.
    pub fn restrict_policy(&self) -> Option<&Arc<dyn RestrictPolicy>> {
        self.restrict_policy.as_ref()
    }

    /// Returns the current epoch.
    ///
    /// The epoch changes whenever the table's contents are replaced as a
    /// whole ([`clear`](Self::clear), [`repartition`](Self::repartition),
    /// [`import_replace`](Self::import_replace)). Holders of fetched rows use
    /// it to detect that their rows no longer belong to this table state.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Returns the current value of the logical restrict clock.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn check_shape(&self, key_count: usize, values_len: usize) -> Result<()> {
        let expected = key_count * self.config.dim;
        if values_len != expected {
            return Err(EmbeddingError::ShapeMismatch {
                key_count,
                expected,
                actual: values_len,
            });
        }
        Ok(())
    }

    fn route(&self, keys: &[i64], num_shards: usize) -> Result<Vec<Vec<usize>>> {
        group_by_shard(self.partitioner.as_ref(), keys, num_shards).map_err(|(key, shard)| {
            EmbeddingError::Configuration(format!(
                "partitioner '{}' routed key {key} to shard {shard}, table '{}' has {num_shards}",
                self.partitioner.name(),
                self.config.name
            ))
        })
    }

    /// Reserves one clock tick per key when a restrict policy is configured.
    fn ticks(&self, key_count: usize) -> Option<Vec<u64>> {
        self.restrict_policy.as_ref()?;
        let base = self.clock.fetch_add(key_count as u64, Ordering::Relaxed);
        Some((1..=key_count as u64).map(|i| base + i).collect())
    }

    fn touch<'a>(&'a self, ticks: Option<&'a [u64]>) -> Option<Touch<'a>> {
        let policy = self.restrict_policy.as_deref()?;
        Some(Touch {
            policy,
            ticks: ticks?,
        })
    }

    /// Validates and routes `keys`, then runs `op` on every shard with its
    /// positions and the ticks of those positions.
    fn dispatch<T, F>(&self, keys: &[i64], op: F) -> Result<(Vec<Vec<usize>>, Vec<T>)>
    where
        T: Send,
        F: Fn(&KvShard, &[usize], Option<Touch<'_>>) -> Result<T> + Sync,
    {
        self.config.key_dtype.validate(keys)?;
        let shards = self.shards.read();
        let groups = self.route(keys, shards.len())?;
        let ticks = self.ticks(keys.len());

        let results = shards
            .par_iter()
            .zip(groups.par_iter())
            .map(|(shard, positions)| {
                let shard_ticks = ticks.as_ref().map(|t| gather(t, positions));
                op(shard, positions, self.touch(shard_ticks.as_deref()))
            })
            .collect::<Result<Vec<T>>>()?;
        Ok((groups, results))
    }

    /// Scatters per-shard `(rows, found)` results back into key order.
    fn reassemble(
        &self,
        key_count: usize,
        groups: &[Vec<usize>],
        parts: Vec<(Vec<f32>, Vec<bool>)>,
    ) -> (Vec<f32>, Vec<bool>) {
        let dim = self.config.dim;
        let mut values = vec![0.0; key_count * dim];
        let mut exists = vec![false; key_count];
        for (positions, (rows, found)) in groups.iter().zip(parts) {
            for (i, &pos) in positions.iter().enumerate() {
                values[pos * dim..(pos + 1) * dim].copy_from_slice(&rows[i * dim..(i + 1) * dim]);
                exists[pos] = found[i];
            }
        }
        (values, exists)
    }

    /// Inserts or overwrites the rows of `keys`.
    ///
    /// `values` is row-major with `keys.len() * dim` elements. Within one
    /// call, the last occurrence of a duplicated key wins.
    ///
    /// # Errors
    ///
    /// * [`EmbeddingError::ShapeMismatch`] if `values` has the wrong length
    /// * [`EmbeddingError::TypeMismatch`] if a key doesn't fit the key dtype
    /// * [`EmbeddingError::CapacityExhausted`] if a shard cannot grow; other
    ///   shards of the batch may already have been written
    pub fn upsert(&self, keys: &[i64], values: &[f32]) -> Result<()> {
        self.check_shape(keys.len(), values.len())?;
        let dim = self.config.dim;
        let (_, inserted) = self.dispatch(keys, |shard, positions, touch| {
            shard.upsert(
                &gather(keys, positions),
                &gather_rows(values, positions, dim),
                touch,
            )
        })?;
        debug!(
            table = %self.config.name,
            keys = keys.len(),
            inserted = inserted.iter().sum::<usize>(),
            "Upserted rows"
        );
        Ok(())
    }

    /// Looks up the rows of `keys` in key order.
    ///
    /// Missing keys get a fresh default from the initializer; they are not
    /// inserted.
    pub fn lookup(&self, keys: &[i64]) -> Result<Vec<f32>> {
        self.lookup_with_exists(keys).map(|(values, _)| values)
    }

    /// Looks up the rows of `keys` and reports which keys were stored.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] if the initializer produces
    /// rows of the wrong width, plus the key checks of
    /// [`upsert`](Self::upsert).
    pub fn lookup_with_exists(&self, keys: &[i64]) -> Result<(Vec<f32>, Vec<bool>)> {
        let initializer = self.initializer.as_ref();
        let (groups, parts) = self.dispatch(keys, |shard, positions, touch| {
            shard.lookup(&gather(keys, positions), initializer, touch)
        })?;
        Ok(self.reassemble(keys.len(), &groups, parts))
    }

    /// Looks up the rows of `keys`, inserting defaults for missing keys.
    ///
    /// The check and the insert happen under the shard's write lock, so
    /// concurrent callers missing the same key all observe one value. The
    /// returned mask reports whether each key was stored before this call.
    pub fn lookup_or_insert(&self, keys: &[i64]) -> Result<(Vec<f32>, Vec<bool>)> {
        let initializer = self.initializer.as_ref();
        let (groups, parts) = self.dispatch(keys, |shard, positions, touch| {
            shard.lookup_or_insert(&gather(keys, positions), initializer, touch)
        })?;
        Ok(self.reassemble(keys.len(), &groups, parts))
    }

    /// Adds `deltas` to the rows of `keys`, guarded by `exists`.
    ///
    /// `exists` is the mask returned when the rows were fetched. A key that
    /// existed gets its delta added; a key that did not exist is inserted
    /// with the delta as its value. Keys whose presence changed in between
    /// are skipped and counted in the returned stats.
    ///
    /// # Errors
    ///
    /// [`EmbeddingError::ShapeMismatch`] if `deltas` or `exists` don't match
    /// `keys`, plus the errors of [`upsert`](Self::upsert).
    pub fn accum(&self, keys: &[i64], deltas: &[f32], exists: &[bool]) -> Result<AccumStats> {
        self.check_shape(keys.len(), deltas.len())?;
        if exists.len() != keys.len() {
            return Err(EmbeddingError::ShapeMismatch {
                key_count: keys.len(),
                expected: keys.len(),
                actual: exists.len(),
            });
        }
        let dim = self.config.dim;
        let (_, parts) = self.dispatch(keys, |shard, positions, touch| {
            shard.accum(
                &gather(keys, positions),
                &gather_rows(deltas, positions, dim),
                &gather(exists, positions),
                touch,
            )
        })?;

        let mut stats = AccumStats::default();
        parts.into_iter().for_each(|part| stats.merge(part));
        if stats.skipped > 0 {
            warn!(
                table = %self.config.name,
                skipped = stats.skipped,
                "Skipped accumulation for keys inserted or removed since lookup"
            );
        }
        Ok(stats)
    }

    /// Removes `keys`, returning how many were present.
    pub fn remove(&self, keys: &[i64]) -> Result<usize> {
        let (_, removed) = self.dispatch(keys, |shard, positions, _| {
            Ok(shard.remove(&gather(keys, positions)))
        })?;
        Ok(removed.into_iter().sum())
    }

    /// Returns true if `key` is stored.
    pub fn contains(&self, key: i64) -> bool {
        let shards = self.shards.read();
        let index = self.partitioner.partition(key, shards.len());
        shards.get(index).is_some_and(|shard| shard.contains(key))
    }

    /// Removes every entry and bumps the epoch.
    pub fn clear(&self) {
        let shards = self.shards.read();
        shards.iter().for_each(KvShard::clear);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        info!(table = %self.config.name, epoch, "Cleared table");
    }

    /// Total number of stored keys.
    pub fn size(&self) -> usize {
        self.shards.read().iter().map(KvShard::len).sum()
    }

    /// Returns true if the table holds no keys.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of stored keys per shard.
    pub fn shard_sizes(&self) -> Vec<usize> {
        self.shards.read().iter().map(KvShard::len).collect()
    }

    /// Number of keys the table holds before any shard has to grow.
    pub fn capacity(&self) -> usize {
        self.shards.read().iter().map(KvShard::capacity).sum()
    }

    /// Approximate heap footprint of all shards in bytes.
    pub fn memory_usage(&self) -> usize {
        self.shards.read().iter().map(KvShard::memory_usage).sum()
    }

    /// Snapshot of all keys and their row-major values.
    ///
    /// Each shard is read under its own lock; the result is a concatenation
    /// of per-shard snapshots.
    pub fn export(&self) -> (Vec<i64>, Vec<f32>) {
        let (keys, values, _) = self.export_with_scores();
        (keys, values)
    }

    /// Like [`export`](Self::export), including the restrict score of each
    /// key.
    pub fn export_with_scores(&self) -> (Vec<i64>, Vec<f32>, Vec<u64>) {
        let shards = self.shards.read();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut scores = Vec::new();
        for shard in shards.iter() {
            let (k, v, s) = shard.export_with_scores();
            keys.extend(k);
            values.extend(v);
            scores.extend(s);
        }
        (keys, values, scores)
    }

    /// Upserts an export produced by a table of width `dim`.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::DimensionMismatch`] if `dim` differs from
    /// this table's dimension.
    pub fn import(&self, keys: &[i64], values: &[f32], dim: usize) -> Result<()> {
        self.check_dim(dim)?;
        self.upsert(keys, values)?;
        info!(table = %self.config.name, keys = keys.len(), "Imported rows");
        Ok(())
    }

    /// Replaces the whole contents with an export, restoring restrict scores
    /// when given, and bumps the epoch.
    ///
    /// The rows are loaded into fresh shards that replace the current ones
    /// only once every row fits, so a failed import leaves the contents and
    /// the epoch untouched. The restrict clock is advanced past the largest
    /// restored score so later touches rank as more recent.
    ///
    /// # Errors
    ///
    /// * [`EmbeddingError::DimensionMismatch`] if `dim` differs
    /// * [`EmbeddingError::ShapeMismatch`] if `values` or `scores` don't
    ///   match `keys`
    /// * [`EmbeddingError::CapacityExhausted`] if a shard cannot hold its rows
    pub fn import_replace(
        &self,
        keys: &[i64],
        values: &[f32],
        scores: Option<&[u64]>,
        dim: usize,
    ) -> Result<()> {
        self.check_dim(dim)?;
        self.check_shape(keys.len(), values.len())?;
        let zeros;
        let scores = match scores {
            Some(scores) if scores.len() != keys.len() => {
                return Err(EmbeddingError::ShapeMismatch {
                    key_count: keys.len(),
                    expected: keys.len(),
                    actual: scores.len(),
                })
            }
            Some(scores) => scores,
            None => {
                zeros = vec![0; keys.len()];
                &zeros
            }
        };
        self.config.key_dtype.validate(keys)?;

        let mut shards = self.shards.write();
        let groups = self.route(keys, shards.len())?;
        let rebuilt = build_shards(&self.config, shards.len())?;
        let dim = self.config.dim;
        rebuilt
            .par_iter()
            .zip(groups.par_iter())
            .try_for_each(|(shard, positions)| {
                shard.restore(
                    &gather(keys, positions),
                    &gather_rows(values, positions, dim),
                    &gather(scores, positions),
                )
            })?;
        *shards = rebuilt;
        if let Some(&max_score) = scores.iter().max() {
            self.clock.fetch_max(max_score, Ordering::Relaxed);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        info!(table = %self.config.name, keys = keys.len(), epoch, "Replaced table contents");
        Ok(())
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim != self.config.dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.config.dim,
                actual: dim,
            });
        }
        Ok(())
    }

    /// Changes the number of shards, moving every entry (with its restrict
    /// score) to the shard the partitioner now assigns it, and bumps the
    /// epoch.
    ///
    /// Holds the table-wide shard lock for the whole move, so no other
    /// operation observes a partial layout.
    pub fn repartition(&self, num_shards: usize) -> Result<()> {
        if num_shards == 0 {
            return Err(EmbeddingError::Configuration(format!(
                "table '{}': num_shards must be greater than 0",
                self.config.name
            )));
        }
        let mut shards = self.shards.write();
        let old_shards = shards.len();

        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut scores = Vec::new();
        for shard in shards.iter() {
            let (k, v, s) = shard.export_with_scores();
            keys.extend(k);
            values.extend(v);
            scores.extend(s);
        }

        let rebuilt = build_shards(&self.config, num_shards)?;
        let groups = self.route(&keys, num_shards)?;
        let dim = self.config.dim;
        rebuilt
            .par_iter()
            .zip(groups.par_iter())
            .try_for_each(|(shard, positions)| {
                shard.restore(
                    &gather(&keys, positions),
                    &gather_rows(&values, positions, dim),
                    &gather(&scores, positions),
                )
            })?;
        *shards = rebuilt;

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            table = %self.config.name,
            from = old_shards,
            to = num_shards,
            keys = keys.len(),
            epoch,
            "Repartitioned table"
        );
        Ok(())
    }

    /// Evicts keys chosen by the restrict policy until `request` holds.
    ///
    /// Returns the number of evicted keys. A key touched between victim
    /// selection and removal is kept, so a concurrent writer can leave the
    /// table slightly above the requested size.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] if the table has no restrict
    /// policy or the request is invalid for it.
    pub fn restrict(&self, request: &RestrictRequest) -> Result<usize> {
        let policy = self.restrict_policy.as_ref().ok_or_else(|| {
            EmbeddingError::Configuration(format!(
                "table '{}' has no restrict policy",
                self.config.name
            ))
        })?;
        request.validate()?;

        let shards = self.shards.read();
        let size: usize = shards.iter().map(KvShard::len).sum();
        if request.trigger.is_some_and(|trigger| size <= trigger) {
            debug!(table = %self.config.name, size, "Below restrict trigger");
            return Ok(0);
        }

        let candidates: Vec<(i64, u64)> = shards.iter().flat_map(KvShard::scores).collect();
        let victims = policy.select_victims(candidates, request, self.clock())?;
        let victim_keys: Vec<i64> = victims.iter().map(|&(key, _)| key).collect();
        let groups = self.route(&victim_keys, shards.len())?;
        let evicted: usize = shards
            .par_iter()
            .zip(groups.par_iter())
            .map(|(shard, positions)| shard.remove_if_unchanged(&gather(&victims, positions)))
            .sum();

        info!(
            table = %self.config.name,
            policy = policy.name(),
            before = size,
            selected = victims.len(),
            evicted,
            "Restricted table"
        );
        Ok(evicted)
    }

    /// Returns the restrict score of each key, `None` for absent keys.
    pub fn status(&self, keys: &[i64]) -> Result<Vec<Option<u64>>> {
        self.config.key_dtype.validate(keys)?;
        let shards = self.shards.read();
        let groups = self.route(keys, shards.len())?;
        let mut status = vec![None; keys.len()];
        for (shard, positions) in shards.iter().zip(&groups) {
            let part = shard.status(&gather(keys, positions));
            for (&pos, score) in positions.iter().zip(part) {
                status[pos] = score;
            }
        }
        Ok(status)
    }

    /// Runs `f` on the shard with the given index.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::InvalidShardIndex`] if `index` is out of range.
    pub fn with_shard<R>(&self, index: usize, f: impl FnOnce(&KvShard) -> R) -> Result<R> {
        let shards = self.shards.read();
        let num_shards = shards.len();
        shards
            .get(index)
            .map(f)
            .ok_or(EmbeddingError::InvalidShardIndex { index, num_shards })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::InitializerConfig;
    use crate::partitioner::FnPartitioner;
    use crate::restrict::TimestampRestrictPolicy;

    fn table(dim: usize, num_shards: usize) -> DynamicEmbeddingTable {
        DynamicEmbeddingTable::new(
            TableConfig::new("test", dim)
                .with_num_shards(num_shards)
                .with_init_capacity(16)
                .with_initializer(InitializerConfig::Zeros),
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_preserves_key_order_across_shards() {
        let table = table(1, 3);
        let keys: Vec<i64> = (-5..10).collect();
        let values: Vec<f32> = keys.iter().map(|&k| k as f32).collect();
        table.upsert(&keys, &values).unwrap();

        let query = vec![9, -5, 4, 100, 0];
        let (out, exists) = table.lookup_with_exists(&query).unwrap();
        assert_eq!(out, vec![9.0, -5.0, 4.0, 0.0, 0.0]);
        assert_eq!(exists, vec![true, true, true, false, true]);
        assert_eq!(table.size(), 15);
        assert_eq!(table.shard_sizes().iter().sum::<usize>(), 15);
    }

    #[test]
    fn test_shape_mismatch_reports_lengths() {
        let table = table(4, 2);
        let err = table.upsert(&[1, 2, 3], &[0.0; 8]).unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::ShapeMismatch {
                key_count: 3,
                expected: 12,
                actual: 8
            }
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_bad_partitioner_is_configuration_error() {
        let table = TableBuilder::new(TableConfig::new("bad", 1).with_num_shards(2))
            .partitioner(Arc::new(FnPartitioner::new("overflow", |_, n| n)))
            .build()
            .unwrap();
        let err = table.upsert(&[1], &[1.0]).unwrap_err();
        assert!(matches!(err, EmbeddingError::Configuration(msg) if msg.contains("overflow")));
    }

    #[test]
    fn test_int32_table_rejects_wide_keys() {
        let table = DynamicEmbeddingTable::new(
            TableConfig::new("narrow", 1).with_key_dtype(KeyDtype::Int32),
        )
        .unwrap();
        let err = table.upsert(&[1 << 40], &[1.0]).unwrap_err();
        assert!(matches!(err, EmbeddingError::TypeMismatch { .. }));
    }

    #[test]
    fn test_import_dimension_mismatch() {
        let table = table(4, 1);
        let err = table.import(&[1], &[0.0; 3], 3).unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_clear_and_repartition_bump_epoch() {
        let table = table(2, 2);
        let keys: Vec<i64> = (0..50).collect();
        let values: Vec<f32> = keys.iter().flat_map(|&k| [k as f32, -(k as f32)]).collect();
        table.upsert(&keys, &values).unwrap();
        assert_eq!(table.epoch(), 0);

        table.repartition(5).unwrap();
        assert_eq!(table.epoch(), 1);
        assert_eq!(table.num_shards(), 5);
        assert_eq!(table.size(), 50);
        assert_eq!(table.lookup(&keys).unwrap(), values);
        for (index, &size) in table.shard_sizes().iter().enumerate() {
            assert_eq!(size, 10, "shard {index}");
        }

        table.clear();
        assert_eq!(table.epoch(), 2);
        assert!(table.is_empty());
        assert!(table.repartition(0).is_err());
    }

    #[test]
    fn test_restrict_without_policy_fails() {
        let table = table(1, 1);
        let err = table.restrict(&RestrictRequest::max_entries(1)).unwrap_err();
        assert!(matches!(err, EmbeddingError::Configuration(_)));
    }

    #[test]
    fn test_restrict_trigger_and_status() {
        let table = TableBuilder::new(TableConfig::new("r", 1).with_num_shards(2))
            .restrict_policy(Arc::new(TimestampRestrictPolicy))
            .build()
            .unwrap();
        table.upsert(&[1, 2, 3, 4], &[0.0; 4]).unwrap();
        assert_eq!(
            table.status(&[1, 4, 9]).unwrap(),
            vec![Some(1), Some(4), None]
        );

        let request = RestrictRequest::max_entries(2).with_trigger(4);
        assert_eq!(table.restrict(&request).unwrap(), 0);
        assert_eq!(table.size(), 4);

        // Touch key 1 so it becomes the most recent.
        table.lookup(&[1]).unwrap();
        assert_eq!(table.restrict(&RestrictRequest::max_entries(2)).unwrap(), 2);
        let mut remaining = table.export().0;
        remaining.sort_unstable();
        assert_eq!(remaining, vec![1, 4]);
    }

    #[test]
    fn test_import_replace_restores_scores() {
        let table = TableBuilder::new(TableConfig::new("r", 2))
            .restrict_policy(Arc::new(TimestampRestrictPolicy))
            .build()
            .unwrap();
        table.upsert(&[99], &[9.0, 9.0]).unwrap();
        table
            .import_replace(&[1, 2], &[1.0, 1.0, 2.0, 2.0], Some(&[40, 50]), 2)
            .unwrap();
        assert!(!table.contains(99));
        assert_eq!(table.status(&[1, 2]).unwrap(), vec![Some(40), Some(50)]);
        assert_eq!(table.epoch(), 1);

        table.upsert(&[3], &[3.0, 3.0]).unwrap();
        assert_eq!(table.status(&[3]).unwrap(), vec![Some(51)]);
    }

    #[test]
    fn test_failed_import_replace_keeps_contents_and_epoch() {
        let table = DynamicEmbeddingTable::new(
            TableConfig::new("bounded", 1)
                .with_init_capacity(4)
                .with_max_capacity(4),
        )
        .unwrap();
        table.upsert(&[1, 2, 3], &[1.0, 2.0, 3.0]).unwrap();

        let keys: Vec<i64> = (10..15).collect();
        let err = table
            .import_replace(&keys, &[0.5; 5], None, 1)
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::CapacityExhausted { .. }));
        assert_eq!(table.epoch(), 0);
        assert_eq!(table.size(), 3);
        assert_eq!(table.lookup(&[1, 2, 3]).unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(!table.contains(10));

        table.import_replace(&[10, 11], &[0.5, 0.5], None, 1).unwrap();
        assert_eq!(table.epoch(), 1);
        assert_eq!(table.size(), 2);
        assert!(!table.contains(1));
    }

    struct NarrowInitializer;

    impl Initializer for NarrowInitializer {
        fn initialize(&self, _dim: usize) -> Vec<f32> {
            vec![0.0]
        }

        fn name(&self) -> &str {
            "narrow"
        }
    }

    #[test]
    fn test_wrong_width_initializer_is_configuration_error() {
        let table = TableBuilder::new(TableConfig::new("narrow", 4).with_num_shards(2))
            .initializer(Arc::new(NarrowInitializer))
            .build()
            .unwrap();
        table.upsert(&[1], &[1.0; 4]).unwrap();

        assert_eq!(table.lookup(&[1]).unwrap(), vec![1.0; 4]);
        let err = table.lookup(&[1, 2]).unwrap_err();
        assert!(matches!(err, EmbeddingError::Configuration(msg) if msg.contains("narrow")));
        let err = table.lookup_or_insert(&[2, 3]).unwrap_err();
        assert!(matches!(err, EmbeddingError::Configuration(_)));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn test_with_shard_index_check() {
        let table = table(1, 2);
        assert_eq!(table.with_shard(1, |s| s.index()).unwrap(), 1);
        assert_eq!(
            table.with_shard(2, |s| s.index()).unwrap_err(),
            EmbeddingError::InvalidShardIndex {
                index: 2,
                num_shards: 2
            }
        );
    }
}
