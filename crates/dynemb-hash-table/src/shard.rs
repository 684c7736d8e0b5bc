//! A single growable shard of a dynamic embedding table.
//!
//! Each shard is an open-addressing hash table with linear probing over a
//! power-of-two slot array. Values live in one flat `Vec<f32>` (`dim` floats
//! per slot) next to the key array, and every slot carries one atomic score
//! used by the table's restrict policy.
//!
//! # Concurrency
//!
//! The slot arrays sit behind a [`parking_lot::RwLock`]. Lookups take the read
//! lock and may run in parallel; score refreshes during a lookup go through
//! the per-slot atomics. Writes take the write lock.
//!
//! Growth allocates a new arena with twice the slots, migrates every entry and
//! swaps it in while the write lock is held. A reader therefore sees either
//! the old arena or the new one, never a half-migrated state. If the new
//! arena cannot be allocated the old one stays in place and the write fails
//! with [`EmbeddingError::CapacityExhausted`].

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashSet;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{EmbeddingError, Result};
use crate::initializer::Initializer;
use crate::restrict::Touch;

/// Smallest slot array a shard allocates.
const MIN_SLOTS: usize = 8;

/// Mixes a key into a slot hash.
///
/// The partitioner routes on the raw key, so keys within one shard share a
/// residue; hashing them again with the same modulus would pile them into a
/// fraction of the slots.
#[inline]
fn mix(key: i64) -> u64 {
    let mut z = (key as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Number of slots needed to hold `entries` below `max_load_factor`.
fn slots_for(entries: usize, max_load_factor: f64) -> usize {
    let wanted = (entries as f64 / max_load_factor).ceil() as usize;
    wanted.max(MIN_SLOTS).next_power_of_two()
}

/// Number of entries `slots` slots hold before the shard must grow.
fn threshold(slots: usize, max_load_factor: f64) -> usize {
    ((slots as f64 * max_load_factor).floor() as usize).min(slots - 1)
}

/// Outcome counts of an [`KvShard::accum`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumStats {
    /// Existing rows that received a delta.
    pub updated: usize,
    /// Absent rows inserted with the delta as their value.
    pub inserted: usize,
    /// Rows skipped because the key's presence changed since it was fetched.
    pub skipped: usize,
}

impl AccumStats {
    pub(crate) fn merge(&mut self, other: AccumStats) {
        self.updated += other.updated;
        self.inserted += other.inserted;
        self.skipped += other.skipped;
    }
}

/// Slot storage of a shard.
struct Arena {
    dim: usize,
    mask: usize,
    len: usize,
    keys: Vec<i64>,
    occupied: Vec<bool>,
    values: Vec<f32>,
    scores: Vec<AtomicU64>,
}

impl Arena {
    /// Allocates an empty arena, or `None` if the allocation fails.
    fn with_slots(slots: usize, dim: usize) -> Option<Self> {
        debug_assert!(slots.is_power_of_two());
        let value_len = slots.checked_mul(dim)?;

        let mut keys = Vec::new();
        keys.try_reserve_exact(slots).ok()?;
        keys.resize(slots, 0);

        let mut occupied = Vec::new();
        occupied.try_reserve_exact(slots).ok()?;
        occupied.resize(slots, false);

        let mut values = Vec::new();
        values.try_reserve_exact(value_len).ok()?;
        values.resize(value_len, 0.0);

        let mut scores = Vec::new();
        scores.try_reserve_exact(slots).ok()?;
        scores.extend((0..slots).map(|_| AtomicU64::new(0)));

        Some(Self {
            dim,
            mask: slots - 1,
            len: 0,
            keys,
            occupied,
            values,
            scores,
        })
    }

    #[inline]
    fn slots(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    fn home(&self, key: i64) -> usize {
        mix(key) as usize & self.mask
    }

    fn find(&self, key: i64) -> Option<usize> {
        let mut idx = self.home(key);
        while self.occupied[idx] {
            if self.keys[idx] == key {
                return Some(idx);
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Claims an empty slot for `key`. The caller guarantees the key is
    /// absent and that there is room.
    fn claim(&mut self, key: i64) -> usize {
        let mut idx = self.home(key);
        while self.occupied[idx] {
            idx = (idx + 1) & self.mask;
        }
        self.occupied[idx] = true;
        self.keys[idx] = key;
        self.len += 1;
        idx
    }

    #[inline]
    fn row(&self, idx: usize) -> &[f32] {
        &self.values[idx * self.dim..(idx + 1) * self.dim]
    }

    #[inline]
    fn row_mut(&mut self, idx: usize) -> &mut [f32] {
        &mut self.values[idx * self.dim..(idx + 1) * self.dim]
    }

    #[inline]
    fn score(&self, idx: usize) -> u64 {
        self.scores[idx].load(Ordering::Relaxed)
    }

    fn touch(&self, idx: usize, inserted: bool, touch: Option<&Touch<'_>>, pos: usize) {
        if let Some(touch) = touch {
            let tick = touch.ticks[pos];
            if inserted {
                self.scores[idx].store(touch.policy.touch(None, tick), Ordering::Relaxed);
            } else {
                // Concurrent readers may refresh the same slot.
                let _ = self.scores[idx].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                    Some(touch.policy.touch(Some(old), tick))
                });
            }
        }
    }

    /// Removes the entry at `idx` with backward-shift deletion, so collision
    /// chains stay intact without tombstones.
    fn remove_at(&mut self, idx: usize) {
        let mut hole = idx;
        self.occupied[hole] = false;
        self.len -= 1;

        let mut next = (hole + 1) & self.mask;
        while self.occupied[next] {
            let home = self.home(self.keys[next]);
            let displacement = next.wrapping_sub(home) & self.mask;
            let gap = next.wrapping_sub(hole) & self.mask;
            if displacement >= gap {
                self.keys[hole] = self.keys[next];
                self.occupied[hole] = true;
                self.values
                    .copy_within(next * self.dim..(next + 1) * self.dim, hole * self.dim);
                let score = self.score(next);
                self.scores[hole].store(score, Ordering::Relaxed);
                self.occupied[next] = false;
                hole = next;
            }
            next = (next + 1) & self.mask;
        }
    }

    /// Copies every entry into `target`, which must have room for them.
    fn migrate_into(&self, target: &mut Arena) {
        for idx in self.occupied_slots() {
            let new_idx = target.claim(self.keys[idx]);
            target.row_mut(new_idx).copy_from_slice(self.row(idx));
            target.scores[new_idx].store(self.score(idx), Ordering::Relaxed);
        }
    }

    fn occupied_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots()).filter(move |&idx| self.occupied[idx])
    }

    fn reset(&mut self) {
        self.occupied.iter_mut().for_each(|o| *o = false);
        self.len = 0;
    }

    fn memory_usage(&self) -> usize {
        let slots = self.slots();
        slots * std::mem::size_of::<i64>()
            + slots * std::mem::size_of::<bool>()
            + self.values.len() * std::mem::size_of::<f32>()
            + slots * std::mem::size_of::<AtomicU64>()
    }
}

/// One shard of a [`DynamicEmbeddingTable`](crate::DynamicEmbeddingTable).
///
/// Shards are independent: a write to one never blocks readers of another.
/// Within a shard, every key appears at most once and each stored value has
/// exactly `dim` elements.
pub struct KvShard {
    index: usize,
    dim: usize,
    max_load_factor: f64,
    max_capacity: Option<usize>,
    arena: RwLock<Arena>,
}

impl std::fmt::Debug for KvShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.read();
        f.debug_struct("KvShard")
            .field("index", &self.index)
            .field("dim", &self.dim)
            .field("len", &arena.len)
            .field("slots", &arena.slots())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

impl KvShard {
    /// Creates an empty shard sized to hold `init_capacity` entries without
    /// growing.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::CapacityExhausted`] if the initial slot
    /// array cannot be allocated.
    pub fn new(
        index: usize,
        dim: usize,
        init_capacity: usize,
        max_load_factor: f64,
        max_capacity: Option<usize>,
    ) -> Result<Self> {
        let slots = slots_for(init_capacity, max_load_factor);
        let arena = Arena::with_slots(slots, dim).ok_or(EmbeddingError::CapacityExhausted {
            shard: index,
            capacity: 0,
            requested: init_capacity,
        })?;
        Ok(Self {
            index,
            dim,
            max_load_factor,
            max_capacity,
            arena: RwLock::new(arena),
        })
    }

    /// Index of this shard within its table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Embedding dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.arena.read().len
    }

    /// Returns true if the shard holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries the shard holds before it has to grow.
    pub fn capacity(&self) -> usize {
        threshold(self.arena.read().slots(), self.max_load_factor)
    }

    /// Fraction of occupied slots.
    pub fn load_factor(&self) -> f64 {
        let arena = self.arena.read();
        arena.len as f64 / arena.slots() as f64
    }

    /// Approximate heap footprint of the slot arrays in bytes.
    pub fn memory_usage(&self) -> usize {
        self.arena.read().memory_usage()
    }

    /// Returns true if `key` is stored.
    pub fn contains(&self, key: i64) -> bool {
        self.arena.read().find(key).is_some()
    }

    /// Makes room for `incoming` new entries, growing the arena if needed.
    fn reserve(&self, arena: &mut Arena, incoming: usize) -> Result<()> {
        if incoming == 0 {
            return Ok(());
        }
        let needed = arena.len + incoming;
        if let Some(max_capacity) = self.max_capacity {
            if needed > max_capacity {
                return Err(EmbeddingError::CapacityExhausted {
                    shard: self.index,
                    capacity: max_capacity,
                    requested: needed,
                });
            }
        }
        if needed <= threshold(arena.slots(), self.max_load_factor) {
            return Ok(());
        }

        let exhausted = EmbeddingError::CapacityExhausted {
            shard: self.index,
            capacity: threshold(arena.slots(), self.max_load_factor),
            requested: needed,
        };
        let mut slots = arena.slots();
        while needed > threshold(slots, self.max_load_factor) {
            slots = slots.checked_mul(2).ok_or_else(|| exhausted.clone())?;
        }
        let mut grown = Arena::with_slots(slots, self.dim).ok_or(exhausted)?;
        arena.migrate_into(&mut grown);
        debug!(
            shard = self.index,
            from = arena.slots(),
            to = slots,
            len = arena.len,
            "Grew shard"
        );
        *arena = grown;
        Ok(())
    }

    /// Counts the distinct keys among `keys` that are not stored yet.
    fn count_new<'k>(arena: &Arena, keys: impl Iterator<Item = &'k i64>) -> usize {
        let mut seen = HashSet::new();
        keys.filter(|&&key| arena.find(key).is_none() && seen.insert(key))
            .count()
    }

    /// Produces a default row, rejecting initializers that return the wrong
    /// width.
    fn default_row(&self, initializer: &dyn Initializer) -> Result<Vec<f32>> {
        let row = initializer.initialize(self.dim);
        if row.len() != self.dim {
            return Err(EmbeddingError::Configuration(format!(
                "initializer '{}' produced {} values, shard {} has dim {}",
                initializer.name(),
                row.len(),
                self.index,
                self.dim
            )));
        }
        Ok(row)
    }

    /// Reads the values of `keys` into a flat buffer.
    ///
    /// Missing keys get a fresh default from `initializer` and are reported
    /// as `false` in the returned mask; nothing is inserted. Hits refresh
    /// their restrict score when `touch` is given.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] if the initializer produces
    /// a row that is not `dim` wide.
    pub(crate) fn lookup(
        &self,
        keys: &[i64],
        initializer: &dyn Initializer,
        touch: Option<Touch<'_>>,
    ) -> Result<(Vec<f32>, Vec<bool>)> {
        let arena = self.arena.read();
        let mut values = Vec::with_capacity(keys.len() * self.dim);
        let mut found = Vec::with_capacity(keys.len());
        for (pos, &key) in keys.iter().enumerate() {
            match arena.find(key) {
                Some(idx) => {
                    values.extend_from_slice(arena.row(idx));
                    arena.touch(idx, false, touch.as_ref(), pos);
                    found.push(true);
                }
                None => {
                    values.extend(self.default_row(initializer)?);
                    found.push(false);
                }
            }
        }
        Ok((values, found))
    }

    /// Like [`lookup`](Self::lookup), but missing keys are inserted with their
    /// default value under the same write lock.
    pub(crate) fn lookup_or_insert(
        &self,
        keys: &[i64],
        initializer: &dyn Initializer,
        touch: Option<Touch<'_>>,
    ) -> Result<(Vec<f32>, Vec<bool>)> {
        let mut arena = self.arena.write();
        let incoming = Self::count_new(&arena, keys.iter());
        self.reserve(&mut arena, incoming)?;

        let mut values = Vec::with_capacity(keys.len() * self.dim);
        let mut found = Vec::with_capacity(keys.len());
        for (pos, &key) in keys.iter().enumerate() {
            let (idx, inserted) = match arena.find(key) {
                Some(idx) => (idx, false),
                None => {
                    let row = self.default_row(initializer)?;
                    let idx = arena.claim(key);
                    arena.row_mut(idx).copy_from_slice(&row);
                    (idx, true)
                }
            };
            arena.touch(idx, inserted, touch.as_ref(), pos);
            values.extend_from_slice(arena.row(idx));
            found.push(!inserted);
        }
        Ok((values, found))
    }

    /// Inserts or overwrites rows. Within one call, the last occurrence of a
    /// duplicated key wins.
    ///
    /// Returns the number of newly inserted keys.
    pub(crate) fn upsert(
        &self,
        keys: &[i64],
        values: &[f32],
        touch: Option<Touch<'_>>,
    ) -> Result<usize> {
        let mut arena = self.arena.write();
        let incoming = Self::count_new(&arena, keys.iter());
        self.reserve(&mut arena, incoming)?;

        let mut inserted = 0;
        for (pos, (&key, row)) in keys.iter().zip(values.chunks_exact(self.dim)).enumerate() {
            let (idx, is_new) = match arena.find(key) {
                Some(idx) => (idx, false),
                None => (arena.claim(key), true),
            };
            arena.row_mut(idx).copy_from_slice(row);
            arena.touch(idx, is_new, touch.as_ref(), pos);
            inserted += usize::from(is_new);
        }
        Ok(inserted)
    }

    /// Inserts or overwrites rows together with their stored restrict scores.
    pub(crate) fn restore(&self, keys: &[i64], values: &[f32], scores: &[u64]) -> Result<()> {
        let mut arena = self.arena.write();
        let incoming = Self::count_new(&arena, keys.iter());
        self.reserve(&mut arena, incoming)?;

        for ((&key, row), &score) in keys.iter().zip(values.chunks_exact(self.dim)).zip(scores) {
            let idx = match arena.find(key) {
                Some(idx) => idx,
                None => arena.claim(key),
            };
            arena.row_mut(idx).copy_from_slice(row);
            arena.scores[idx].store(score, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Adds `deltas` to stored rows, guarded by the presence flags observed
    /// when the rows were fetched.
    ///
    /// * `exists[i]` and the key is present: the delta is added.
    /// * `!exists[i]` and the key is absent: the key is inserted with the
    ///   delta as its value.
    /// * Otherwise the key was inserted or removed concurrently and the row
    ///   is skipped.
    pub(crate) fn accum(
        &self,
        keys: &[i64],
        deltas: &[f32],
        exists: &[bool],
        touch: Option<Touch<'_>>,
    ) -> Result<AccumStats> {
        let mut arena = self.arena.write();
        let incoming = Self::count_new(
            &arena,
            keys.iter().zip(exists).filter(|(_, &e)| !e).map(|(k, _)| k),
        );
        self.reserve(&mut arena, incoming)?;

        let mut stats = AccumStats::default();
        for (pos, ((&key, delta), &existed)) in keys
            .iter()
            .zip(deltas.chunks_exact(self.dim))
            .zip(exists)
            .enumerate()
        {
            match (existed, arena.find(key)) {
                (true, Some(idx)) => {
                    arena
                        .row_mut(idx)
                        .iter_mut()
                        .zip(delta)
                        .for_each(|(v, d)| *v += d);
                    arena.touch(idx, false, touch.as_ref(), pos);
                    stats.updated += 1;
                }
                (false, None) => {
                    let idx = arena.claim(key);
                    arena.row_mut(idx).copy_from_slice(delta);
                    arena.touch(idx, true, touch.as_ref(), pos);
                    stats.inserted += 1;
                }
                _ => stats.skipped += 1,
            }
        }
        Ok(stats)
    }

    /// Removes `keys`, returning how many were present.
    pub(crate) fn remove(&self, keys: &[i64]) -> usize {
        let mut arena = self.arena.write();
        let mut removed = 0;
        for &key in keys {
            if let Some(idx) = arena.find(key) {
                arena.remove_at(idx);
                removed += 1;
            }
        }
        removed
    }

    /// Removes each `(key, score)` victim whose score is still the one
    /// observed when it was selected.
    pub(crate) fn remove_if_unchanged(&self, victims: &[(i64, u64)]) -> usize {
        let mut arena = self.arena.write();
        let mut removed = 0;
        for &(key, observed) in victims {
            if let Some(idx) = arena.find(key) {
                if arena.score(idx) == observed {
                    arena.remove_at(idx);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Removes every entry, keeping the allocated slots.
    pub(crate) fn clear(&self) {
        self.arena.write().reset();
    }

    /// Snapshot of all keys and their flattened values.
    pub fn export(&self) -> (Vec<i64>, Vec<f32>) {
        let arena = self.arena.read();
        let mut keys = Vec::with_capacity(arena.len);
        let mut values = Vec::with_capacity(arena.len * self.dim);
        for idx in arena.occupied_slots() {
            keys.push(arena.keys[idx]);
            values.extend_from_slice(arena.row(idx));
        }
        (keys, values)
    }

    /// Snapshot of all keys, flattened values and restrict scores, taken
    /// under one lock so the three stay aligned.
    pub fn export_with_scores(&self) -> (Vec<i64>, Vec<f32>, Vec<u64>) {
        let arena = self.arena.read();
        let mut keys = Vec::with_capacity(arena.len);
        let mut values = Vec::with_capacity(arena.len * self.dim);
        let mut scores = Vec::with_capacity(arena.len);
        for idx in arena.occupied_slots() {
            keys.push(arena.keys[idx]);
            values.extend_from_slice(arena.row(idx));
            scores.push(arena.score(idx));
        }
        (keys, values, scores)
    }

    /// Snapshot of all `(key, score)` pairs.
    pub fn scores(&self) -> Vec<(i64, u64)> {
        let arena = self.arena.read();
        arena
            .occupied_slots()
            .map(|idx| (arena.keys[idx], arena.score(idx)))
            .collect()
    }

    /// Restrict score of each key, `None` for absent keys.
    pub fn status(&self, keys: &[i64]) -> Vec<Option<u64>> {
        let arena = self.arena.read();
        keys.iter()
            .map(|&key| arena.find(key).map(|idx| arena.score(idx)))
            .collect()
    }
}
