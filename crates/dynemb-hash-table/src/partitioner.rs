//! Key-to-shard routing.
//!
//! A partitioner must be pure: the same key always maps to the same shard for
//! a given shard count. The shard count of a table only changes through
//! [`DynamicEmbeddingTable::repartition`](crate::DynamicEmbeddingTable::repartition).

use std::fmt;

/// Routes a key to one of `num_partitions` shards.
pub trait Partitioner: Send + Sync {
    /// Returns the shard index for `key`. Must be `< num_partitions`.
    fn partition(&self, key: i64, num_partitions: usize) -> usize;

    /// Returns the name of this partitioner, for logging.
    fn name(&self) -> &str;
}

/// Floor-mod routing: `key.rem_euclid(num_partitions)`.
///
/// Negative keys land on a non-negative shard (`-1 % 3 == 2`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuloPartitioner;

impl Partitioner for ModuloPartitioner {
    #[inline]
    fn partition(&self, key: i64, num_partitions: usize) -> usize {
        if num_partitions == 0 {
            return 0;
        }
        key.rem_euclid(num_partitions as i64) as usize
    }

    fn name(&self) -> &str {
        "modulo"
    }
}

/// Partitioner backed by an injected function pointer.
///
/// # Example
///
/// ```
/// use dynemb_hash_table::{FnPartitioner, Partitioner};
///
/// fn by_high_bits(key: i64, n: usize) -> usize {
///     ((key as u64 >> 32) % n as u64) as usize
/// }
///
/// let partitioner = FnPartitioner::new("high_bits", by_high_bits);
/// assert_eq!(partitioner.partition(3 << 32, 2), 1);
/// ```
#[derive(Clone, Copy)]
pub struct FnPartitioner {
    name: &'static str,
    func: fn(i64, usize) -> usize,
}

impl FnPartitioner {
    /// Wraps `func` under the given name.
    pub fn new(name: &'static str, func: fn(i64, usize) -> usize) -> Self {
        Self { name, func }
    }
}

impl fmt::Debug for FnPartitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPartitioner")
            .field("name", &self.name)
            .finish()
    }
}

impl Partitioner for FnPartitioner {
    #[inline]
    fn partition(&self, key: i64, num_partitions: usize) -> usize {
        (self.func)(key, num_partitions)
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Groups positions of `keys` by shard.
///
/// Returns one `Vec` of input positions per shard, each in input order, or the
/// first out-of-range shard index the partitioner produced.
pub(crate) fn group_by_shard(
    partitioner: &dyn Partitioner,
    keys: &[i64],
    num_shards: usize,
) -> std::result::Result<Vec<Vec<usize>>, (i64, usize)> {
    let mut groups = vec![Vec::new(); num_shards];
    for (pos, &key) in keys.iter().enumerate() {
        let shard = partitioner.partition(key, num_shards);
        match groups.get_mut(shard) {
            Some(group) => group.push(pos),
            None => return Err((key, shard)),
        }
    }
    Ok(groups)
}
