//! Sharded, dynamically growable key-value storage for embeddings.
//!
//! This crate stores sparse embedding parameters: every integer key maps to a
//! dense row of `dim` floats, and the key space is not known in advance.
//!
//! # Overview
//!
//! The main components are:
//!
//! - [`DynamicEmbeddingTable`] - the sharded table, entry point for all batched operations
//! - [`KvShard`] - one growable open-addressing shard
//! - [`Partitioner`] - routes keys to shards ([`ModuloPartitioner`] by default)
//! - [`Initializer`] - produces default rows for keys that are not stored
//! - [`RestrictPolicy`] - scores keys and picks eviction victims
//!
//! # Example
//!
//! ```
//! use dynemb_hash_table::{DynamicEmbeddingTable, InitializerConfig, TableConfig};
//!
//! let table = DynamicEmbeddingTable::new(
//!     TableConfig::new("user_embeddings", 4)
//!         .with_num_shards(2)
//!         .with_initializer(InitializerConfig::Zeros),
//! )
//! .unwrap();
//!
//! let ids = vec![1, 2, 3];
//! let embeddings = vec![
//!     0.1, 0.2, 0.3, 0.4,
//!     0.5, 0.6, 0.7, 0.8,
//!     0.9, 1.0, 1.1, 1.2,
//! ];
//! table.upsert(&ids, &embeddings).unwrap();
//!
//! let output = table.lookup(&ids).unwrap();
//! assert_eq!(output, embeddings);
//! ```

mod config;
mod error;
pub mod initializer;
mod partitioner;
pub mod restrict;
mod shard;
mod table;

pub use config::{KeyDtype, TableConfig, UpdateMode, ValueDtype};
pub use error::{EmbeddingError, Result};
pub use initializer::{
    ConstantInitializer, Initializer, InitializerConfig, OnesInitializer,
    RandomNormalInitializer, RandomUniformInitializer, TruncatedNormalInitializer,
    ZerosInitializer,
};
pub use partitioner::{FnPartitioner, ModuloPartitioner, Partitioner};
pub use restrict::{
    FrequencyRestrictPolicy, RestrictPolicy, RestrictRequest, TimestampRestrictPolicy,
};
pub use shard::{AccumStats, KvShard};
pub use table::{DynamicEmbeddingTable, TableBuilder};
