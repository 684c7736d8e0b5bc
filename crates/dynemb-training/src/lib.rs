//! Training-side access to dynamic embedding tables.
//!
//! A training step goes through three stages:
//!
//! ```text
//!  keys ──► ShadowVariable::lookup ──► dense rows ──► model
//!                                                      │
//!  table ◄── EmbeddingOptimizer::apply_gradients ◄── gradients
//! ```
//!
//! The shadow deduplicates the batch and remembers which table epoch it
//! read from; the optimizer refuses shadows that were already consumed or
//! that predate a wholesale replacement of the table contents.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dynemb_hash_table::{DynamicEmbeddingTable, InitializerConfig, TableConfig};
//! use dynemb_optimizer::OptimizerConfig;
//! use dynemb_training::{EmbeddingOptimizer, ShadowVariable, TrainingError};
//!
//! let table = Arc::new(
//!     DynamicEmbeddingTable::new(
//!         TableConfig::new("users", 4).with_initializer(InitializerConfig::Zeros),
//!     )
//!     .unwrap(),
//! );
//! let optimizer = EmbeddingOptimizer::new(
//!     OptimizerConfig::Adagrad {
//!         learning_rate: 0.1,
//!         initial_accumulator: 0.1,
//!         weight_decay: 0.0,
//!     },
//!     &table,
//! )
//! .unwrap();
//!
//! let mut shadow = ShadowVariable::new(Arc::clone(&table), "users_shadow");
//! let rows = shadow.lookup(&[10, 20]).unwrap();
//! let gradients: Vec<f32> = rows.iter().map(|_| 1.0).collect();
//! optimizer.apply_gradients(&mut shadow, &gradients).unwrap();
//! assert_eq!(table.size(), 2);
//!
//! // The lookup was consumed; a second update needs a fresh lookup.
//! let err = optimizer.apply_gradients(&mut shadow, &gradients).unwrap_err();
//! assert!(matches!(err, TrainingError::StaleShadowReference { .. }));
//! ```

mod adapter;
mod error;
mod shadow;

pub use adapter::{EmbeddingOptimizer, StepStats};
pub use error::{TrainingError, TrainingResult};
pub use shadow::{dedup_ids, ShadowState, ShadowVariable};
