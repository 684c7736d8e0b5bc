//! Checkpoint export and restore for dynamic embedding tables.
//!
//! This crate provides functionality for:
//!
//! - **Capture/Restore**: Export a table (rows, restrict scores and optimizer
//!   slots) into a [`TableCheckpoint`] and replace a table's contents from one
//! - **Save/Load**: Persist a [`ModelState`] to disk as JSON or bincode
//! - **Lifecycle**: Keep the latest `max_to_keep` checkpoints of a run
//!
//! # Core Components
//!
//! - [`Checkpointer`]: Trait for checkpoint file formats
//! - [`CheckpointManager`]: Manages checkpoint lifecycle (save, restore, cleanup)
//! - [`ModelState`]: Every table of a run at one global step
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dynemb_checkpoint::{
//!     CheckpointConfig, CheckpointManager, JsonCheckpointer, ModelState, TableCheckpoint,
//! };
//! use dynemb_hash_table::{DynamicEmbeddingTable, TableConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let table = DynamicEmbeddingTable::new(TableConfig::new("items", 8))?;
//!     table.upsert(&[1, 2], &[0.5; 16])?;
//!
//!     let config = CheckpointConfig::new("/tmp/checkpoints").with_max_to_keep(5);
//!     let mut manager = CheckpointManager::new(config, JsonCheckpointer::new());
//!
//!     let mut state = ModelState::new(1000);
//!     state.add_table(TableCheckpoint::capture(&table, None));
//!     manager.save(&state)?;
//!
//!     let restored = manager.restore_latest()?;
//!     if let Some(checkpoint) = restored.table("items") {
//!         checkpoint.restore_into(&table, None)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpointer;
pub mod manager;
pub mod state;

pub use checkpointer::{BinaryCheckpointer, Checkpointer, JsonCheckpointer};
pub use manager::{CheckpointConfig, CheckpointInfo, CheckpointManager};
pub use state::{ModelState, TableCheckpoint, FORMAT_VERSION};

use std::path::PathBuf;

use dynemb_hash_table::EmbeddingError;
use thiserror::Error;

/// Errors that can occur during checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// I/O error during checkpoint operations.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint file not found.
    #[error("Checkpoint not found: {0}")]
    NotFound(PathBuf),

    /// Error during serialization.
    #[error("Serialization error: {0}")]
    Serialization(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Error during deserialization.
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Checkpoint version mismatch.
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version.
        expected: u32,
        /// Found version.
        found: u32,
    },

    /// Invalid checkpoint configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The table rejected the checkpoint contents.
    #[error(transparent)]
    Table(#[from] EmbeddingError),
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;
