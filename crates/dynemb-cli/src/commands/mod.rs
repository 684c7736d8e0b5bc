//! CLI Command Implementations
//!
//! - [`TrainCommand`]: Synthetic training run against a dynamic embedding table
//! - [`InspectCommand`]: Summaries of saved checkpoints

mod inspect;
mod train;

pub use inspect::{InspectCommand, KeyRow, TableSummary};
pub use train::{OptimizerKind, RestrictPolicyKind, TrainCommand, TrainSummary, UpdateModeArg};

use dynemb_checkpoint::{BinaryCheckpointer, Checkpointer, JsonCheckpointer};

/// On-disk checkpoint format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CheckpointFormat {
    /// Human-readable JSON (`.json`)
    #[default]
    Json,
    /// Compact bincode (`.bin`)
    Binary,
}

impl CheckpointFormat {
    /// Returns a checkpointer for this format.
    pub fn checkpointer(self) -> Box<dyn Checkpointer> {
        match self {
            CheckpointFormat::Json => Box::new(JsonCheckpointer::pretty()),
            CheckpointFormat::Binary => Box::new(BinaryCheckpointer::new()),
        }
    }
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointFormat::Json => write!(f, "json"),
            CheckpointFormat::Binary => write!(f, "binary"),
        }
    }
}
