//! Dynemb CLI Library
//!
//! Command-line tools for dynamic embedding tables:
//!
//! - **Train**: synthetic sparse training with periodic, restricted checkpoints
//! - **Inspect**: summarize the tables of a checkpoint as JSON
//!
//! # Example
//!
//! ```bash
//! # Train, keeping at most 50k keys per checkpoint
//! dynemb train --model-dir /tmp/dynemb --train-steps 1000 --max-entries 50000
//!
//! # Continue from the latest checkpoint
//! dynemb train --model-dir /tmp/dynemb --train-steps 2000 --resume
//!
//! # Look at the result
//! dynemb inspect --checkpoint-path /tmp/dynemb --key 1
//! ```

pub mod commands;

use clap::{Parser, Subcommand};

pub use commands::{CheckpointFormat, InspectCommand, TrainCommand};

/// Dynemb - sharded dynamic embedding tables
#[derive(Parser, Debug)]
#[command(name = "dynemb")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train embeddings on a synthetic workload
    Train(TrainCommand),

    /// Summarize a checkpoint
    Inspect(InspectCommand),
}
