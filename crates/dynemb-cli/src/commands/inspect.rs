//! Inspect Command Implementation
//!
//! Loads a checkpoint and prints a JSON summary of its tables to stdout.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use dynemb_checkpoint::{CheckpointError, ModelState, TableCheckpoint};
use serde::Serialize;
use tracing::info;

use super::CheckpointFormat;

/// Inspect a checkpoint
///
/// # Example
///
/// ```bash
/// dynemb inspect --checkpoint-path /tmp/dynemb --key 17 --key 42
/// ```
#[derive(Args, Debug, Clone)]
pub struct InspectCommand {
    /// Checkpoint file, or a model directory to take the latest checkpoint from
    #[arg(long, short = 'c', env = "DYNEMB_CHECKPOINT_PATH")]
    pub checkpoint_path: PathBuf,

    /// Checkpoint format
    #[arg(long, value_enum, default_value = "json")]
    pub format: CheckpointFormat,

    /// Only summarize this table
    #[arg(long)]
    pub table: Option<String>,

    /// Print the row of this key (repeatable)
    #[arg(long = "key")]
    pub keys: Vec<i64>,
}

/// Row of a requested key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyRow {
    pub key: i64,
    /// `None` when the key is not in the checkpoint.
    pub value: Option<Vec<f32>>,
}

/// Summary of one checkpointed table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub global_step: u64,
    pub dim: usize,
    pub key_dtype: String,
    pub num_shards: usize,
    pub rows: usize,
    pub restrict_policy: Option<String>,
    pub optimizer: Option<String>,
    pub slots: usize,
    /// Mean L2 norm over all rows.
    pub mean_norm: f64,
    pub max_norm: f64,
    pub requested: Vec<KeyRow>,
}

impl TableSummary {
    fn new(state: &ModelState, table: &TableCheckpoint, keys: &[i64]) -> Self {
        let norms: Vec<f64> = table
            .values
            .chunks_exact(table.dim.max(1))
            .map(|row| row.iter().map(|v| f64::from(v * v)).sum::<f64>().sqrt())
            .collect();
        let mean_norm = if norms.is_empty() {
            0.0
        } else {
            norms.iter().sum::<f64>() / norms.len() as f64
        };

        let requested = keys
            .iter()
            .map(|&key| KeyRow {
                key,
                value: table
                    .keys
                    .iter()
                    .position(|&k| k == key)
                    .and_then(|i| table.values.get(i * table.dim..(i + 1) * table.dim))
                    .map(<[f32]>::to_vec),
            })
            .collect();

        Self {
            name: table.name.clone(),
            global_step: state.global_step,
            dim: table.dim,
            key_dtype: table.key_dtype.name().to_string(),
            num_shards: table.num_shards,
            rows: table.len(),
            restrict_policy: table.metadata.get("restrict_policy").cloned(),
            optimizer: table.optimizer.as_ref().map(|o| o.name().to_string()),
            slots: table.slots.len(),
            mean_norm,
            max_norm: norms.iter().copied().fold(0.0, f64::max),
            requested,
        }
    }
}

impl InspectCommand {
    fn resolve_path(&self) -> Result<PathBuf> {
        if !self.checkpoint_path.is_dir() {
            return Ok(self.checkpoint_path.clone());
        }
        self.format
            .checkpointer()
            .latest(&self.checkpoint_path)
            .ok_or_else(|| CheckpointError::NotFound(self.checkpoint_path.clone()))
            .context("No checkpoint in directory")
    }

    /// Summarizes the selected tables without printing them.
    pub fn summarize(&self) -> Result<Vec<TableSummary>> {
        let path = self.resolve_path()?;
        info!(path = %path.display(), format = %self.format, "Inspecting checkpoint");
        let state = self
            .format
            .checkpointer()
            .restore(&path)
            .with_context(|| format!("Failed to load checkpoint {}", path.display()))?;

        let summaries: Vec<TableSummary> = state
            .tables
            .iter()
            .filter(|t| self.table.as_deref().map_or(true, |name| t.name == name))
            .map(|t| TableSummary::new(&state, t, &self.keys))
            .collect();
        if let (Some(name), true) = (&self.table, summaries.is_empty()) {
            bail!("Checkpoint has no table '{name}'");
        }
        Ok(summaries)
    }

    /// Execute the inspect command
    pub fn run(&self) -> Result<Vec<TableSummary>> {
        let summaries = self.summarize()?;
        let json = serde_json::to_string_pretty(&summaries).context("Failed to encode summary")?;
        println!("{json}");
        Ok(summaries)
    }
}
