//! Train Command Implementation
//!
//! Runs a synthetic training job against a dynamic embedding table: every
//! step each worker samples a Zipf-distributed batch of keys, looks the rows
//! up through its own shadow variable and pulls them towards a fixed
//! per-key target. Checkpoints are written every `save_steps` steps, after
//! restricting the table when an entry limit is set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use dynemb_checkpoint::{
    CheckpointConfig, CheckpointError, CheckpointManager, Checkpointer, ModelState,
    TableCheckpoint,
};
use dynemb_hash_table::{
    DynamicEmbeddingTable, FrequencyRestrictPolicy, RestrictRequest, TableBuilder, TableConfig,
    TimestampRestrictPolicy, UpdateMode,
};
use dynemb_optimizer::OptimizerConfig;
use dynemb_training::{EmbeddingOptimizer, ShadowVariable, TrainingResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Zipf};
use rayon::prelude::*;
use tracing::{info, warn};

use super::CheckpointFormat;

/// Optimizer applied to the embedding rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OptimizerKind {
    Sgd,
    Momentum,
    Adagrad,
    Adam,
    Ftrl,
}

/// How updated rows are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UpdateModeArg {
    Direct,
    Incremental,
}

/// Restrict policy installed on the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RestrictPolicyKind {
    None,
    Timestamp,
    Frequency,
}

/// Train embeddings on a synthetic workload
///
/// # Example
///
/// ```bash
/// dynemb train \
///     --model-dir /tmp/dynemb \
///     --train-steps 1000 \
///     --optimizer adagrad \
///     --max-entries 50000
/// ```
#[derive(Args, Debug, Clone)]
pub struct TrainCommand {
    /// Directory to save checkpoints to
    #[arg(long, short = 'd', env = "DYNEMB_MODEL_DIR")]
    pub model_dir: PathBuf,

    /// Table configuration file (JSON); overrides the table flags below
    #[arg(long, short = 'c', env = "DYNEMB_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Table name
    #[arg(long, default_value = "embeddings")]
    pub table_name: String,

    /// Embedding dimension
    #[arg(long, default_value = "16")]
    pub dim: usize,

    /// Number of table shards
    #[arg(long, default_value = "8")]
    pub num_shards: usize,

    /// How updated rows are written back
    #[arg(long, value_enum, default_value = "direct")]
    pub update_mode: UpdateModeArg,

    /// Restrict policy installed on the table
    #[arg(long, value_enum, default_value = "timestamp")]
    pub restrict_policy: RestrictPolicyKind,

    /// Restrict the table to this many keys before every checkpoint
    #[arg(long)]
    pub max_entries: Option<usize>,

    /// Optimizer
    #[arg(long, value_enum, default_value = "adagrad")]
    pub optimizer: OptimizerKind,

    /// Learning rate
    #[arg(long, default_value = "0.05")]
    pub learning_rate: f32,

    /// Clip updated rows to this L2 norm
    #[arg(long)]
    pub max_norm: Option<f32>,

    /// Step to train up to
    #[arg(long, short = 's', default_value = "1000")]
    pub train_steps: u64,

    /// Keys per worker batch
    #[arg(long, short = 'b', default_value = "256")]
    pub batch_size: usize,

    /// Size of the key space
    #[arg(long, default_value = "100000")]
    pub num_keys: u64,

    /// Zipf exponent of the key distribution
    #[arg(long, default_value = "1.1")]
    pub zipf_exponent: f64,

    /// Workers updating the table concurrently
    #[arg(long, default_value = "4")]
    pub num_workers: usize,

    /// Checkpoint save interval (in steps)
    #[arg(long, default_value = "100")]
    pub save_steps: u64,

    /// Number of checkpoints to keep
    #[arg(long, default_value = "5")]
    pub max_to_keep: usize,

    /// Checkpoint format
    #[arg(long, value_enum, default_value = "json")]
    pub format: CheckpointFormat,

    /// Resume from the latest checkpoint in the model directory
    #[arg(long)]
    pub resume: bool,

    /// Seed for key sampling
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    /// Step the run started from.
    pub start_step: u64,
    /// Last step trained.
    pub final_step: u64,
    /// Mean loss of the last step, if any step ran.
    pub final_loss: Option<f64>,
    /// Number of keys in the table at the end.
    pub table_size: usize,
    /// Number of keys with optimizer state at the end.
    pub slot_count: usize,
    /// Last checkpoint written.
    pub last_checkpoint: Option<PathBuf>,
}

/// Value the synthetic loss pulls `key`'s row towards.
fn target(key: i64, j: usize) -> f32 {
    ((key as f32) * 0.618 + j as f32).sin() * 0.5
}

impl TrainCommand {
    /// Table configuration from the config file or the flags.
    pub fn table_config(&self) -> Result<TableConfig> {
        let config = match &self.config_path {
            Some(path) => {
                info!(path = %path.display(), "Loading table config");
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str::<TableConfig>(&raw)
                    .context("Failed to parse table config JSON")?
            }
            None => TableConfig::new(self.table_name.clone(), self.dim)
                .with_num_shards(self.num_shards)
                .with_update_mode(match self.update_mode {
                    UpdateModeArg::Direct => UpdateMode::Direct,
                    UpdateModeArg::Incremental => UpdateMode::Incremental,
                }),
        };
        config.validate().context("Invalid table config")?;
        Ok(config)
    }

    /// Optimizer configuration from the flags.
    pub fn optimizer_config(&self) -> OptimizerConfig {
        let learning_rate = self.learning_rate;
        match self.optimizer {
            OptimizerKind::Sgd => OptimizerConfig::Sgd { learning_rate },
            OptimizerKind::Momentum => OptimizerConfig::Momentum {
                learning_rate,
                momentum: 0.9,
                weight_decay: 0.0,
                use_nesterov: false,
            },
            OptimizerKind::Adagrad => OptimizerConfig::Adagrad {
                learning_rate,
                initial_accumulator: 0.1,
                weight_decay: 0.0,
            },
            OptimizerKind::Adam => OptimizerConfig::Adam {
                learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            },
            OptimizerKind::Ftrl => OptimizerConfig::Ftrl {
                learning_rate,
                learning_rate_power: -0.5,
                l1_reg: 0.0,
                l2_reg: 0.0,
            },
        }
    }

    fn build_table(&self) -> Result<Arc<DynamicEmbeddingTable>> {
        let builder = TableBuilder::new(self.table_config()?);
        let builder = match self.restrict_policy {
            RestrictPolicyKind::None => builder,
            RestrictPolicyKind::Timestamp => {
                builder.restrict_policy(Arc::new(TimestampRestrictPolicy))
            }
            RestrictPolicyKind::Frequency => {
                builder.restrict_policy(Arc::new(FrequencyRestrictPolicy))
            }
        };
        Ok(Arc::new(builder.build().context("Failed to create table")?))
    }

    /// Execute the train command
    pub fn run(&self) -> Result<TrainSummary> {
        info!(
            model_dir = %self.model_dir.display(),
            train_steps = self.train_steps,
            format = %self.format,
            "Starting training"
        );
        if self.num_workers == 0 || self.batch_size == 0 {
            return Err(anyhow!("--num-workers and --batch-size must be positive"));
        }
        if self.max_entries.is_some() && self.restrict_policy == RestrictPolicyKind::None {
            warn!("--max-entries has no effect without a restrict policy");
        }
        std::fs::create_dir_all(&self.model_dir).context("Failed to create model directory")?;

        let table = self.build_table()?;
        let optimizer = EmbeddingOptimizer::new(self.optimizer_config(), &table)
            .context("Invalid optimizer config")?;
        let config = CheckpointConfig::new(&self.model_dir)
            .with_max_to_keep(self.max_to_keep)
            .with_checkpoint_interval(self.save_steps);
        let mut manager = CheckpointManager::new(config, self.format.checkpointer());
        manager
            .initialize()
            .context("Failed to scan model directory")?;

        let start_step = if self.resume {
            self.restore(&manager, &table, &optimizer)?
        } else {
            0
        };

        let sampler = Zipf::new(self.num_keys, self.zipf_exponent)
            .map_err(|e| anyhow!("Invalid key distribution: {e}"))?;

        let mut final_loss = None;
        let mut last_checkpoint = None;
        for step in start_step + 1..=self.train_steps {
            let losses = (0..self.num_workers)
                .into_par_iter()
                .map(|worker| self.worker_step(&table, &optimizer, &sampler, step, worker))
                .collect::<TrainingResult<Vec<f64>>>()
                .with_context(|| format!("Training step {step} failed"))?;
            let loss = losses.iter().sum::<f64>() / losses.len() as f64;
            final_loss = Some(loss);

            if manager.should_checkpoint(step) || step == self.train_steps {
                info!(
                    step,
                    loss,
                    table_size = table.size(),
                    slots = optimizer.slots().len(),
                    "Training progress"
                );
                last_checkpoint = Some(self.checkpoint(&mut manager, &table, &optimizer, step)?);
            }
        }

        let summary = TrainSummary {
            start_step,
            final_step: self.train_steps.max(start_step),
            final_loss,
            table_size: table.size(),
            slot_count: optimizer.slots().len(),
            last_checkpoint,
        };
        info!(
            start_step = summary.start_step,
            final_step = summary.final_step,
            table_size = summary.table_size,
            "Training completed successfully"
        );
        Ok(summary)
    }

    fn restore<C: Checkpointer>(
        &self,
        manager: &CheckpointManager<C>,
        table: &DynamicEmbeddingTable,
        optimizer: &EmbeddingOptimizer,
    ) -> Result<u64> {
        let state = match manager.restore_latest() {
            Ok(state) => state,
            Err(CheckpointError::NotFound(dir)) => {
                warn!(dir = %dir.display(), "No checkpoint to resume from, starting fresh");
                return Ok(0);
            }
            Err(e) => return Err(e).context("Failed to load latest checkpoint"),
        };
        let checkpoint = state
            .table(table.name())
            .with_context(|| format!("Checkpoint has no table '{}'", table.name()))?;
        checkpoint
            .restore_into(table, Some(optimizer))
            .context("Failed to restore table")?;
        info!(
            step = state.global_step,
            rows = checkpoint.len(),
            "Resumed from checkpoint"
        );
        Ok(state.global_step)
    }

    fn worker_step(
        &self,
        table: &Arc<DynamicEmbeddingTable>,
        optimizer: &EmbeddingOptimizer,
        sampler: &Zipf<f64>,
        step: u64,
        worker: usize,
    ) -> TrainingResult<f64> {
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ step.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ worker as u64,
        );
        let keys: Vec<i64> = (0..self.batch_size)
            .map(|_| sampler.sample(&mut rng) as i64)
            .collect();

        let mut shadow = ShadowVariable::new(Arc::clone(table), format!("worker_{worker}"));
        if let Some(max_norm) = self.max_norm {
            shadow = shadow.with_max_norm(max_norm);
        }
        let rows = shadow.lookup(&keys)?;

        let dim = table.dim();
        let gradients: Vec<f32> = rows
            .chunks_exact(dim)
            .zip(&keys)
            .flat_map(|(row, &key)| {
                row.iter()
                    .enumerate()
                    .map(move |(j, value)| value - target(key, j))
            })
            .collect();
        let loss = gradients.iter().map(|g| f64::from(g * g)).sum::<f64>() * 0.5
            / self.batch_size as f64;

        optimizer.apply_gradients(&mut shadow, &gradients)?;
        Ok(loss)
    }

    fn checkpoint<C: Checkpointer>(
        &self,
        manager: &mut CheckpointManager<C>,
        table: &DynamicEmbeddingTable,
        optimizer: &EmbeddingOptimizer,
        step: u64,
    ) -> Result<PathBuf> {
        if let (Some(max_entries), Some(_)) = (self.max_entries, table.restrict_policy()) {
            table
                .restrict(&RestrictRequest::max_entries(max_entries))
                .context("Failed to restrict table")?;
            optimizer.prune_slots(table);
        }

        let mut state = ModelState::new(step);
        state.add_table(TableCheckpoint::capture(table, Some(optimizer)));
        state.set_metadata("optimizer", optimizer.config().name());
        let info = manager
            .save(&state)
            .with_context(|| format!("Failed to save checkpoint for step {step}"))?;
        Ok(info.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn parse(args: &[&str]) -> TrainCommand {
        let mut argv = vec!["dynemb", "train", "--model-dir", "/tmp/model"];
        argv.extend_from_slice(args);
        let cli = Cli::parse_from(argv);
        match cli.command {
            Commands::Train(cmd) => cmd,
            Commands::Inspect(_) => panic!("expected train command"),
        }
    }

    #[test]
    fn test_train_command_defaults() {
        let cmd = parse(&[]);
        assert_eq!(cmd.train_steps, 1000);
        assert_eq!(cmd.batch_size, 256);
        assert_eq!(cmd.optimizer, OptimizerKind::Adagrad);
        assert_eq!(cmd.restrict_policy, RestrictPolicyKind::Timestamp);
        assert_eq!(cmd.format, CheckpointFormat::Json);
        assert!(!cmd.resume);
        assert!(cmd.max_entries.is_none());
    }

    #[test]
    fn test_table_config_from_flags() {
        let cmd = parse(&["--dim", "4", "--num-shards", "2", "--update-mode", "incremental"]);
        let config = cmd.table_config().unwrap();
        assert_eq!(config.name, "embeddings");
        assert_eq!(config.dim, 4);
        assert_eq!(config.num_shards, 2);
        assert_eq!(config.update_mode, UpdateMode::Incremental);
    }

    #[test]
    fn test_optimizer_config_uses_learning_rate() {
        let cmd = parse(&["--optimizer", "ftrl", "--learning-rate", "0.2"]);
        let config = cmd.optimizer_config();
        assert_eq!(config.name(), "Ftrl");
        assert!((config.learning_rate() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_target_is_bounded() {
        for key in [-5, 0, 7, 1 << 40] {
            for j in 0..4 {
                assert!(target(key, j).abs() <= 0.5);
            }
        }
    }
}
