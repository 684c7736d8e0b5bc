//! Checkpoint manager for tracking and managing checkpoint lifecycle.
//!
//! This module provides `CheckpointManager`, which handles:
//! - Tracking checkpoint history
//! - Automatic cleanup of old checkpoints
//! - Finding the latest checkpoint for restore operations

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checkpointer::{checkpoint_filename, list_checkpoints, Checkpointer};
use crate::state::ModelState;
use crate::{CheckpointError, Result};

/// Information about a saved checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    /// Path to the checkpoint file.
    pub path: PathBuf,

    /// Global step at which this checkpoint was saved.
    pub global_step: u64,

    /// Timestamp when checkpoint was created (Unix epoch seconds).
    pub timestamp: u64,
}

/// Configuration for the checkpoint manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory where checkpoints are stored.
    pub checkpoint_dir: PathBuf,

    /// Maximum number of checkpoints to keep.
    /// Older checkpoints are automatically deleted.
    pub max_to_keep: usize,

    /// Interval in steps between automatic checkpoints.
    /// Set to 0 to disable automatic checkpointing.
    pub checkpoint_interval: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            max_to_keep: 5,
            checkpoint_interval: 1000,
        }
    }
}

impl CheckpointConfig {
    /// Create a new checkpoint configuration.
    ///
    /// # Arguments
    ///
    /// * `checkpoint_dir` - Directory where checkpoints will be stored
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..Default::default()
        }
    }

    /// Set the maximum number of checkpoints to keep.
    pub fn with_max_to_keep(mut self, max_to_keep: usize) -> Self {
        self.max_to_keep = max_to_keep;
        self
    }

    /// Set the checkpoint interval.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Checks that at least one checkpoint is kept.
    pub fn validate(&self) -> Result<()> {
        if self.max_to_keep == 0 {
            return Err(CheckpointError::InvalidConfig(
                "max_to_keep must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Manages checkpoint lifecycle including saving, restoring, and cleanup.
///
/// # Examples
///
/// ```no_run
/// use dynemb_checkpoint::{CheckpointConfig, CheckpointManager, JsonCheckpointer, ModelState};
///
/// fn main() -> dynemb_checkpoint::Result<()> {
///     let config = CheckpointConfig::new("/tmp/checkpoints").with_max_to_keep(3);
///     let mut manager = CheckpointManager::new(config, JsonCheckpointer::new());
///
///     manager.save(&ModelState::new(1000))?;
///     let restored = manager.restore_latest()?;
///     assert_eq!(restored.global_step, 1000);
///     Ok(())
/// }
/// ```
pub struct CheckpointManager<C: Checkpointer> {
    config: CheckpointConfig,
    checkpointer: C,
    /// Saved checkpoints, oldest first.
    checkpoint_history: VecDeque<CheckpointInfo>,
}

impl<C: Checkpointer> CheckpointManager<C> {
    /// Create a new checkpoint manager.
    pub fn new(config: CheckpointConfig, checkpointer: C) -> Self {
        Self {
            config,
            checkpointer,
            checkpoint_history: VecDeque::new(),
        }
    }

    /// Get the checkpoint directory.
    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Get the number of tracked checkpoints.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoint_history.len()
    }

    /// Get the configuration.
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Get the checkpointer.
    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    fn path_for(&self, step: u64) -> PathBuf {
        self.config
            .checkpoint_dir
            .join(checkpoint_filename(step, self.checkpointer.extension()))
    }

    /// Save a checkpoint and remove the oldest ones beyond `max_to_keep`.
    ///
    /// Saving a step that is already tracked replaces its file.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] if `max_to_keep` is 0, and
    /// any I/O or serialization error.
    pub fn save(&mut self, state: &ModelState) -> Result<CheckpointInfo> {
        self.config.validate()?;
        let path = self.path_for(state.global_step);

        tracing::info!(
            step = state.global_step,
            path = %path.display(),
            tables = state.tables.len(),
            "Saving checkpoint via manager"
        );
        self.checkpointer.save(&path, state)?;

        let info = CheckpointInfo {
            path,
            global_step: state.global_step,
            timestamp: state.timestamp,
        };
        self.checkpoint_history
            .retain(|existing| existing.global_step != info.global_step);
        self.checkpoint_history.push_back(info.clone());
        self.cleanup_old()?;

        Ok(info)
    }

    /// Restore the checkpoint with the highest step.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if the directory holds no
    /// checkpoint.
    pub fn restore_latest(&self) -> Result<ModelState> {
        let latest_path = self
            .checkpointer
            .latest(&self.config.checkpoint_dir)
            .ok_or_else(|| CheckpointError::NotFound(self.config.checkpoint_dir.clone()))?;

        tracing::info!(path = %latest_path.display(), "Restoring latest checkpoint");
        self.checkpointer.restore(&latest_path)
    }

    /// Restore a specific checkpoint by path.
    pub fn restore(&self, path: &Path) -> Result<ModelState> {
        self.checkpointer.restore(path)
    }

    /// Restore a checkpoint by step number.
    pub fn restore_step(&self, step: u64) -> Result<ModelState> {
        self.checkpointer.restore(&self.path_for(step))
    }

    /// Clean up old checkpoints, keeping only `max_to_keep` most recent.
    pub fn cleanup_old(&mut self) -> Result<()> {
        while self.checkpoint_history.len() > self.config.max_to_keep {
            let Some(old_checkpoint) = self.checkpoint_history.pop_front() else {
                break;
            };
            tracing::info!(
                path = %old_checkpoint.path.display(),
                step = old_checkpoint.global_step,
                "Removing old checkpoint"
            );
            if old_checkpoint.path.exists() {
                std::fs::remove_file(&old_checkpoint.path).map_err(|e| CheckpointError::Io {
                    path: old_checkpoint.path.clone(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }

    /// List the checkpoints of this manager's format in the checkpoint
    /// directory, sorted by step (ascending).
    pub fn list_checkpoints(&self) -> Vec<PathBuf> {
        list_checkpoints(&self.config.checkpoint_dir, self.checkpointer.extension())
            .into_iter()
            .map(|(_, path)| path)
            .collect()
    }

    /// Check if a checkpoint should be saved at the given step.
    pub fn should_checkpoint(&self, step: u64) -> bool {
        self.config.checkpoint_interval != 0
            && step > 0
            && step % self.config.checkpoint_interval == 0
    }

    /// Rebuild the history from the files already in the checkpoint
    /// directory, so a restarted run keeps cleaning up old checkpoints.
    pub fn initialize(&mut self) -> Result<()> {
        self.checkpoint_history = list_checkpoints(
            &self.config.checkpoint_dir,
            self.checkpointer.extension(),
        )
        .into_iter()
        .map(|(global_step, path)| CheckpointInfo {
            path,
            global_step,
            timestamp: 0,
        })
        .collect();

        tracing::info!(
            dir = %self.config.checkpoint_dir.display(),
            count = self.checkpoint_history.len(),
            "Initialized checkpoint manager"
        );
        Ok(())
    }
}
