//! Checkpointer trait for save/restore operations.
//!
//! A checkpointer turns a [`ModelState`] into a single file and back. Files
//! written through a [`CheckpointManager`](crate::CheckpointManager) are
//! named `checkpoint-<step>.<extension>`.

use std::path::{Path, PathBuf};

use crate::state::ModelState;
use crate::{CheckpointError, Result};

/// File name of the checkpoint for `step`.
pub fn checkpoint_filename(step: u64, extension: &str) -> String {
    format!("checkpoint-{step}.{extension}")
}

/// Parses the step out of a `checkpoint-<step>.<extension>` file name.
pub fn parse_step(filename: &str, extension: &str) -> Option<u64> {
    filename
        .strip_prefix("checkpoint-")?
        .strip_suffix(extension)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Lists `(step, path)` of the checkpoints in `dir`, oldest step first.
///
/// A missing or unreadable directory has no checkpoints.
pub fn list_checkpoints(dir: &Path, extension: &str) -> Vec<(u64, PathBuf)> {
    let mut checkpoints: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let step = parse_step(path.file_name()?.to_str()?, extension)?;
            Some((step, path))
        })
        .collect();
    checkpoints.sort_by_key(|(step, _)| *step);
    checkpoints
}

/// Trait for checkpoint serialization and deserialization.
///
/// # Examples
///
/// ```no_run
/// use dynemb_checkpoint::{Checkpointer, JsonCheckpointer, ModelState};
/// use std::path::Path;
///
/// fn main() -> dynemb_checkpoint::Result<()> {
///     let checkpointer = JsonCheckpointer::new();
///     let state = ModelState::new(1000);
///
///     checkpointer.save(Path::new("/tmp/checkpoint-1000.json"), &state)?;
///     let restored = checkpointer.restore(Path::new("/tmp/checkpoint-1000.json"))?;
///     assert_eq!(restored.global_step, 1000);
///     Ok(())
/// }
/// ```
pub trait Checkpointer: Send + Sync {
    /// File extension of checkpoints written by this checkpointer.
    fn extension(&self) -> &'static str;

    /// Encodes `state`.
    fn encode(&self, state: &ModelState) -> Result<Vec<u8>>;

    /// Decodes a state previously produced by [`encode`](Self::encode).
    fn decode(&self, data: &[u8]) -> Result<ModelState>;

    /// Save model state to the specified path.
    ///
    /// The file is written next to its final location and renamed into
    /// place, so readers never observe a partial checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or I/O fails.
    fn save(&self, path: &Path, state: &ModelState) -> Result<()> {
        tracing::info!(path = %path.display(), step = state.global_step, "Saving checkpoint");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let data = self.encode(state)?;
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, &data).map_err(|e| CheckpointError::Io {
            path: staging.clone(),
            source: e,
        })?;
        std::fs::rename(&staging, path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::debug!(path = %path.display(), size = data.len(), "Checkpoint saved");
        Ok(())
    }

    /// Restore model state from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint doesn't exist, is corrupted,
    /// or was written by an unsupported format version.
    fn restore(&self, path: &Path) -> Result<ModelState> {
        tracing::info!(path = %path.display(), "Restoring checkpoint");

        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let data = std::fs::read(path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let state = self.decode(&data)?;
        state.check_version()?;

        tracing::info!(
            path = %path.display(),
            step = state.global_step,
            tables = state.tables.len(),
            "Checkpoint restored"
        );
        Ok(state)
    }

    /// Find the checkpoint with the highest step in a directory.
    fn latest(&self, dir: &Path) -> Option<PathBuf> {
        list_checkpoints(dir, self.extension())
            .pop()
            .map(|(_, path)| path)
    }
}

impl<C: Checkpointer + ?Sized> Checkpointer for Box<C> {
    fn extension(&self) -> &'static str {
        (**self).extension()
    }

    fn encode(&self, state: &ModelState) -> Result<Vec<u8>> {
        (**self).encode(state)
    }

    fn decode(&self, data: &[u8]) -> Result<ModelState> {
        (**self).decode(data)
    }

    fn save(&self, path: &Path, state: &ModelState) -> Result<()> {
        (**self).save(path, state)
    }

    fn restore(&self, path: &Path) -> Result<ModelState> {
        (**self).restore(path)
    }

    fn latest(&self, dir: &Path) -> Option<PathBuf> {
        (**self).latest(dir)
    }
}

/// JSON-based checkpoint implementation.
///
/// Human-readable, useful for debugging and small tables.
#[derive(Debug, Clone, Default)]
pub struct JsonCheckpointer {
    /// Whether to pretty-print JSON output.
    pub pretty: bool,
}

impl JsonCheckpointer {
    /// Create a new JSON checkpointer.
    pub fn new() -> Self {
        Self { pretty: false }
    }

    /// Create a new JSON checkpointer with pretty printing.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl Checkpointer for JsonCheckpointer {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn encode(&self, state: &ModelState) -> Result<Vec<u8>> {
        if self.pretty {
            serde_json::to_vec_pretty(state)
        } else {
            serde_json::to_vec(state)
        }
        .map_err(|e| CheckpointError::Serialization(Box::new(e)))
    }

    fn decode(&self, data: &[u8]) -> Result<ModelState> {
        serde_json::from_slice(data).map_err(|e| CheckpointError::Deserialization(Box::new(e)))
    }
}

/// Compact binary checkpoint implementation using bincode.
#[derive(Debug, Clone, Default)]
pub struct BinaryCheckpointer;

impl BinaryCheckpointer {
    /// Create a new binary checkpointer.
    pub fn new() -> Self {
        Self
    }
}

impl Checkpointer for BinaryCheckpointer {
    fn extension(&self) -> &'static str {
        "bin"
    }

    fn encode(&self, state: &ModelState) -> Result<Vec<u8>> {
        bincode::serialize(state).map_err(|e| CheckpointError::Serialization(e))
    }

    fn decode(&self, data: &[u8]) -> Result<ModelState> {
        bincode::deserialize(data).map_err(|e| CheckpointError::Deserialization(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_json_checkpointer_save_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint-1000.json");

        let checkpointer = JsonCheckpointer::new();
        let mut state = ModelState::new(1000);
        state.set_metadata("test_key", "test_value");

        checkpointer.save(&path, &state).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let restored = checkpointer.restore(&path).unwrap();
        assert_eq!(restored.global_step, 1000);
        assert_eq!(
            restored.metadata.get("test_key"),
            Some(&"test_value".to_string())
        );
    }

    #[test]
    fn test_json_checkpointer_pretty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        JsonCheckpointer::pretty()
            .save(&path, &ModelState::new(500))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains('\n'));
    }

    #[test]
    fn test_restore_not_found() {
        let checkpointer = JsonCheckpointer::new();
        let result = checkpointer.restore(Path::new("/nonexistent/path/checkpoint.json"));
        assert!(matches!(result, Err(CheckpointError::NotFound(_))));
    }

    #[test]
    fn test_restore_corrupted_binary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint-1.bin");
        std::fs::write(&path, [0xff, 0x01]).unwrap();

        let result = BinaryCheckpointer::new().restore(&path);
        assert!(matches!(result, Err(CheckpointError::Deserialization(_))));
    }

    #[test]
    fn test_latest_ignores_other_extensions() {
        let dir = tempdir().unwrap();
        let json = JsonCheckpointer::new();
        let binary = BinaryCheckpointer::new();

        for step in [100, 500, 300] {
            let path = dir.path().join(checkpoint_filename(step, "json"));
            json.save(&path, &ModelState::new(step)).unwrap();
        }
        let path = dir.path().join(checkpoint_filename(900, "bin"));
        binary.save(&path, &ModelState::new(900)).unwrap();

        let latest = json.latest(dir.path()).unwrap();
        assert!(latest.ends_with("checkpoint-500.json"));
        let latest = binary.latest(dir.path()).unwrap();
        assert!(latest.ends_with("checkpoint-900.bin"));
    }

    #[test]
    fn test_latest_empty_dir() {
        let dir = tempdir().unwrap();
        assert!(JsonCheckpointer::new().latest(dir.path()).is_none());
        assert!(JsonCheckpointer::new()
            .latest(&dir.path().join("missing"))
            .is_none());
    }

    #[test]
    fn test_binary_checkpointer_save_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint-2000.bin");

        let checkpointer = BinaryCheckpointer::new();
        checkpointer.save(&path, &ModelState::new(2000)).unwrap();

        let restored = checkpointer.restore(&path).unwrap();
        assert_eq!(restored.global_step, 2000);
    }

    #[test]
    fn test_parse_step() {
        assert_eq!(parse_step("checkpoint-100.json", "json"), Some(100));
        assert_eq!(parse_step("checkpoint-0.bin", "bin"), Some(0));
        assert_eq!(parse_step("checkpoint-100.json", "bin"), None);
        assert_eq!(parse_step("checkpoint-100json", "json"), None);
        assert_eq!(parse_step("invalid.json", "json"), None);
        assert_eq!(parse_step("checkpoint-abc.json", "json"), None);
    }
}
