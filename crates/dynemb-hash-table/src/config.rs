//! Table configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};
use crate::initializer::InitializerConfig;

/// Integer width of the keys a table accepts.
///
/// Keys are always carried as `i64` in memory; an [`KeyDtype::Int32`] table
/// rejects keys that don't fit in 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyDtype {
    /// 32-bit signed keys.
    Int32,
    /// 64-bit signed keys.
    #[default]
    Int64,
}

impl KeyDtype {
    /// Returns the dtype name used in errors and checkpoints.
    pub fn name(&self) -> &'static str {
        match self {
            KeyDtype::Int32 => "int32",
            KeyDtype::Int64 => "int64",
        }
    }

    /// Checks that every key is representable in this dtype.
    pub fn validate(&self, keys: &[i64]) -> Result<()> {
        if let KeyDtype::Int32 = self {
            if let Some(&bad) = keys.iter().find(|&&k| i32::try_from(k).is_err()) {
                return Err(EmbeddingError::TypeMismatch {
                    expected: self.name().to_string(),
                    actual: format!("key {bad} out of int32 range"),
                });
            }
        }
        Ok(())
    }
}

/// Floating point type of the stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueDtype {
    /// 32-bit floats.
    #[default]
    Float32,
}

impl ValueDtype {
    /// Returns the dtype name used in errors and checkpoints.
    pub fn name(&self) -> &'static str {
        match self {
            ValueDtype::Float32 => "float32",
        }
    }
}

/// How the optimizer adapter writes updated rows back into the table.
///
/// The mode is fixed per table: mixing modes on one table silently corrupts
/// magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// The updated dense values overwrite the stored values.
    #[default]
    Direct,
    /// The difference between updated and fetched values is added to the
    /// stored values by the table itself.
    Incremental,
}

/// Configuration for a [`DynamicEmbeddingTable`](crate::DynamicEmbeddingTable).
///
/// # Example
///
/// ```
/// use dynemb_hash_table::{TableConfig, UpdateMode};
///
/// let config = TableConfig::new("user_embeddings", 16)
///     .with_num_shards(4)
///     .with_init_capacity(1024)
///     .with_update_mode(UpdateMode::Incremental);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Name of the table, used in logs and checkpoints.
    pub name: String,

    /// Embedding dimension.
    pub dim: usize,

    /// Number of shards (one per device/partition).
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,

    /// Initial number of entries the whole table can hold before growing.
    #[serde(default = "default_init_capacity")]
    pub init_capacity: usize,

    /// Hard per-shard entry limit. `None` means bounded only by memory.
    #[serde(default)]
    pub max_capacity: Option<usize>,

    /// Load factor above which a shard doubles its capacity.
    #[serde(default = "default_max_load_factor")]
    pub max_load_factor: f64,

    /// Key width.
    #[serde(default)]
    pub key_dtype: KeyDtype,

    /// Value type.
    #[serde(default)]
    pub value_dtype: ValueDtype,

    /// Write-back mode used by the optimizer adapter.
    #[serde(default)]
    pub update_mode: UpdateMode,

    /// Rule for producing values of keys that are not in the table.
    #[serde(default)]
    pub initializer: InitializerConfig,
}

fn default_num_shards() -> usize {
    1
}

fn default_init_capacity() -> usize {
    1024
}

fn default_max_load_factor() -> f64 {
    0.75
}

impl TableConfig {
    /// Creates a single-shard configuration with defaults for everything else.
    pub fn new(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            dim,
            num_shards: default_num_shards(),
            init_capacity: default_init_capacity(),
            max_capacity: None,
            max_load_factor: default_max_load_factor(),
            key_dtype: KeyDtype::default(),
            value_dtype: ValueDtype::default(),
            update_mode: UpdateMode::default(),
            initializer: InitializerConfig::default(),
        }
    }

    /// Set the number of shards.
    pub fn with_num_shards(mut self, num_shards: usize) -> Self {
        self.num_shards = num_shards;
        self
    }

    /// Set the initial capacity of the whole table.
    pub fn with_init_capacity(mut self, init_capacity: usize) -> Self {
        self.init_capacity = init_capacity;
        self
    }

    /// Set the hard per-shard entry limit.
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    /// Set the growth threshold.
    pub fn with_max_load_factor(mut self, max_load_factor: f64) -> Self {
        self.max_load_factor = max_load_factor;
        self
    }

    /// Set the key dtype.
    pub fn with_key_dtype(mut self, key_dtype: KeyDtype) -> Self {
        self.key_dtype = key_dtype;
        self
    }

    /// Set the write-back mode.
    pub fn with_update_mode(mut self, update_mode: UpdateMode) -> Self {
        self.update_mode = update_mode;
        self
    }

    /// Set the initializer.
    pub fn with_initializer(mut self, initializer: InitializerConfig) -> Self {
        self.initializer = initializer;
        self
    }

    /// Initial capacity of a single shard when the table has `num_shards`.
    pub fn init_capacity_per_shard(&self, num_shards: usize) -> usize {
        self.init_capacity.div_ceil(num_shards.max(1))
    }

    /// Checks the configuration for values the table cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(EmbeddingError::Configuration(format!(
                "table '{}': dim must be greater than 0",
                self.name
            )));
        }
        if self.num_shards == 0 {
            return Err(EmbeddingError::Configuration(format!(
                "table '{}': num_shards must be greater than 0",
                self.name
            )));
        }
        if !(self.max_load_factor > 0.0 && self.max_load_factor < 1.0) {
            return Err(EmbeddingError::Configuration(format!(
                "table '{}': max_load_factor must be in (0, 1), got {}",
                self.name, self.max_load_factor
            )));
        }
        if self.max_capacity == Some(0) {
            return Err(EmbeddingError::Configuration(format!(
                "table '{}': max_capacity must be greater than 0",
                self.name
            )));
        }
        self.initializer.validate()
    }
}
