//! Default-value initializers for keys that are not in the table.
//!
//! An initializer produces the value returned by a lookup miss. The value is
//! not persisted by the lookup itself; it only reaches the table through a
//! later write (typically the optimizer write-back).
//!
//! # Example
//!
//! ```
//! use dynemb_hash_table::initializer::{Initializer, InitializerConfig};
//!
//! let initializer = InitializerConfig::Constant { value: 0.1 }.build().unwrap();
//! assert_eq!(initializer.initialize(2), vec![0.1, 0.1]);
//! ```

use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// A rule producing default values for missing keys.
///
/// Implementations must be `Send + Sync`: shards call them concurrently from
/// lookups running on different threads.
pub trait Initializer: Send + Sync {
    /// Produces one value vector of length `dim`.
    fn initialize(&self, dim: usize) -> Vec<f32>;

    /// Returns the name of this initializer, for logging.
    fn name(&self) -> &str;
}

/// Initializer that sets all values to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZerosInitializer;

impl Initializer for ZerosInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        vec![0.0; dim]
    }

    fn name(&self) -> &str {
        "zeros"
    }
}

/// Initializer that sets all values to one.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnesInitializer;

impl Initializer for OnesInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        vec![1.0; dim]
    }

    fn name(&self) -> &str {
        "ones"
    }
}

/// Initializer that sets all values to a constant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantInitializer {
    value: f32,
}

impl ConstantInitializer {
    /// Creates a new constant initializer.
    pub fn new(value: f32) -> Self {
        Self { value }
    }

    /// Returns the constant value.
    pub fn value(&self) -> f32 {
        self.value
    }
}

impl Initializer for ConstantInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        vec![self.value; dim]
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Samples uniformly from `[min_val, max_val)`.
#[derive(Debug, Clone, Copy)]
pub struct RandomUniformInitializer {
    min_val: f32,
    max_val: f32,
}

impl RandomUniformInitializer {
    /// Creates a uniform initializer.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] if `min_val >= max_val`.
    pub fn new(min_val: f32, max_val: f32) -> Result<Self> {
        if !(min_val < max_val) {
            return Err(EmbeddingError::Configuration(format!(
                "random_uniform: min ({min_val}) must be less than max ({max_val})"
            )));
        }
        Ok(Self { min_val, max_val })
    }

    /// Returns the lower bound.
    pub fn min_val(&self) -> f32 {
        self.min_val
    }

    /// Returns the upper bound.
    pub fn max_val(&self) -> f32 {
        self.max_val
    }
}

impl Initializer for RandomUniformInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..dim)
            .map(|_| rng.gen_range(self.min_val..self.max_val))
            .collect()
    }

    fn name(&self) -> &str {
        "random_uniform"
    }
}

fn normal(name: &str, mean: f32, stddev: f32) -> Result<Normal<f32>> {
    if !(stddev > 0.0 && stddev.is_finite()) {
        return Err(EmbeddingError::Configuration(format!(
            "{name}: stddev must be positive and finite, got {stddev}"
        )));
    }
    Normal::new(mean, stddev)
        .map_err(|e| EmbeddingError::Configuration(format!("{name}: {e}")))
}

/// Samples from a normal distribution.
#[derive(Debug, Clone, Copy)]
pub struct RandomNormalInitializer {
    mean: f32,
    stddev: f32,
    distribution: Normal<f32>,
}

impl RandomNormalInitializer {
    /// Creates a normal initializer.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] if `stddev` is not positive.
    pub fn new(mean: f32, stddev: f32) -> Result<Self> {
        Ok(Self {
            mean,
            stddev,
            distribution: normal("random_normal", mean, stddev)?,
        })
    }

    /// Returns the mean.
    pub fn mean(&self) -> f32 {
        self.mean
    }

    /// Returns the standard deviation.
    pub fn stddev(&self) -> f32 {
        self.stddev
    }
}

impl Initializer for RandomNormalInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..dim).map(|_| self.distribution.sample(&mut rng)).collect()
    }

    fn name(&self) -> &str {
        "random_normal"
    }
}

/// Samples from a normal distribution, resampling anything further than two
/// standard deviations from the mean.
#[derive(Debug, Clone, Copy)]
pub struct TruncatedNormalInitializer {
    mean: f32,
    stddev: f32,
    distribution: Normal<f32>,
}

impl TruncatedNormalInitializer {
    /// Creates a truncated normal initializer.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] if `stddev` is not positive.
    pub fn new(mean: f32, stddev: f32) -> Result<Self> {
        Ok(Self {
            mean,
            stddev,
            distribution: normal("truncated_normal", mean, stddev)?,
        })
    }
}

impl Initializer for TruncatedNormalInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        let lower = self.mean - 2.0 * self.stddev;
        let upper = self.mean + 2.0 * self.stddev;
        (0..dim)
            .map(|_| loop {
                let val = self.distribution.sample(&mut rng);
                if (lower..=upper).contains(&val) {
                    return val;
                }
            })
            .collect()
    }

    fn name(&self) -> &str {
        "truncated_normal"
    }
}

/// Serializable selection of an initializer, resolved once at table
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitializerConfig {
    /// All zeros.
    Zeros,
    /// All ones.
    Ones,
    /// A constant value.
    Constant {
        /// The value.
        value: f32,
    },
    /// Uniform in `[min, max)`.
    RandomUniform {
        /// Lower bound (inclusive).
        min: f32,
        /// Upper bound (exclusive).
        max: f32,
    },
    /// Normal distribution.
    RandomNormal {
        /// Mean.
        mean: f32,
        /// Standard deviation.
        stddev: f32,
    },
    /// Normal distribution truncated at two standard deviations.
    TruncatedNormal {
        /// Mean.
        mean: f32,
        /// Standard deviation.
        stddev: f32,
    },
}

impl Default for InitializerConfig {
    fn default() -> Self {
        InitializerConfig::RandomNormal {
            mean: 0.0,
            stddev: 0.05,
        }
    }
}

impl InitializerConfig {
    /// Builds the configured initializer.
    pub fn build(&self) -> Result<Arc<dyn Initializer>> {
        Ok(match *self {
            InitializerConfig::Zeros => Arc::new(ZerosInitializer),
            InitializerConfig::Ones => Arc::new(OnesInitializer),
            InitializerConfig::Constant { value } => Arc::new(ConstantInitializer::new(value)),
            InitializerConfig::RandomUniform { min, max } => {
                Arc::new(RandomUniformInitializer::new(min, max)?)
            }
            InitializerConfig::RandomNormal { mean, stddev } => {
                Arc::new(RandomNormalInitializer::new(mean, stddev)?)
            }
            InitializerConfig::TruncatedNormal { mean, stddev } => {
                Arc::new(TruncatedNormalInitializer::new(mean, stddev)?)
            }
        })
    }

    /// Checks the parameters without building the initializer.
    pub fn validate(&self) -> Result<()> {
        self.build().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_initializers() {
        assert_eq!(ZerosInitializer.initialize(3), vec![0.0; 3]);
        assert_eq!(OnesInitializer.initialize(2), vec![1.0; 2]);
        let constant = ConstantInitializer::new(0.5);
        assert_eq!(constant.initialize(4), vec![0.5; 4]);
        assert_eq!(constant.value(), 0.5);
        assert!(ZerosInitializer.initialize(0).is_empty());
    }

    #[test]
    fn test_random_uniform_range() {
        let initializer = RandomUniformInitializer::new(-0.1, 0.1).unwrap();
        for val in initializer.initialize(500) {
            assert!((-0.1..0.1).contains(&val), "value {val} out of range");
        }
        assert!(RandomUniformInitializer::new(0.1, -0.1).is_err());
    }

    #[test]
    fn test_random_normal_mean() {
        let initializer = RandomNormalInitializer::new(0.0, 0.1).unwrap();
        let values = initializer.initialize(2000);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean} too far from 0");
        assert!(RandomNormalInitializer::new(0.0, 0.0).is_err());
    }

    #[test]
    fn test_truncated_normal_bounds() {
        let initializer = TruncatedNormalInitializer::new(1.0, 0.1).unwrap();
        for val in initializer.initialize(1000) {
            assert!((0.8..=1.2).contains(&val), "value {val} outside 2 stddev");
        }
    }

    #[test]
    fn test_config_build_names() {
        let cases = [
            (InitializerConfig::Zeros, "zeros"),
            (InitializerConfig::Ones, "ones"),
            (InitializerConfig::Constant { value: 0.1 }, "constant"),
            (InitializerConfig::RandomUniform { min: -1.0, max: 1.0 }, "random_uniform"),
            (InitializerConfig::default(), "random_normal"),
            (
                InitializerConfig::TruncatedNormal {
                    mean: 0.0,
                    stddev: 0.1,
                },
                "truncated_normal",
            ),
        ];
        for (config, name) in cases {
            assert_eq!(config.build().unwrap().name(), name);
        }
    }

    #[test]
    fn test_config_serde_tagged() {
        let json = r#"{"type": "constant", "value": 0.25}"#;
        let config: InitializerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, InitializerConfig::Constant { value: 0.25 });
        assert!(InitializerConfig::RandomNormal {
            mean: 0.0,
            stddev: -1.0
        }
        .validate()
        .is_err());
    }
}
