//! Dense optimizers for dynamic embedding rows.
//!
//! Optimizers in this crate are stateless with respect to keys: the per-row
//! state (velocity, accumulators, moments) lives in a [`SlotState`] owned by
//! the caller and passed in on every update. A [`SlotStore`] keeps that state
//! keyed by embedding key, so a row keeps its optimizer history for as long as
//! its key is alive, independent of where the row sits in a batch.
//!
//! # Available Optimizers
//!
//! - [`Sgd`] - Stochastic Gradient Descent
//! - [`Momentum`] - Momentum, optionally Nesterov
//! - [`Adagrad`] - Adaptive Gradient Algorithm
//! - [`Adam`] - Adaptive Moment Estimation
//! - [`Ftrl`] - Follow The Regularized Leader
//!
//! # Example
//!
//! ```
//! use dynemb_optimizer::{create_optimizer, OptimizerConfig};
//!
//! let optimizer = create_optimizer(OptimizerConfig::Sgd { learning_rate: 0.1 }).unwrap();
//! let mut slots = optimizer.new_slots(3);
//!
//! let mut embedding = vec![1.0, 2.0, 3.0];
//! let gradients = vec![1.0, 1.0, 1.0];
//! optimizer
//!     .apply_gradients(&mut embedding, &gradients, &mut slots)
//!     .unwrap();
//! assert!((embedding[0] - 0.9).abs() < 1e-6);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod adagrad;
mod adam;
mod ftrl;
mod momentum;
mod sgd;
mod slots;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use ftrl::Ftrl;
pub use momentum::Momentum;
pub use sgd::Sgd;
pub use slots::{SlotState, SlotStore, SlotUndo};

/// Errors that can occur when working with optimizers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    /// Configuration or slot state type does not match the optimizer type.
    #[error("Config mismatch: expected {expected}, got {got}")]
    ConfigMismatch {
        /// What the optimizer expected.
        expected: String,
        /// What it was given.
        got: String,
    },

    /// Invalid configuration parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Rows and gradients have different lengths.
    #[error("Shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch {
        /// Expected number of values.
        expected: usize,
        /// Actual number of values.
        actual: usize,
    },
}

/// Configuration for different optimizer types.
///
/// This enum contains the configuration parameters for each supported
/// optimizer type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerConfig {
    /// Stochastic Gradient Descent configuration.
    Sgd {
        /// Learning rate for gradient updates.
        learning_rate: f32,
    },

    /// Momentum configuration.
    Momentum {
        /// Learning rate for gradient updates.
        learning_rate: f32,
        /// Momentum coefficient.
        momentum: f32,
        /// Weight decay (L2 regularization) coefficient.
        weight_decay: f32,
        /// Whether to use Nesterov momentum.
        use_nesterov: bool,
    },

    /// Adagrad configuration.
    Adagrad {
        /// Learning rate for gradient updates.
        learning_rate: f32,
        /// Initial value for the accumulator.
        initial_accumulator: f32,
        /// Weight decay (L2 regularization) coefficient.
        weight_decay: f32,
    },

    /// Adam configuration.
    Adam {
        /// Learning rate for gradient updates.
        learning_rate: f32,
        /// Exponential decay rate for first moment estimates.
        beta1: f32,
        /// Exponential decay rate for second moment estimates.
        beta2: f32,
        /// Small constant for numerical stability.
        epsilon: f32,
    },

    /// FTRL configuration.
    Ftrl {
        /// Learning rate for gradient updates.
        learning_rate: f32,
        /// Power for learning rate schedule (typically -0.5).
        learning_rate_power: f32,
        /// L1 regularization strength.
        l1_reg: f32,
        /// L2 regularization strength.
        l2_reg: f32,
    },
}

impl OptimizerConfig {
    /// Returns the name of the optimizer type.
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Sgd { .. } => "Sgd",
            OptimizerConfig::Momentum { .. } => "Momentum",
            OptimizerConfig::Adagrad { .. } => "Adagrad",
            OptimizerConfig::Adam { .. } => "Adam",
            OptimizerConfig::Ftrl { .. } => "Ftrl",
        }
    }

    /// Returns the learning rate for the optimizer.
    pub fn learning_rate(&self) -> f32 {
        match self {
            OptimizerConfig::Sgd { learning_rate } => *learning_rate,
            OptimizerConfig::Momentum { learning_rate, .. } => *learning_rate,
            OptimizerConfig::Adagrad { learning_rate, .. } => *learning_rate,
            OptimizerConfig::Adam { learning_rate, .. } => *learning_rate,
            OptimizerConfig::Ftrl { learning_rate, .. } => *learning_rate,
        }
    }
}

/// Checks that `value` is finite and strictly positive.
pub(crate) fn check_positive(name: &str, value: f32) -> Result<(), OptimizerError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(OptimizerError::InvalidParameter(format!(
            "{name} must be positive and finite, got {value}"
        )))
    }
}

/// Checks that `value` is finite and not negative.
pub(crate) fn check_non_negative(name: &str, value: f32) -> Result<(), OptimizerError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(OptimizerError::InvalidParameter(format!(
            "{name} must be non-negative and finite, got {value}"
        )))
    }
}

/// Checks that `value` lies in `[0, 1)`.
pub(crate) fn check_unit(name: &str, value: f32) -> Result<(), OptimizerError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(OptimizerError::InvalidParameter(format!(
            "{name} must be in [0, 1), got {value}"
        )))
    }
}

fn slot_mismatch(expected: &str, got: &SlotState) -> OptimizerError {
    OptimizerError::ConfigMismatch {
        expected: format!("{expected} slots"),
        got: format!("{} slots", got.name()),
    }
}

fn check_lengths(embedding: &[f32], gradients: &[f32]) -> Result<(), OptimizerError> {
    if embedding.len() != gradients.len() {
        return Err(OptimizerError::ShapeMismatch {
            expected: embedding.len(),
            actual: gradients.len(),
        });
    }
    Ok(())
}

/// Trait for embedding optimizers.
///
/// Implementations hold only hyper-parameters; every piece of per-row state
/// is passed in through `slots`, which makes one optimizer instance safe to
/// share across threads updating different rows.
pub trait Optimizer: Send + Sync {
    /// Returns a reference to the optimizer's configuration.
    fn config(&self) -> &OptimizerConfig;

    /// Creates fresh slot state for a row of width `dim`.
    fn new_slots(&self, dim: usize) -> SlotState;

    /// Applies gradients to one embedding row, updating its slot state.
    ///
    /// # Arguments
    ///
    /// * `embedding` - The embedding row to update (modified in place).
    /// * `gradients` - The gradient row to apply.
    /// * `slots` - The row's optimizer state.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::ShapeMismatch`] if the lengths differ and
    /// [`OptimizerError::ConfigMismatch`] if `slots` belongs to another
    /// optimizer type.
    fn apply_gradients(
        &self,
        embedding: &mut [f32],
        gradients: &[f32],
        slots: &mut SlotState,
    ) -> Result<(), OptimizerError>;
}

/// Creates an optimizer from the given configuration.
///
/// # Errors
///
/// Returns [`OptimizerError::InvalidParameter`] if a hyper-parameter is out
/// of range.
///
/// # Example
///
/// ```
/// use dynemb_optimizer::{create_optimizer, OptimizerConfig};
///
/// let config = OptimizerConfig::Adam {
///     learning_rate: 0.001,
///     beta1: 0.9,
///     beta2: 0.999,
///     epsilon: 1e-8,
/// };
///
/// let optimizer = create_optimizer(config).unwrap();
/// assert_eq!(optimizer.config().name(), "Adam");
/// ```
pub fn create_optimizer(config: OptimizerConfig) -> Result<Box<dyn Optimizer>, OptimizerError> {
    Ok(match &config {
        OptimizerConfig::Sgd { .. } => Box::new(Sgd::new(config)?),
        OptimizerConfig::Momentum { .. } => Box::new(Momentum::new(config)?),
        OptimizerConfig::Adagrad { .. } => Box::new(Adagrad::new(config)?),
        OptimizerConfig::Adam { .. } => Box::new(Adam::new(config)?),
        OptimizerConfig::Ftrl { .. } => Box::new(Ftrl::new(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_configs() -> Vec<OptimizerConfig> {
        vec![
            OptimizerConfig::Sgd { learning_rate: 0.01 },
            OptimizerConfig::Momentum {
                learning_rate: 0.01,
                momentum: 0.9,
                weight_decay: 0.0,
                use_nesterov: false,
            },
            OptimizerConfig::Adagrad {
                learning_rate: 0.01,
                initial_accumulator: 0.1,
                weight_decay: 0.0,
            },
            OptimizerConfig::Adam {
                learning_rate: 0.001,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            },
            OptimizerConfig::Ftrl {
                learning_rate: 0.1,
                learning_rate_power: -0.5,
                l1_reg: 0.0,
                l2_reg: 0.0,
            },
        ]
    }

    #[test]
    fn test_optimizer_config_name() {
        let sgd = OptimizerConfig::Sgd { learning_rate: 0.01 };
        assert_eq!(sgd.name(), "Sgd");

        let adam = OptimizerConfig::Adam {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        };
        assert_eq!(adam.name(), "Adam");
    }

    #[test]
    fn test_optimizer_config_learning_rate() {
        let adagrad = OptimizerConfig::Adagrad {
            learning_rate: 0.05,
            initial_accumulator: 0.1,
            weight_decay: 0.0,
        };
        assert!((adagrad.learning_rate() - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_create_all_optimizer_types() {
        for config in all_configs() {
            let optimizer = create_optimizer(config.clone()).unwrap();
            assert_eq!(optimizer.config().name(), config.name());

            let mut embedding = vec![1.0, 2.0];
            let mut slots = optimizer.new_slots(2);
            optimizer
                .apply_gradients(&mut embedding, &[1.0, 1.0], &mut slots)
                .unwrap();
            assert!(embedding.iter().all(|v| v.is_finite()), "{}", config.name());
        }
    }

    #[test]
    fn test_create_rejects_invalid_parameters() {
        let bad = [
            OptimizerConfig::Sgd { learning_rate: 0.0 },
            OptimizerConfig::Momentum {
                learning_rate: 0.1,
                momentum: 1.5,
                weight_decay: 0.0,
                use_nesterov: false,
            },
            OptimizerConfig::Adam {
                learning_rate: 0.1,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 0.0,
            },
            OptimizerConfig::Ftrl {
                learning_rate: 0.1,
                learning_rate_power: 0.5,
                l1_reg: 0.0,
                l2_reg: 0.0,
            },
        ];
        for config in bad {
            let err = create_optimizer(config.clone()).err();
            assert!(
                matches!(err, Some(OptimizerError::InvalidParameter(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_slot_type_mismatch() {
        let sgd = create_optimizer(OptimizerConfig::Sgd { learning_rate: 0.1 }).unwrap();
        let adam = create_optimizer(all_configs().remove(3)).unwrap();
        let mut slots = sgd.new_slots(1);
        let err = adam
            .apply_gradients(&mut [1.0], &[1.0], &mut slots)
            .unwrap_err();
        assert!(matches!(err, OptimizerError::ConfigMismatch { .. }));
    }

    #[test]
    fn test_length_mismatch() {
        let sgd = create_optimizer(OptimizerConfig::Sgd { learning_rate: 0.1 }).unwrap();
        let mut slots = sgd.new_slots(2);
        let err = sgd
            .apply_gradients(&mut [1.0, 2.0], &[1.0], &mut slots)
            .unwrap_err();
        assert_eq!(
            err,
            OptimizerError::ShapeMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_optimizer_config_serialization() {
        let config = OptimizerConfig::Adam {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        };

        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: OptimizerConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}
