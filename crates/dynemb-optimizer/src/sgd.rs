//! Stochastic Gradient Descent (SGD) optimizer.
//!
//! SGD is a simple optimizer that updates parameters by subtracting
//! the gradient scaled by the learning rate. It keeps no slot state.
//!
//! # Example
//!
//! ```
//! use dynemb_optimizer::{Optimizer, OptimizerConfig, Sgd};
//!
//! let sgd = Sgd::new(OptimizerConfig::Sgd { learning_rate: 0.01 }).unwrap();
//! let mut slots = sgd.new_slots(3);
//! let mut embedding = vec![1.0, 2.0, 3.0];
//! let gradients = vec![0.1, 0.2, 0.3];
//! sgd.apply_gradients(&mut embedding, &gradients, &mut slots).unwrap();
//! ```

use crate::{check_lengths, check_positive, Optimizer, OptimizerConfig, OptimizerError, SlotState};

/// Stochastic Gradient Descent optimizer.
///
/// Updates embeddings using the formula:
/// `embedding = embedding - learning_rate * gradient`
#[derive(Debug, Clone)]
pub struct Sgd {
    /// Learning rate for gradient updates.
    learning_rate: f32,
    /// Configuration used to create this optimizer.
    config: OptimizerConfig,
}

impl Sgd {
    /// Creates a new SGD optimizer from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::ConfigMismatch`] for a non-SGD config and
    /// [`OptimizerError::InvalidParameter`] for a non-positive learning rate.
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        match config {
            OptimizerConfig::Sgd { learning_rate } => {
                check_positive("learning_rate", learning_rate)?;
                Ok(Self {
                    learning_rate,
                    config,
                })
            }
            _ => Err(OptimizerError::ConfigMismatch {
                expected: "Sgd".to_string(),
                got: config.name().to_string(),
            }),
        }
    }

    /// Creates a new SGD optimizer with the given learning rate.
    pub fn with_learning_rate(learning_rate: f32) -> Result<Self, OptimizerError> {
        Self::new(OptimizerConfig::Sgd { learning_rate })
    }
}

impl Optimizer for Sgd {
    fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn new_slots(&self, _dim: usize) -> SlotState {
        SlotState::None
    }

    fn apply_gradients(
        &self,
        embedding: &mut [f32],
        gradients: &[f32],
        _slots: &mut SlotState,
    ) -> Result<(), OptimizerError> {
        check_lengths(embedding, gradients)?;
        for (e, g) in embedding.iter_mut().zip(gradients.iter()) {
            *e -= self.learning_rate * g;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_basic_update() {
        let sgd = Sgd::with_learning_rate(0.1).unwrap();
        let mut slots = sgd.new_slots(3);

        let mut embedding = vec![1.0, 2.0, 3.0];
        let gradients = vec![1.0, 1.0, 1.0];

        sgd.apply_gradients(&mut embedding, &gradients, &mut slots)
            .unwrap();

        assert!((embedding[0] - 0.9).abs() < 1e-6);
        assert!((embedding[1] - 1.9).abs() < 1e-6);
        assert!((embedding[2] - 2.9).abs() < 1e-6);
        assert_eq!(slots, SlotState::None);
    }

    #[test]
    fn test_sgd_config_mismatch() {
        let config = OptimizerConfig::Adam {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        };
        let result = Sgd::new(config);
        result.expect_err("SGD constructor should fail when config variant is not SGD");
    }

    #[test]
    fn test_sgd_rejects_negative_learning_rate() {
        assert!(matches!(
            Sgd::with_learning_rate(-0.1),
            Err(OptimizerError::InvalidParameter(_))
        ));
    }
}
