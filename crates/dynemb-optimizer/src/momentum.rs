//! Momentum optimizer.
//!
//! Momentum accelerates gradient descent by accumulating a velocity vector
//! in the direction of persistent reduction in the objective. Each embedding
//! row keeps its own velocity in its slot state.
//!
//! # Example
//!
//! ```
//! use dynemb_optimizer::{Momentum, Optimizer, OptimizerConfig};
//!
//! let config = OptimizerConfig::Momentum {
//!     learning_rate: 0.01,
//!     momentum: 0.9,
//!     weight_decay: 0.0,
//!     use_nesterov: false,
//! };
//! let momentum = Momentum::new(config).unwrap();
//! let mut slots = momentum.new_slots(3);
//! let mut embedding = vec![1.0, 2.0, 3.0];
//! let gradients = vec![0.1, 0.2, 0.3];
//! momentum.apply_gradients(&mut embedding, &gradients, &mut slots).unwrap();
//! ```

use crate::{
    check_lengths, check_non_negative, check_positive, check_unit, slot_mismatch, Optimizer,
    OptimizerConfig, OptimizerError, SlotState,
};

/// Momentum optimizer with optional Nesterov acceleration.
///
/// Updates embeddings using the formula:
/// ```text
/// velocity = momentum * velocity + gradient
/// embedding = embedding - learning_rate * velocity  (standard)
/// ```
///
/// With Nesterov momentum:
/// ```text
/// velocity = momentum * velocity + gradient
/// embedding = embedding - learning_rate * (momentum * velocity + gradient)
/// ```
#[derive(Debug, Clone)]
pub struct Momentum {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    use_nesterov: bool,
    config: OptimizerConfig,
}

impl Momentum {
    /// Creates a new Momentum optimizer from its configuration.
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        match config {
            OptimizerConfig::Momentum {
                learning_rate,
                momentum,
                weight_decay,
                use_nesterov,
            } => {
                check_positive("learning_rate", learning_rate)?;
                check_unit("momentum", momentum)?;
                check_non_negative("weight_decay", weight_decay)?;
                Ok(Self {
                    learning_rate,
                    momentum,
                    weight_decay,
                    use_nesterov,
                    config,
                })
            }
            _ => Err(OptimizerError::ConfigMismatch {
                expected: "Momentum".to_string(),
                got: config.name().to_string(),
            }),
        }
    }

    /// Returns whether Nesterov momentum is enabled.
    pub fn is_nesterov(&self) -> bool {
        self.use_nesterov
    }
}

impl Optimizer for Momentum {
    fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn new_slots(&self, dim: usize) -> SlotState {
        SlotState::Momentum {
            velocity: vec![0.0; dim],
        }
    }

    fn apply_gradients(
        &self,
        embedding: &mut [f32],
        gradients: &[f32],
        slots: &mut SlotState,
    ) -> Result<(), OptimizerError> {
        check_lengths(embedding, gradients)?;
        let SlotState::Momentum { velocity } = slots else {
            return Err(slot_mismatch("Momentum", slots));
        };
        if velocity.len() != embedding.len() {
            *velocity = vec![0.0; embedding.len()];
        }

        for ((e, g), v) in embedding.iter_mut().zip(gradients).zip(velocity.iter_mut()) {
            let grad = *g + self.weight_decay * *e;
            *v = self.momentum * *v + grad;
            if self.use_nesterov {
                *e -= self.learning_rate * (self.momentum * *v + grad);
            } else {
                *e -= self.learning_rate * *v;
            }
        }
        Ok(())
    }
}
