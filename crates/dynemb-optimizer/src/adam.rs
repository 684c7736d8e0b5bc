//! Adam optimizer.
//!
//! Adam (Adaptive Moment Estimation) combines the benefits of momentum
//! and RMSprop by maintaining exponential moving averages of both the
//! gradients (first moment) and squared gradients (second moment).
//!
//! The bias-correction timestep is part of each row's slot state, so a row
//! that is updated rarely is corrected for its own number of updates rather
//! than the global step count.
//!
//! # Example
//!
//! ```
//! use dynemb_optimizer::{Adam, Optimizer, OptimizerConfig};
//!
//! let config = OptimizerConfig::Adam {
//!     learning_rate: 0.001,
//!     beta1: 0.9,
//!     beta2: 0.999,
//!     epsilon: 1e-8,
//! };
//! let adam = Adam::new(config).unwrap();
//! let mut slots = adam.new_slots(3);
//! let mut embedding = vec![1.0, 2.0, 3.0];
//! let gradients = vec![0.1, 0.2, 0.3];
//! adam.apply_gradients(&mut embedding, &gradients, &mut slots).unwrap();
//! ```

use crate::{
    check_lengths, check_positive, check_unit, slot_mismatch, Optimizer, OptimizerConfig,
    OptimizerError, SlotState,
};

/// Adam optimizer with adaptive learning rates and momentum.
///
/// Updates embeddings using the formula:
/// ```text
/// m = beta1 * m + (1 - beta1) * gradient
/// v = beta2 * v + (1 - beta2) * gradient^2
/// m_hat = m / (1 - beta1^t)
/// v_hat = v / (1 - beta2^t)
/// embedding = embedding - learning_rate * m_hat / (sqrt(v_hat) + epsilon)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    config: OptimizerConfig,
}

impl Adam {
    /// Creates a new Adam optimizer from its configuration.
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        match config {
            OptimizerConfig::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                check_positive("learning_rate", learning_rate)?;
                check_unit("beta1", beta1)?;
                check_unit("beta2", beta2)?;
                check_positive("epsilon", epsilon)?;
                Ok(Self {
                    learning_rate,
                    beta1,
                    beta2,
                    epsilon,
                    config,
                })
            }
            _ => Err(OptimizerError::ConfigMismatch {
                expected: "Adam".to_string(),
                got: config.name().to_string(),
            }),
        }
    }
}

impl Optimizer for Adam {
    fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn new_slots(&self, dim: usize) -> SlotState {
        SlotState::Adam {
            m: vec![0.0; dim],
            v: vec![0.0; dim],
            t: 0,
        }
    }

    fn apply_gradients(
        &self,
        embedding: &mut [f32],
        gradients: &[f32],
        slots: &mut SlotState,
    ) -> Result<(), OptimizerError> {
        check_lengths(embedding, gradients)?;
        let SlotState::Adam { m, v, t } = slots else {
            return Err(slot_mismatch("Adam", slots));
        };
        if m.len() != embedding.len() || v.len() != embedding.len() {
            *m = vec![0.0; embedding.len()];
            *v = vec![0.0; embedding.len()];
            *t = 0;
        }

        *t += 1;
        let step = i32::try_from(*t).unwrap_or(i32::MAX);
        let bias_correction1 = 1.0 - self.beta1.powi(step);
        let bias_correction2 = 1.0 - self.beta2.powi(step);

        for (i, (e, g)) in embedding.iter_mut().zip(gradients).enumerate() {
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;

            let m_hat = m[i] / bias_correction1;
            let v_hat = v[i] / bias_correction2;

            *e -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
        Ok(())
    }
}
