//! FTRL (Follow The Regularized Leader) optimizer.
//!
//! FTRL is an online learning algorithm that is particularly effective
//! for training sparse models. It produces sparser models than other
//! optimizers due to its L1 regularization.
//!
//! # Example
//!
//! ```
//! use dynemb_optimizer::{Ftrl, Optimizer, OptimizerConfig};
//!
//! let config = OptimizerConfig::Ftrl {
//!     learning_rate: 0.1,
//!     learning_rate_power: -0.5,
//!     l1_reg: 0.0,
//!     l2_reg: 0.0,
//! };
//! let ftrl = Ftrl::new(config).unwrap();
//! let mut slots = ftrl.new_slots(3);
//! let mut embedding = vec![1.0, 2.0, 3.0];
//! let gradients = vec![0.1, 0.2, 0.3];
//! ftrl.apply_gradients(&mut embedding, &gradients, &mut slots).unwrap();
//! ```

use crate::{
    check_lengths, check_non_negative, check_positive, slot_mismatch, Optimizer, OptimizerConfig,
    OptimizerError, SlotState,
};

/// FTRL optimizer for sparse model training.
///
/// Updates embeddings using the FTRL-Proximal algorithm:
/// ```text
/// n = n + gradient^2
/// sigma = (n^(-power) - n_prev^(-power)) / learning_rate
/// z = z + gradient - sigma * embedding
/// if |z| <= l1_reg:
///     embedding = 0
/// else:
///     embedding = -(z - sign(z) * l1_reg) / (n^(-power) / learning_rate + l2_reg)
/// ```
#[derive(Debug, Clone)]
pub struct Ftrl {
    learning_rate: f32,
    learning_rate_power: f32,
    l1_reg: f32,
    l2_reg: f32,
    config: OptimizerConfig,
}

impl Ftrl {
    /// Creates a new FTRL optimizer from its configuration.
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        match config {
            OptimizerConfig::Ftrl {
                learning_rate,
                learning_rate_power,
                l1_reg,
                l2_reg,
            } => {
                check_positive("learning_rate", learning_rate)?;
                if !(learning_rate_power <= 0.0 && learning_rate_power.is_finite()) {
                    return Err(OptimizerError::InvalidParameter(format!(
                        "learning_rate_power must be non-positive, got {learning_rate_power}"
                    )));
                }
                check_non_negative("l1_reg", l1_reg)?;
                check_non_negative("l2_reg", l2_reg)?;
                Ok(Self {
                    learning_rate,
                    learning_rate_power,
                    l1_reg,
                    l2_reg,
                    config,
                })
            }
            _ => Err(OptimizerError::ConfigMismatch {
                expected: "Ftrl".to_string(),
                got: config.name().to_string(),
            }),
        }
    }
}

impl Optimizer for Ftrl {
    fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn new_slots(&self, dim: usize) -> SlotState {
        SlotState::Ftrl {
            z: vec![0.0; dim],
            n: vec![0.0; dim],
        }
    }

    fn apply_gradients(
        &self,
        embedding: &mut [f32],
        gradients: &[f32],
        slots: &mut SlotState,
    ) -> Result<(), OptimizerError> {
        check_lengths(embedding, gradients)?;
        let SlotState::Ftrl { z, n } = slots else {
            return Err(slot_mismatch("Ftrl", slots));
        };
        if z.len() != embedding.len() || n.len() != embedding.len() {
            *z = vec![0.0; embedding.len()];
            *n = vec![0.0; embedding.len()];
        }

        let power = -self.learning_rate_power;
        for (i, (e, g)) in embedding.iter_mut().zip(gradients).enumerate() {
            let n_prev = n[i];
            let n_new = n_prev + g * g;
            n[i] = n_new;

            let sigma = (n_new.powf(power) - n_prev.powf(power)) / self.learning_rate;
            z[i] += *g - sigma * *e;

            let zi = z[i];
            if zi.abs() <= self.l1_reg {
                *e = 0.0;
            } else {
                let denominator = n_new.powf(power) / self.learning_rate + self.l2_reg;
                *e = -(zi - zi.signum() * self.l1_reg) / denominator;
            }
        }
        Ok(())
    }
}
