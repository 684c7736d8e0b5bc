//! Adagrad optimizer.
//!
//! Adagrad adapts the learning rate for each parameter based on the
//! historical sum of squared gradients. This allows for larger updates
//! on infrequent parameters and smaller updates on frequent ones, which is
//! why it is a common choice for sparse embedding rows.
//!
//! # Example
//!
//! ```
//! use dynemb_optimizer::{Adagrad, Optimizer, OptimizerConfig};
//!
//! let config = OptimizerConfig::Adagrad {
//!     learning_rate: 0.01,
//!     initial_accumulator: 0.1,
//!     weight_decay: 0.0,
//! };
//! let adagrad = Adagrad::new(config).unwrap();
//! let mut slots = adagrad.new_slots(3);
//! let mut embedding = vec![1.0, 2.0, 3.0];
//! let gradients = vec![0.1, 0.2, 0.3];
//! adagrad.apply_gradients(&mut embedding, &gradients, &mut slots).unwrap();
//! ```

use crate::{
    check_lengths, check_non_negative, check_positive, slot_mismatch, Optimizer, OptimizerConfig,
    OptimizerError, SlotState,
};

/// Adagrad optimizer with per-parameter adaptive learning rates.
///
/// Updates embeddings using the formula:
/// ```text
/// accumulator = accumulator + gradient^2
/// embedding = embedding - learning_rate * gradient / sqrt(accumulator)
/// ```
#[derive(Debug, Clone)]
pub struct Adagrad {
    learning_rate: f32,
    initial_accumulator: f32,
    weight_decay: f32,
    config: OptimizerConfig,
}

impl Adagrad {
    /// Creates a new Adagrad optimizer from its configuration.
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        match config {
            OptimizerConfig::Adagrad {
                learning_rate,
                initial_accumulator,
                weight_decay,
            } => {
                check_positive("learning_rate", learning_rate)?;
                check_non_negative("initial_accumulator", initial_accumulator)?;
                check_non_negative("weight_decay", weight_decay)?;
                Ok(Self {
                    learning_rate,
                    initial_accumulator,
                    weight_decay,
                    config,
                })
            }
            _ => Err(OptimizerError::ConfigMismatch {
                expected: "Adagrad".to_string(),
                got: config.name().to_string(),
            }),
        }
    }
}

impl Optimizer for Adagrad {
    fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn new_slots(&self, dim: usize) -> SlotState {
        SlotState::Adagrad {
            accumulator: vec![self.initial_accumulator; dim],
        }
    }

    fn apply_gradients(
        &self,
        embedding: &mut [f32],
        gradients: &[f32],
        slots: &mut SlotState,
    ) -> Result<(), OptimizerError> {
        check_lengths(embedding, gradients)?;
        let SlotState::Adagrad { accumulator } = slots else {
            return Err(slot_mismatch("Adagrad", slots));
        };
        if accumulator.len() != embedding.len() {
            *accumulator = vec![self.initial_accumulator; embedding.len()];
        }

        for ((e, g), acc) in embedding
            .iter_mut()
            .zip(gradients)
            .zip(accumulator.iter_mut())
        {
            let grad = *g + self.weight_decay * *e;
            *acc += grad * grad;
            // A zero accumulator implies a zero gradient so far.
            if *acc > 0.0 {
                *e -= self.learning_rate * grad / acc.sqrt();
            }
        }
        Ok(())
    }
}
