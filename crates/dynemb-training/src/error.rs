//! Error types for training steps.

use dynemb_hash_table::EmbeddingError;
use dynemb_optimizer::OptimizerError;
use thiserror::Error;

/// Errors raised while looking up or updating embeddings through a shadow.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// The underlying table rejected the request.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// The optimizer rejected the update.
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// The shadow holds no lookup that an update may consume.
    #[error("Stale shadow reference '{shadow}': {reason}")]
    StaleShadowReference {
        /// Name of the shadow variable.
        shadow: String,
        /// Why the shadow cannot be used.
        reason: String,
    },

    /// Gradients don't line up with the looked-up rows.
    #[error("Shape mismatch: expected {expected} gradient values, got {actual}")]
    ShapeMismatch {
        /// Expected number of values.
        expected: usize,
        /// Actual number of values.
        actual: usize,
    },
}

/// Result type for training operations.
pub type TrainingResult<T> = Result<T, TrainingError>;
