//! Error types for embedding table operations.

use thiserror::Error;

/// Errors that can occur during embedding table operations.
///
/// Structural errors (shape, type, configuration) are returned at the call
/// boundary before any shard is touched. [`EmbeddingError::CapacityExhausted`]
/// is fatal for the call and is never retried inside the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    /// The flattened value buffer doesn't match `key_count * dim`.
    #[error(
        "shape mismatch for {key_count} keys: expected {expected} values, got {actual}"
    )]
    ShapeMismatch {
        /// Number of keys in the request.
        key_count: usize,
        /// Expected length of the flattened value buffer.
        expected: usize,
        /// Actual length of the flattened value buffer.
        actual: usize,
    },

    /// The value width doesn't match the table's embedding dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured embedding dimension.
        expected: usize,
        /// Dimension that was provided.
        actual: usize,
    },

    /// A key or value dtype disagrees with the table configuration.
    #[error("type mismatch: table expects {expected}, got {actual}")]
    TypeMismatch {
        /// Dtype the table was configured with.
        expected: String,
        /// Dtype (or offending value) that was provided.
        actual: String,
    },

    /// The table or one of its plug-ins is misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A shard could not grow to hold the requested entries.
    #[error(
        "capacity exhausted on shard {shard}: capacity {capacity}, requested {requested} entries"
    )]
    CapacityExhausted {
        /// Index of the shard that failed to grow.
        shard: usize,
        /// Capacity of the shard at the time of the failure.
        capacity: usize,
        /// Number of entries the shard would have needed to hold.
        requested: usize,
    },

    /// An invalid shard index was specified.
    #[error("invalid shard index: {index} (num_shards: {num_shards})")]
    InvalidShardIndex {
        /// The invalid shard index.
        index: usize,
        /// Total number of shards.
        num_shards: usize,
    },
}

/// A specialized Result type for embedding table operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = EmbeddingError::ShapeMismatch {
            key_count: 3,
            expected: 12,
            actual: 8,
        };
        assert_eq!(
            err.to_string(),
            "shape mismatch for 3 keys: expected 12 values, got 8"
        );

        let err = EmbeddingError::CapacityExhausted {
            shard: 1,
            capacity: 64,
            requested: 65,
        };
        assert!(err.to_string().contains("shard 1"));
        assert!(err.to_string().contains("65"));
    }
}
