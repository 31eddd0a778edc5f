//! Error types for tinyinfer
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is [`InferError`]. Errors are detected synchronously at the point of
//! violation and are never retried: they describe programming or data
//! errors (bad shapes, out-of-range indices, malformed checkpoints), not
//! transient faults.

use thiserror::Error;

/// Result type alias for tinyinfer operations
pub type Result<T> = std::result::Result<T, InferError>;

/// Error type for all tinyinfer operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferError {
    /// Operand shapes are incompatible for the requested operation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the mismatch
        reason: String,
    },

    /// Row or element index outside the tensor
    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Number of valid indices
        len: usize,
    },

    /// Token id outside the vocabulary
    #[error("Token {token} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange {
        /// Offending token id
        token: usize,
        /// Vocabulary size
        vocab_size: usize,
    },

    /// Sequence position at or beyond the model's context length
    #[error("Context limit exceeded: position {provided} >= maximum {maximum}")]
    ContextLimitExceeded {
        /// Requested position
        provided: usize,
        /// Maximum sequence length
        maximum: usize,
    },

    /// Position skips over cache rows that were never written
    #[error("Position {pos} skips ahead of the {cached} cached positions")]
    NonContiguousPosition {
        /// Requested position
        pos: usize,
        /// Number of valid cache rows
        cached: usize,
    },

    /// Hyperparameters violate the model's structural invariants
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O failure while reading a checkpoint or tokenizer
    #[error("I/O error: {message}")]
    IoError {
        /// Description of the failure
        message: String,
    },

    /// File contents do not match the expected binary layout
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the problem
        reason: String,
    },

    /// Operation not permitted on this value
    #[error("Unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Why it is not supported
        reason: String,
    },
}

impl From<std::io::Error> for InferError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
        }
    }
}
