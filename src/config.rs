//! Model hyperparameters
//!
//! [`Config`] mirrors the seven-integer checkpoint header and derives the
//! per-head sizes used by attention. A config is only usable after
//! [`Config::validate`] has accepted it.

use serde::{Deserialize, Serialize};

use crate::error::{InferError, Result};

/// Transformer hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Embedding / residual stream width
    pub dim: usize,
    /// Feed-forward hidden width
    pub hidden_dim: usize,
    /// Number of transformer layers
    pub n_layers: usize,
    /// Number of query heads
    pub n_heads: usize,
    /// Number of key/value heads (less than `n_heads` for grouped-query attention)
    pub n_kv_heads: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length (context window)
    pub seq_len: usize,
}

impl Config {
    /// Check the structural invariants
    ///
    /// All sizes must be positive, `dim` divisible by `n_heads`, `n_heads`
    /// divisible by `n_kv_heads`, and `head_size` even so rotary
    /// embeddings can pair up elements.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` naming the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| *v == 0) {
            return Err(InferError::InvalidConfiguration(format!(
                "{name} must be > 0"
            )));
        }

        if self.dim % self.n_heads != 0 {
            return Err(InferError::InvalidConfiguration(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(InferError::InvalidConfiguration(format!(
                "n_heads {} is not divisible by n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.head_size() % 2 != 0 {
            return Err(InferError::InvalidConfiguration(format!(
                "head_size {} must be even for rotary embeddings",
                self.head_size()
            )));
        }

        Ok(())
    }

    /// Width of one attention head
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of the key/value projections
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_size()
    }

    /// Query heads per key/value head
    #[must_use]
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Key/value head read by query head `head`
    #[must_use]
    pub fn kv_head(&self, head: usize) -> usize {
        head / self.kv_mul()
    }
}
