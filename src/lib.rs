//! # tinyinfer
//!
//! Pure Rust, single-sequence inference for LLaMA2-style decoder-only
//! transformers stored as flat float32 checkpoints.
//!
//! ## Features
//!
//! - **Zero-copy weights**: checkpoints are memory-mapped and every weight
//!   tensor is a borrowed view, tied to the checkpoint by its lifetime
//! - **Grouped-query attention** with rotary position embeddings and a
//!   per-sequence key/value cache
//! - **Explicit position contract**: out-of-range or skipped positions are
//!   errors, and a failed step leaves the cache untouched
//! - **Complete pipeline**: BPE tokenizer, greedy / multinomial / top-p
//!   sampling, and a CLI
//!
//! ## Example
//!
//! ```rust
//! use tinyinfer::Tensor;
//!
//! let x = Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
//! let w = Tensor::from_vec(2, 3, vec![
//!     1.0, 0.0, 0.0,
//!     0.0, 1.0, 1.0,
//! ]).unwrap();
//!
//! // Row-dot-row: (1x3) · (2x3)ᵗ = (1x2)
//! let y = x.matmul(&w).unwrap();
//! assert_eq!(y.data(), &[1.0, 5.0]);
//! ```
//!
//! ## Decoding
//!
//! ```rust,no_run
//! use tinyinfer::{Checkpoint, Model};
//!
//! let checkpoint = Checkpoint::open("stories15M.bin")?;
//! let model = Model::from_checkpoint(&checkpoint)?;
//! let mut state = model.new_state()?;
//!
//! let mut token = 1; // BOS
//! for pos in 0..16 {
//!     let logits = model.forward(&mut state, token, pos)?;
//!     token = tinyinfer::generate::sample_argmax(logits.data())?;
//! }
//! # Ok::<(), tinyinfer::InferError>(())
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 precision loss is acceptable
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Allow float comparisons in tests
#![allow(clippy::many_single_char_names)] // Math kernels use q, k, v, x

/// Checkpoint loading: header parsing, memory mapping, weight layout
pub mod checkpoint;
/// Model hyperparameters and derived sizes
pub mod config;
pub mod error;
/// Sampling strategies and the generation loop
pub mod generate;
pub mod layers;
pub mod tensor;
/// BPE tokenizer for `tokenizer.bin` vocabularies
pub mod tokenizer;

// Re-exports for convenience
pub use checkpoint::Checkpoint;
pub use config::Config;
pub use error::{InferError, Result};
pub use layers::{DecodeState, Model};
pub use tensor::Tensor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_reexports() {
        let t = Tensor::zeros(1, 1);
        assert_eq!(t.shape(), (1, 1));
        let err: Result<()> = Err(InferError::InvalidConfiguration("x".to_string()));
        assert!(err.is_err());
    }
}
