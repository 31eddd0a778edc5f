//! Checkpoint Test Factory - Synthesizes valid checkpoints in memory
//!
//! `CheckpointBuilder` writes the header and every weight group for a given
//! [`Config`], so loader, model and benchmark code can run without real
//! model files.
//!
//! # Example
//!
//! ```
//! use tinyinfer::{checkpoint::{CheckpointBuilder, WeightGroup}, Checkpoint, Config};
//!
//! let config = Config {
//!     dim: 4, hidden_dim: 8, n_layers: 1, n_heads: 2,
//!     n_kv_heads: 1, vocab_size: 5, seq_len: 4,
//! };
//! let bytes = CheckpointBuilder::new(config)
//!     .fill_with(|group, _layer, i| match group {
//!         WeightGroup::RmsAtt | WeightGroup::RmsFfn | WeightGroup::RmsFinal => 1.0,
//!         _ => (i % 3) as f32 * 0.1,
//!     })
//!     .build();
//!
//! let checkpoint = Checkpoint::from_bytes(&bytes).unwrap();
//! assert_eq!(checkpoint.config().vocab_size, 5);
//! ```

use std::{fs, path::Path};

use crate::{
    config::Config,
    error::{InferError, Result},
};

use super::WeightGroup;

type FillFn = Box<dyn Fn(WeightGroup, usize, usize) -> f32>;

/// Builder for LLaMA2 float32 checkpoints
pub struct CheckpointBuilder {
    config: Config,
    shared_weights: bool,
    /// Value of element `index` of layer `layer`'s tensor in `group`
    fill: FillFn,
}

impl CheckpointBuilder {
    /// Builder with shared classifier weights and the default fill
    ///
    /// The default fill sets every norm gain to 1.0, the legacy rotary
    /// tables to 0.0, and all other weights to small deterministic values
    /// in `[-0.08, 0.08]`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared_weights: true,
            fill: Box::new(default_fill),
        }
    }

    /// Choose between a shared (embedding) and a separate classifier
    #[must_use]
    pub fn shared(mut self, shared_weights: bool) -> Self {
        self.shared_weights = shared_weights;
        self
    }

    /// Set every weight from `fill(group, layer, index)`
    ///
    /// `layer` is 0 for groups that are not per-layer and `index` is the
    /// flat row-major index within one tensor.
    #[must_use]
    pub fn fill_with<F>(mut self, fill: F) -> Self
    where
        F: Fn(WeightGroup, usize, usize) -> f32 + 'static,
    {
        self.fill = Box::new(fill);
        self
    }

    /// The seven header integers, with the vocabulary sign set from the
    /// shared flag
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn header(&self) -> [i32; 7] {
        let c = &self.config;
        let vocab = c.vocab_size as i32;
        [
            c.dim as i32,
            c.hidden_dim as i32,
            c.n_layers as i32,
            c.n_heads as i32,
            c.n_kv_heads as i32,
            if self.shared_weights { vocab } else { -vocab },
            c.seq_len as i32,
        ]
    }

    /// The weight section in file order
    #[must_use]
    pub fn weights(&self) -> Vec<f32> {
        let mut weights = Vec::new();
        for group in WeightGroup::LAYOUT {
            if group == WeightGroup::Classifier && self.shared_weights {
                continue;
            }
            let (rows, cols) = group.shape(&self.config);
            let layers = if group.is_per_layer() {
                self.config.n_layers
            } else {
                1
            };
            for layer in 0..layers {
                weights.extend((0..rows * cols).map(|i| (self.fill)(group, layer, i)));
            }
        }
        weights
    }

    /// Serialize to checkpoint bytes
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let header = self.header();
        let weights = self.weights();

        let mut bytes = Vec::with_capacity(super::HEADER_LEN + weights.len() * 4);
        for field in header {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        for w in weights {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    /// Serialize and write to `path`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be written
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.build()).map_err(|e| InferError::IoError {
            message: format!("Failed to write {}: {e}", path.display()),
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn default_fill(group: WeightGroup, layer: usize, index: usize) -> f32 {
    match group {
        WeightGroup::RmsAtt | WeightGroup::RmsFfn | WeightGroup::RmsFinal => 1.0,
        WeightGroup::FreqCisReal | WeightGroup::FreqCisImag => 0.0,
        _ => ((index * 7 + layer * 3) % 17) as f32 * 0.01 - 0.08,
    }
}
