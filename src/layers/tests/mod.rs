//! Layer tests
//!
//! Kernels, the attention block and the model orchestrator, each in its own
//! file. Shared fixtures live here.

use crate::{config::Config, layers::LayerWeights, tensor::Tensor};

mod model;

/// Config with grouped-query attention: 4 query heads over 2 KV heads
pub(super) fn gqa_config() -> Config {
    Config {
        dim: 8,
        hidden_dim: 12,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: 2,
        vocab_size: 6,
        seq_len: 5,
    }
}

/// The synthetic config used across the end-to-end checks
pub(super) fn tiny_config() -> Config {
    Config {
        dim: 4,
        hidden_dim: 8,
        n_layers: 1,
        n_heads: 2,
        n_kv_heads: 1,
        vocab_size: 5,
        seq_len: 4,
    }
}

/// Owned layer weights with norm gains of 1 and a deterministic pattern
/// everywhere else
pub(super) fn owned_weights(config: &Config) -> LayerWeights<'static> {
    let dim = config.dim;
    let q_dim = config.n_heads * config.head_size();
    let kv_dim = config.kv_dim();
    let hidden = config.hidden_dim;

    let pattern = |rows: usize, cols: usize, salt: usize| {
        let data = (0..rows * cols)
            .map(|i| ((i * 5 + salt) % 11) as f32 * 0.02 - 0.1)
            .collect();
        Tensor::from_vec(rows, cols, data).expect("test")
    };

    LayerWeights {
        rms_att_weight: Tensor::filled(1, dim, 1.0),
        query: pattern(q_dim, dim, 1),
        key: pattern(kv_dim, dim, 2),
        value: pattern(kv_dim, dim, 3),
        weight_o: pattern(dim, q_dim, 4),
        rms_ffn_weight: Tensor::filled(1, dim, 1.0),
        weight1: pattern(hidden, dim, 5),
        weight2: pattern(dim, hidden, 6),
        weight3: pattern(hidden, dim, 7),
    }
}
