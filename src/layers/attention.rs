//! Attention + feed-forward transformer block
//!
//! One decoder layer: RMS norm, grouped-query self-attention with rotary
//! position embeddings over a key/value cache, residual add, RMS norm,
//! `SwiGLU` feed-forward network, residual add.
//!
//! The layer holds weights only. The per-sequence key/value history lives in
//! a [`KVCache`] that the caller passes to [`AttentionLayer::forward`].

use crate::{
    config::Config,
    error::{InferError, Result},
    tensor::{dot, Tensor},
};

use super::{rms_norm, silu, softmax_in_place};

/// Base of the rotary frequency schedule
pub const ROPE_BASE: f32 = 10000.0;

/// Rotary Position Embeddings (`RoPE`)
///
/// Rotates consecutive element pairs of every head by a position-dependent
/// angle `θ = pos / base^(d / head_size)`, where `d` is the even offset of
/// the pair within its head.
///
/// # References
///
/// `RoFormer`: Enhanced Transformer with Rotary Position Embedding - Su et al., 2021
#[derive(Debug, Clone)]
pub struct RoPE {
    /// Head width (must be even)
    head_size: usize,
    /// Precomputed inverse frequencies, one per pair within a head
    inv_freq: Vec<f32>,
}

impl RoPE {
    /// Create a new `RoPE` table for heads of width `head_size`
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `head_size` is zero or odd
    pub fn new(head_size: usize, base: f32) -> Result<Self> {
        if head_size == 0 {
            return Err(InferError::InvalidShape {
                reason: "head_size must be > 0".to_string(),
            });
        }
        if head_size % 2 != 0 {
            return Err(InferError::InvalidShape {
                reason: format!("head_size {head_size} must be even for RoPE"),
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let inv_freq = (0..head_size)
            .step_by(2)
            .map(|d| 1.0 / base.powf(d as f32 / head_size as f32))
            .collect();

        Ok(Self {
            head_size,
            inv_freq,
        })
    }

    /// Head width this table was built for
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// Rotate `q` and `k` in place for position `pos`
    ///
    /// `q` spans all query heads and `k` all key/value heads. Pairs past the
    /// end of `k` (grouped-query attention, where `k` is narrower) rotate
    /// `q` only.
    pub fn rotate(&self, q: &mut [f32], k: &mut [f32], pos: usize) {
        #[allow(clippy::cast_precision_loss)]
        let pos = pos as f32;

        for i in (0..q.len()).step_by(2) {
            let theta = pos * self.inv_freq[(i % self.head_size) / 2];
            let (sin, cos) = theta.sin_cos();
            rotate_pair(&mut q[i..i + 2], cos, sin);
            if i < k.len() {
                rotate_pair(&mut k[i..i + 2], cos, sin);
            }
        }
    }
}

#[inline]
fn rotate_pair(pair: &mut [f32], cos: f32, sin: f32) {
    let (x, y) = (pair[0], pair[1]);
    pair[0] = x * cos - y * sin;
    pair[1] = x * sin + y * cos;
}

/// Key/value cache for one layer of one sequence
///
/// Two owned `(seq_len, kv_dim)` tensors allocated once, plus the number of
/// valid rows. Row `pos` is written by the forward call that processes
/// `pos`; rows past the valid count are never read, so resetting is a
/// logical operation that touches no memory.
#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached (rotated) keys: `[seq_len, kv_dim]`
    keys: Tensor<'static>,
    /// Cached values: `[seq_len, kv_dim]`
    values: Tensor<'static>,
    /// Number of valid rows
    len: usize,
}

impl KVCache {
    /// Create an empty cache
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if either dimension is zero
    pub fn new(seq_len: usize, kv_dim: usize) -> Result<Self> {
        if seq_len == 0 || kv_dim == 0 {
            return Err(InferError::InvalidShape {
                reason: format!("KV cache dimensions must be > 0, got {seq_len}x{kv_dim}"),
            });
        }

        Ok(Self {
            keys: Tensor::zeros(seq_len, kv_dim),
            values: Tensor::zeros(seq_len, kv_dim),
            len: 0,
        })
    }

    /// Create a cache sized for `config`
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the config has a zero `seq_len` or `kv_dim`
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.seq_len, config.kv_dim())
    }

    /// Number of valid cached positions
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no position has been cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of positions (`seq_len`)
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.keys.rows()
    }

    /// Width of each cached row
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.keys.cols()
    }

    /// Invalidate all cached positions for a new sequence
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Check that `pos` may be processed next
    ///
    /// Any `pos <= len` is accepted: `pos == len` appends, a smaller `pos`
    /// rewinds and discards the later rows.
    ///
    /// # Errors
    ///
    /// Returns `ContextLimitExceeded` if `pos >= seq_len` and
    /// `NonContiguousPosition` if `pos` skips rows that were never written.
    pub fn check_position(&self, pos: usize) -> Result<()> {
        if pos >= self.capacity() {
            return Err(InferError::ContextLimitExceeded {
                provided: pos,
                maximum: self.capacity(),
            });
        }
        if pos > self.len {
            return Err(InferError::NonContiguousPosition {
                pos,
                cached: self.len,
            });
        }
        Ok(())
    }

    /// Cached key row `t` as a `(1, kv_dim)` view
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfBounds` if `t >= seq_len`
    pub fn key_row(&self, t: usize) -> Result<Tensor<'_>> {
        self.keys.row(t)
    }

    /// Cached value row `t` as a `(1, kv_dim)` view
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfBounds` if `t >= seq_len`
    pub fn value_row(&self, t: usize) -> Result<Tensor<'_>> {
        self.values.row(t)
    }

    /// Write key and value rows at `pos` without changing the valid count
    pub(crate) fn store(&mut self, pos: usize, key: &[f32], value: &[f32]) -> Result<()> {
        if key.len() != self.kv_dim() || value.len() != self.kv_dim() {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "KV rows of {} and {} elements don't fit cache width {}",
                    key.len(),
                    value.len(),
                    self.kv_dim()
                ),
            });
        }
        self.keys.row_mut(pos)?.copy_from_slice(key);
        self.values.row_mut(pos)?.copy_from_slice(value);
        Ok(())
    }

    /// Mark positions `0..=pos` valid
    pub(crate) fn commit(&mut self, pos: usize) {
        self.len = pos + 1;
    }

    #[inline]
    fn head_slice(data: &[f32], kv_dim: usize, t: usize, kv_head: usize, head_size: usize) -> &[f32] {
        let start = t * kv_dim + kv_head * head_size;
        &data[start..start + head_size]
    }

    pub(crate) fn key(&self, t: usize, kv_head: usize, head_size: usize) -> &[f32] {
        Self::head_slice(self.keys.data(), self.kv_dim(), t, kv_head, head_size)
    }

    pub(crate) fn value(&self, t: usize, kv_head: usize, head_size: usize) -> &[f32] {
        Self::head_slice(self.values.data(), self.kv_dim(), t, kv_head, head_size)
    }
}

/// Weights of one transformer layer, shaped `(out_features, in_features)`
///
/// Usually views into a checkpoint buffer, but owned tensors work too.
#[derive(Debug, Clone)]
pub struct LayerWeights<'a> {
    /// Attention RMS norm gain `[1, dim]`
    pub rms_att_weight: Tensor<'a>,
    /// Query projection `[n_heads * head_size, dim]`
    pub query: Tensor<'a>,
    /// Key projection `[kv_dim, dim]`
    pub key: Tensor<'a>,
    /// Value projection `[kv_dim, dim]`
    pub value: Tensor<'a>,
    /// Attention output projection `[dim, n_heads * head_size]`
    pub weight_o: Tensor<'a>,
    /// Feed-forward RMS norm gain `[1, dim]`
    pub rms_ffn_weight: Tensor<'a>,
    /// Gate projection `[hidden_dim, dim]`
    pub weight1: Tensor<'a>,
    /// Down projection `[dim, hidden_dim]`
    pub weight2: Tensor<'a>,
    /// Up projection `[hidden_dim, dim]`
    pub weight3: Tensor<'a>,
}

impl LayerWeights<'_> {
    fn check_shapes(&self, config: &Config) -> Result<()> {
        let dim = config.dim;
        let q_dim = config.n_heads * config.head_size();
        let kv_dim = config.kv_dim();
        let hidden = config.hidden_dim;

        let expected = [
            ("rms_att_weight", &self.rms_att_weight, (1, dim)),
            ("query", &self.query, (q_dim, dim)),
            ("key", &self.key, (kv_dim, dim)),
            ("value", &self.value, (kv_dim, dim)),
            ("weight_o", &self.weight_o, (dim, q_dim)),
            ("rms_ffn_weight", &self.rms_ffn_weight, (1, dim)),
            ("weight1", &self.weight1, (hidden, dim)),
            ("weight2", &self.weight2, (dim, hidden)),
            ("weight3", &self.weight3, (hidden, dim)),
        ];

        for (name, tensor, shape) in expected {
            if tensor.shape() != shape {
                return Err(InferError::InvalidShape {
                    reason: format!(
                        "{name} has shape {:?}, expected {shape:?}",
                        tensor.shape()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// One decoder layer: grouped-query attention followed by a `SwiGLU` FFN
#[derive(Debug, Clone)]
pub struct AttentionLayer<'a> {
    config: Config,
    weights: LayerWeights<'a>,
    rope: RoPE,
}

impl<'a> AttentionLayer<'a> {
    /// Create a layer, validating every weight shape against `config`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `config` is invalid and
    /// `InvalidShape` naming the first mis-shaped weight.
    pub fn new(config: &Config, weights: LayerWeights<'a>) -> Result<Self> {
        config.validate()?;
        weights.check_shapes(config)?;
        let rope = RoPE::new(config.head_size(), ROPE_BASE)?;

        Ok(Self {
            config: *config,
            weights,
            rope,
        })
    }

    /// Layer weights
    #[must_use]
    pub fn weights(&self) -> &LayerWeights<'a> {
        &self.weights
    }

    /// Process the token at position `pos`
    ///
    /// `x` is the `(1, dim)` residual stream. The rotated key and the value
    /// for `pos` are written into `cache` row `pos`, attention reads rows
    /// `0..=pos`, and the updated residual stream is returned. On success
    /// `cache.len() == pos + 1`.
    ///
    /// # Errors
    ///
    /// Returns `ContextLimitExceeded` / `NonContiguousPosition` for an
    /// unusable `pos` and `InvalidShape` if `x` or `cache` do not match the
    /// layer's configuration. Every check runs before the cache is touched.
    pub fn forward(&self, x: &Tensor<'_>, cache: &mut KVCache, pos: usize) -> Result<Tensor<'static>> {
        if x.shape() != (1, self.config.dim) {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "Layer input has shape {:?}, expected (1, {})",
                    x.shape(),
                    self.config.dim
                ),
            });
        }
        if cache.capacity() != self.config.seq_len || cache.kv_dim() != self.config.kv_dim() {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "KV cache is {}x{}, layer needs {}x{}",
                    cache.capacity(),
                    cache.kv_dim(),
                    self.config.seq_len,
                    self.config.kv_dim()
                ),
            });
        }
        cache.check_position(pos)?;

        let w = &self.weights;
        let xb = rms_norm(x, &w.rms_att_weight)?;
        let mut q = xb.matmul(&w.query)?;
        let mut k = xb.matmul(&w.key)?;
        let v = xb.matmul(&w.value)?;

        self.rope.rotate(q.data_mut()?, k.data_mut()?, pos);
        cache.store(pos, k.data(), v.data())?;

        q.reshape(self.config.n_heads, self.config.head_size())?;
        let xb = self.attend(&q, cache, pos)?;
        let x = x.add(&xb.matmul(&w.weight_o)?)?;

        let ffn = self.feed_forward(&x)?;
        let x = x.add(&ffn)?;

        cache.commit(pos);
        Ok(x)
    }

    /// Causal attention of every query head over cache rows `0..=pos`
    ///
    /// `q` is shaped `(n_heads, head_size)`. Returns `(1, dim)` with head
    /// `h`'s output in columns `h * head_size..(h + 1) * head_size`.
    pub(crate) fn attend(&self, q: &Tensor<'_>, cache: &KVCache, pos: usize) -> Result<Tensor<'static>> {
        let head_size = self.config.head_size();
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (head_size as f32).sqrt();

        let mut out = vec![0.0; self.config.dim];
        let mut scores = vec![0.0; pos + 1];

        for (h, segment) in out.chunks_exact_mut(head_size).enumerate() {
            let q_head = q.row(h)?;
            let kv_head = self.config.kv_head(h);

            for (t, score) in scores.iter_mut().enumerate() {
                *score = dot(q_head.data(), cache.key(t, kv_head, head_size)) * scale;
            }
            softmax_in_place(&mut scores)?;

            for (t, &weight) in scores.iter().enumerate() {
                for (o, &v) in segment.iter_mut().zip(cache.value(t, kv_head, head_size)) {
                    *o += weight * v;
                }
            }
        }

        Tensor::from_vec(1, self.config.dim, out)
    }

    /// `SwiGLU`: `(silu(x·w1) * (x·w3)) · w2` on the normalized stream
    fn feed_forward(&self, x: &Tensor<'_>) -> Result<Tensor<'static>> {
        let w = &self.weights;
        let xb = rms_norm(x, &w.rms_ffn_weight)?;
        let gate = xb.matmul(&w.weight1)?;
        let up = xb.matmul(&w.weight3)?;
        silu(&gate).mul(&up)?.matmul(&w.weight2)
    }
}
