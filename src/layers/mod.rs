//! Neural network layers for LLaMA2-style transformer models
//!
//! Implements the building blocks of the decoder:
//! - Math kernels: RMS normalization, softmax, sigmoid, `SiLU`
//! - [`AttentionLayer`]: multi-head / grouped-query attention with rotary
//!   position embeddings, a per-sequence [`KVCache`], and a `SwiGLU`
//!   feed-forward network
//! - [`Model`]: embedding lookup, the layer stack, final norm and
//!   classifier projection
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinyinfer::{Checkpoint, Model};
//!
//! let checkpoint = Checkpoint::open("stories15M.bin")?;
//! let model = Model::from_checkpoint(&checkpoint)?;
//! let mut state = model.new_state()?;
//!
//! let logits = model.forward(&mut state, 1, 0)?;
//! assert_eq!(logits.cols(), model.config().vocab_size);
//! # Ok::<(), tinyinfer::InferError>(())
//! ```
//!
//! Weights are views into the checkpoint buffer and never mutated. All
//! per-sequence mutable state lives in [`DecodeState`], one [`KVCache`] per
//! layer, so a single model can decode several independent sequences.

use crate::{
    error::{InferError, Result},
    tensor::Tensor,
};

mod attention;
pub use attention::{AttentionLayer, KVCache, LayerWeights, RoPE, ROPE_BASE};
mod model;
pub use model::{DecodeState, Model};

/// Epsilon added to the mean square in [`rms_norm`]
pub const RMS_NORM_EPS: f32 = 1e-5;

/// RMS normalization with the default epsilon ([`RMS_NORM_EPS`])
///
/// Computes `ss = eps + mean(x²)` over all elements and returns
/// `weight[i] * x[i] / sqrt(ss)`.
///
/// # Errors
///
/// Returns `InvalidShape` if `x` and `weight` have different shapes or are
/// empty.
///
/// # Examples
///
/// ```
/// use tinyinfer::{layers::rms_norm, Tensor};
///
/// let x = Tensor::from_vec(1, 2, vec![3.0, 4.0]).unwrap();
/// let w = Tensor::filled(1, 2, 1.0);
/// let y = rms_norm(&x, &w).unwrap();
/// let mean_sq: f32 = y.data().iter().map(|v| v * v).sum::<f32>() / 2.0;
/// assert!((mean_sq - 1.0).abs() < 1e-5);
/// ```
pub fn rms_norm(x: &Tensor<'_>, weight: &Tensor<'_>) -> Result<Tensor<'static>> {
    rms_norm_eps(x, weight, RMS_NORM_EPS)
}

/// RMS normalization with an explicit epsilon
///
/// # Errors
///
/// Returns `InvalidShape` if `x` and `weight` have different shapes or are
/// empty.
pub fn rms_norm_eps(x: &Tensor<'_>, weight: &Tensor<'_>, eps: f32) -> Result<Tensor<'static>> {
    if x.shape() != weight.shape() {
        return Err(InferError::InvalidShape {
            reason: format!(
                "rms_norm weight shape {:?} doesn't match input shape {:?}",
                weight.shape(),
                x.shape()
            ),
        });
    }
    if x.is_empty() {
        return Err(InferError::InvalidShape {
            reason: "Cannot apply rms_norm to empty tensor".to_string(),
        });
    }

    let data = x.data();
    #[allow(clippy::cast_precision_loss)]
    let mean_sq = data.iter().map(|v| v * v).sum::<f32>() / data.len() as f32;
    let scale = 1.0 / (eps + mean_sq).sqrt();

    let output = data
        .iter()
        .zip(weight.data())
        .map(|(&v, &w)| w * (v * scale))
        .collect();
    Tensor::from_vec(x.rows(), x.cols(), output)
}

/// Apply softmax to a single row or column
///
/// Softmax: `y[i] = exp(x[i] - max) / sum(exp(x[j] - max))`
///
/// The maximum is subtracted before exponentiating, so inputs of any
/// magnitude are safe.
///
/// # Errors
///
/// Returns `InvalidShape` if the tensor is empty or is neither a single row
/// nor a single column.
///
/// # Examples
///
/// ```
/// use tinyinfer::{layers::softmax, Tensor};
///
/// let x = Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
/// let y = softmax(&x).unwrap();
/// let sum: f32 = y.data().iter().sum();
/// assert!((sum - 1.0).abs() < 1e-6);
/// ```
pub fn softmax(x: &Tensor<'_>) -> Result<Tensor<'static>> {
    if x.rows() != 1 && x.cols() != 1 {
        return Err(InferError::InvalidShape {
            reason: format!(
                "softmax expects a single row or column, got {}x{}",
                x.rows(),
                x.cols()
            ),
        });
    }

    let mut output = x.data().to_vec();
    softmax_in_place(&mut output)?;
    Tensor::from_vec(x.rows(), x.cols(), output)
}

/// Softmax over a raw slice, in place
///
/// Used on scratch buffers (attention scores, sampler probabilities) where
/// wrapping in a tensor would only add a copy.
///
/// # Errors
///
/// Returns `InvalidShape` if `values` is empty.
pub fn softmax_in_place(values: &mut [f32]) -> Result<()> {
    if values.is_empty() {
        return Err(InferError::InvalidShape {
            reason: "Cannot apply softmax to empty tensor".to_string(),
        });
    }

    let max_val = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
    Ok(())
}

#[inline]
fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub(crate) fn silu_scalar(x: f32) -> f32 {
    x * sigmoid_scalar(x)
}

/// Elementwise logistic sigmoid `1 / (1 + e^-x)`
#[must_use]
pub fn sigmoid(x: &Tensor<'_>) -> Tensor<'static> {
    x.map(sigmoid_scalar)
}

/// Elementwise `SiLU`: `x * sigmoid(x)`
///
/// Gate activation of the `SwiGLU` feed-forward network.
#[must_use]
pub fn silu(x: &Tensor<'_>) -> Tensor<'static> {
    x.map(silu_scalar)
}

#[cfg(test)]
mod tests;
