//! Model orchestrator and per-sequence decode state

use tracing::debug;

use crate::{
    checkpoint::{Checkpoint, WeightGroup},
    config::Config,
    error::{InferError, Result},
    tensor::Tensor,
};

use super::{rms_norm, AttentionLayer, KVCache, LayerWeights};

/// Per-sequence decoding state: one [`KVCache`] per layer
///
/// A model is immutable, so any number of `DecodeState`s can decode
/// independent sequences against it. Starting a new sequence is
/// [`DecodeState::reset`].
#[derive(Debug, Clone)]
pub struct DecodeState {
    caches: Vec<KVCache>,
}

impl DecodeState {
    /// Allocate caches for every layer of `config`
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `config` has a zero layer count or
    /// cache dimension
    pub fn new(config: &Config) -> Result<Self> {
        if config.n_layers == 0 {
            return Err(InferError::InvalidShape {
                reason: "n_layers must be > 0".to_string(),
            });
        }
        let caches = (0..config.n_layers)
            .map(|_| KVCache::from_config(config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { caches })
    }

    /// Number of positions decoded so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.first().map_or(0, KVCache::len)
    }

    /// True if nothing has been decoded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget the current sequence
    pub fn reset(&mut self) {
        for cache in &mut self.caches {
            cache.reset();
        }
    }

    /// Cache of layer `layer`
    #[must_use]
    pub fn cache(&self, layer: usize) -> Option<&KVCache> {
        self.caches.get(layer)
    }

    pub(crate) fn cache_mut(&mut self, layer: usize) -> Option<&mut KVCache> {
        self.caches.get_mut(layer)
    }
}

/// LLaMA2-style decoder: embedding, layer stack, final norm, classifier
///
/// All weights borrow the buffer they were built from (usually a
/// [`Checkpoint`]), so the model cannot outlive it.
#[derive(Debug)]
pub struct Model<'a> {
    config: Config,
    /// Token embedding table `[vocab_size, dim]`
    embedding: Tensor<'a>,
    layers: Vec<AttentionLayer<'a>>,
    /// Final RMS norm gain `[1, dim]`
    rms_final_weight: Tensor<'a>,
    /// Output projection `[vocab_size, dim]`, possibly aliasing `embedding`
    classifier: Tensor<'a>,
}

impl<'a> Model<'a> {
    /// Assemble a model from its parts
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for an invalid `config`, and
    /// `InvalidShape` if the layer count or any weight shape disagrees with
    /// it.
    pub fn new(
        config: Config,
        embedding: Tensor<'a>,
        layers: Vec<AttentionLayer<'a>>,
        rms_final_weight: Tensor<'a>,
        classifier: Tensor<'a>,
    ) -> Result<Self> {
        config.validate()?;

        if layers.len() != config.n_layers {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "Got {} layers, config has n_layers = {}",
                    layers.len(),
                    config.n_layers
                ),
            });
        }

        let expected = [
            ("embedding", &embedding, (config.vocab_size, config.dim)),
            ("rms_final_weight", &rms_final_weight, (1, config.dim)),
            ("classifier", &classifier, (config.vocab_size, config.dim)),
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

        Ok(Self {
            config,
            embedding,
            layers,
            rms_final_weight,
            classifier,
        })
    }

    /// Build a model whose weights are views into `checkpoint`
    ///
    /// Walks the fixed checkpoint layout: embedding table, then each
    /// per-layer group for all layers, the final norm, two legacy rotary
    /// tables (skipped), and the classifier unless it is shared with the
    /// embedding table.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the weight buffer is shorter than the
    /// layout requires.
    pub fn from_checkpoint(checkpoint: &'a Checkpoint) -> Result<Self> {
        let config = *checkpoint.config();
        let n = config.n_layers;
        let dim = config.dim;
        let q_dim = config.n_heads * config.head_size();
        let kv_dim = config.kv_dim();
        let hidden = config.hidden_dim;

        let shared = checkpoint.shared_weights();
        let mut cursor = checkpoint.cursor();
        let embedding_data = cursor.take(WeightGroup::Embedding.float_count(&config, shared)?)?;

        let mut rms_att = cursor.take_layers(n, 1, dim)?.into_iter();
        let mut query = cursor.take_layers(n, q_dim, dim)?.into_iter();
        let mut key = cursor.take_layers(n, kv_dim, dim)?.into_iter();
        let mut value = cursor.take_layers(n, kv_dim, dim)?.into_iter();
        let mut weight_o = cursor.take_layers(n, dim, q_dim)?.into_iter();
        let mut rms_ffn = cursor.take_layers(n, 1, dim)?.into_iter();
        let mut weight1 = cursor.take_layers(n, hidden, dim)?.into_iter();
        let mut weight2 = cursor.take_layers(n, dim, hidden)?.into_iter();
        let mut weight3 = cursor.take_layers(n, hidden, dim)?.into_iter();
        let rms_final_weight = cursor.take_tensor(1, dim)?;

        // freq_cis_real and freq_cis_imag from the legacy format
        for group in [WeightGroup::FreqCisReal, WeightGroup::FreqCisImag] {
            cursor.skip(group.float_count(&config, shared)?)?;
        }

        let classifier_data = if shared {
            embedding_data
        } else {
            cursor.take(WeightGroup::Classifier.float_count(&config, false)?)?
        };
        debug!(
            consumed = cursor.offset(),
            available = checkpoint.weights().len(),
            shared,
            "Mapped checkpoint weights"
        );

        let mut layers = Vec::with_capacity(n);
        for _ in 0..n {
            let weights = LayerWeights {
                rms_att_weight: next_layer(&mut rms_att)?,
                query: next_layer(&mut query)?,
                key: next_layer(&mut key)?,
                value: next_layer(&mut value)?,
                weight_o: next_layer(&mut weight_o)?,
                rms_ffn_weight: next_layer(&mut rms_ffn)?,
                weight1: next_layer(&mut weight1)?,
                weight2: next_layer(&mut weight2)?,
                weight3: next_layer(&mut weight3)?,
            };
            layers.push(AttentionLayer::new(&config, weights)?);
        }

        Self::new(
            config,
            Tensor::view(embedding_data, config.vocab_size, dim)?,
            layers,
            rms_final_weight,
            Tensor::view(classifier_data, config.vocab_size, dim)?,
        )
    }

    /// Model hyperparameters
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Decoder layers in execution order
    #[must_use]
    pub fn layers(&self) -> &[AttentionLayer<'a>] {
        &self.layers
    }

    /// Token embedding table
    #[must_use]
    pub fn embedding(&self) -> &Tensor<'a> {
        &self.embedding
    }

    /// Output projection
    #[must_use]
    pub fn classifier(&self) -> &Tensor<'a> {
        &self.classifier
    }

    /// True if the classifier aliases the embedding table
    #[must_use]
    pub fn shares_classifier(&self) -> bool {
        std::ptr::eq(self.embedding.data(), self.classifier.data())
    }

    /// Fresh decode state sized for this model
    ///
    /// # Errors
    ///
    /// Never fails for a model built through [`Model::new`]; the `Result`
    /// mirrors [`DecodeState::new`].
    pub fn new_state(&self) -> Result<DecodeState> {
        DecodeState::new(&self.config)
    }

    /// Compute next-token logits for `token` at position `pos`
    ///
    /// Returns a `(1, vocab_size)` tensor. The caller supplies positions in
    /// order starting at 0; `pos` may also rewind to any already decoded
    /// position.
    ///
    /// # Errors
    ///
    /// - `TokenOutOfRange` if `token >= vocab_size`
    /// - `ContextLimitExceeded` if `pos >= seq_len`
    /// - `NonContiguousPosition` if `pos` is past the decoded length
    /// - `InvalidShape` if `state` was sized for a different model
    ///
    /// All checks run before any cache is written, so a failed call leaves
    /// `state` unchanged.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let mut state = model.new_state()?;
    /// let mut token = 1; // BOS
    /// for pos in 0..8 {
    ///     let logits = model.forward(&mut state, token, pos)?;
    ///     token = sampler.sample(logits.data())?;
    /// }
    /// ```
    pub fn forward(&self, state: &mut DecodeState, token: usize, pos: usize) -> Result<Tensor<'static>> {
        if token >= self.config.vocab_size {
            return Err(InferError::TokenOutOfRange {
                token,
                vocab_size: self.config.vocab_size,
            });
        }
        self.check_state(state, pos)?;

        let mut x = self.embedding.row(token)?.copy();
        for (layer, cache) in self.layers.iter().zip(state.caches.iter_mut()) {
            x = layer.forward(&x, cache, pos)?;
        }

        let x = rms_norm(&x, &self.rms_final_weight)?;
        x.matmul(&self.classifier)
    }

    fn check_state(&self, state: &DecodeState, pos: usize) -> Result<()> {
        if state.caches.len() != self.layers.len() {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "Decode state has {} caches, model has {} layers",
                    state.caches.len(),
                    self.layers.len()
                ),
            });
        }
        for cache in &state.caches {
            if cache.capacity() != self.config.seq_len || cache.kv_dim() != self.config.kv_dim() {
                return Err(InferError::InvalidShape {
                    reason: format!(
                        "KV cache is {}x{}, model needs {}x{}",
                        cache.capacity(),
                        cache.kv_dim(),
                        self.config.seq_len,
                        self.config.kv_dim()
                    ),
                });
            }
            cache.check_position(pos)?;
        }
        Ok(())
    }
}

fn next_layer<'a>(group: &mut impl Iterator<Item = Tensor<'a>>) -> Result<Tensor<'a>> {
    group.next().ok_or_else(|| InferError::FormatError {
        reason: "Checkpoint has fewer layer tensors than n_layers".to_string(),
    })
}
