//! Token sampling and the autoregressive generation loop
//!
//! Supports:
//! - Greedy decoding (argmax, `temperature == 0`)
//! - Multinomial sampling from the temperature-scaled softmax
//! - Top-p (nucleus) sampling
//!
//! Sampling is driven by a seeded xorshift* generator, so a given seed,
//! model and prompt always produce the same text.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tinyinfer::generate::{generate, GenerationConfig, Sampler};
//!
//! let config = GenerationConfig::default().with_seed(42);
//! let mut sampler = Sampler::from_config(model.config().vocab_size, &config)?;
//! let stats = generate(&model, &tokenizer, &mut sampler, "Once upon a time",
//!                      config.steps, &mut std::io::stdout())?;
//! ```

use std::{
    io::Write,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{InferError, Result},
    layers::{softmax_in_place, Model},
    tokenizer::{safe_piece, Tokenizer, BOS},
};

/// xorshift* pseudo-random generator
///
/// A zero state stays zero forever, so seeds should be non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rng {
    state: u64,
}

impl Rng {
    /// Create a generator from `seed`
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next 32 random bits
    #[allow(clippy::cast_possible_truncation)]
    pub fn random_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }

    /// Uniform float in `[0, 1)` with 24 bits of precision
    #[allow(clippy::cast_precision_loss)]
    pub fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16_777_216.0
    }
}

fn check_non_empty(probs: &[f32]) -> Result<()> {
    if probs.is_empty() {
        return Err(InferError::InvalidShape {
            reason: "Cannot sample from an empty distribution".to_string(),
        });
    }
    Ok(())
}

/// Index of the largest value (first one on ties)
///
/// # Errors
///
/// Returns `InvalidShape` if `probs` is empty
pub fn sample_argmax(probs: &[f32]) -> Result<usize> {
    check_non_empty(probs)?;
    let mut best = 0;
    for (i, &p) in probs.iter().enumerate().skip(1) {
        if p > probs[best] {
            best = i;
        }
    }
    Ok(best)
}

/// Sample an index from `probs` (summing to 1) with `coin` in `[0, 1)`
///
/// Rounding that leaves the total below `coin` selects the last index.
///
/// # Errors
///
/// Returns `InvalidShape` if `probs` is empty
pub fn sample_mult(probs: &[f32], coin: f32) -> Result<usize> {
    check_non_empty(probs)?;
    let mut cdf = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return Ok(i);
        }
    }
    Ok(probs.len() - 1)
}

/// Top-p (nucleus) sampling
///
/// Samples from the smallest set of most-likely tokens whose cumulative
/// probability exceeds `topp`. Tokens below `(1 - topp) / (n - 1)` cannot
/// be in that set and are dropped before sorting.
///
/// # Errors
///
/// Returns `InvalidShape` if `probs` is empty
pub fn sample_topp(probs: &[f32], topp: f32, coin: f32) -> Result<usize> {
    check_non_empty(probs)?;
    if probs.len() == 1 {
        return Ok(0);
    }

    #[allow(clippy::cast_precision_loss)]
    let cutoff = (1.0 - topp) / (probs.len() - 1) as f32;
    let mut candidates: Vec<(usize, f32)> = probs
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, p)| p >= cutoff)
        .collect();
    if candidates.is_empty() {
        return sample_argmax(probs);
    }
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    // Truncate where the cumulative probability exceeds topp
    let mut cumulative = 0.0;
    let mut last = candidates.len() - 1;
    for (i, &(_, p)) in candidates.iter().enumerate() {
        cumulative += p;
        if cumulative > topp {
            last = i;
            break;
        }
    }

    let r = coin * cumulative;
    let mut cdf = 0.0;
    for &(index, p) in &candidates[..=last] {
        cdf += p;
        if r < cdf {
            return Ok(index);
        }
    }
    Ok(candidates[last].0)
}

/// Generation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Softmax temperature; 0 selects greedy decoding
    pub temperature: f32,
    /// Nucleus mass; values outside `(0, 1)` disable top-p
    pub topp: f32,
    /// Positions to run, prompt included; 0 means the model's `seq_len`
    pub steps: usize,
    /// RNG seed; 0 lets the caller pick one
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            topp: 0.9,
            steps: 256,
            seed: 0,
        }
    }
}

impl GenerationConfig {
    /// Deterministic argmax decoding
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-p mass
    #[must_use]
    pub fn with_topp(mut self, topp: f32) -> Self {
        self.topp = topp;
        self
    }

    /// Set step budget
    #[must_use]
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Set RNG seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check parameter ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for a negative or non-finite
    /// temperature and a non-finite `topp`.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(InferError::InvalidConfiguration(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if !self.topp.is_finite() {
            return Err(InferError::InvalidConfiguration(format!(
                "topp must be finite, got {}",
                self.topp
            )));
        }
        Ok(())
    }
}

/// Turns logits into the next token
#[derive(Debug, Clone)]
pub struct Sampler {
    vocab_size: usize,
    temperature: f32,
    topp: f32,
    rng: Rng,
}

impl Sampler {
    /// Create a sampler
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for an empty vocabulary or invalid
    /// temperature / top-p values
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, seed: u64) -> Result<Self> {
        GenerationConfig {
            temperature,
            topp,
            steps: 0,
            seed,
        }
        .validate()?;
        if vocab_size == 0 {
            return Err(InferError::InvalidConfiguration(
                "vocab_size must be > 0".to_string(),
            ));
        }

        Ok(Self {
            vocab_size,
            temperature,
            topp,
            rng: Rng::new(seed),
        })
    }

    /// Create a sampler from generation parameters
    ///
    /// # Errors
    ///
    /// Same as [`Sampler::new`]
    pub fn from_config(vocab_size: usize, config: &GenerationConfig) -> Result<Self> {
        Self::new(vocab_size, config.temperature, config.topp, config.seed)
    }

    /// Pick the next token from `logits`
    ///
    /// Greedy at temperature 0. Otherwise the logits are divided by the
    /// temperature, softmaxed, and sampled with one coin flip, using top-p
    /// when `topp` is in `(0, 1)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `logits.len() != vocab_size`
    pub fn sample(&mut self, logits: &[f32]) -> Result<usize> {
        if logits.len() != self.vocab_size {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "Got {} logits for a vocabulary of {}",
                    logits.len(),
                    self.vocab_size
                ),
            });
        }

        if self.temperature == 0.0 {
            return sample_argmax(logits);
        }

        let inv_temperature = 1.0 / self.temperature;
        let mut probs: Vec<f32> = logits.iter().map(|l| l * inv_temperature).collect();
        softmax_in_place(&mut probs)?;

        let coin = self.rng.random_f32();
        if self.topp <= 0.0 || self.topp >= 1.0 {
            sample_mult(&probs, coin)
        } else {
            sample_topp(&probs, self.topp, coin)
        }
    }
}

/// Outcome of a [`generate`] run
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStats {
    /// Positions processed
    pub positions: usize,
    /// Tokens emitted after the first, forced or sampled
    pub tokens: Vec<usize>,
    /// Time since the end of the first step
    pub elapsed: Duration,
}

impl GenerationStats {
    /// Throughput excluding the first (warm-up) step
    #[must_use]
    pub fn tokens_per_second(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if self.positions <= 1 || secs <= 0.0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some((self.positions - 1) as f64 / secs)
    }
}

/// Run the model on `prompt` and stream the continuation to `out`
///
/// The prompt is encoded with a leading BOS. While prompt tokens remain the
/// next token is forced; afterwards it is sampled. Generation stops after
/// `steps` positions (capped at `seq_len`; 0 means `seq_len`) or when the
/// model produces BOS. Unprintable single-byte pieces are not written.
///
/// # Errors
///
/// Propagates model, tokenizer and sampler errors, and `IoError` from
/// `out`.
pub fn generate<W: Write>(
    model: &Model<'_>,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: &str,
    steps: usize,
    out: &mut W,
) -> Result<GenerationStats> {
    let seq_len = model.config().seq_len;
    let steps = if steps == 0 {
        seq_len
    } else if steps > seq_len {
        warn!(steps, seq_len, "Step budget exceeds context length, clamping");
        seq_len
    } else {
        steps
    };

    let prompt_tokens = tokenizer.encode(prompt, true, false)?;
    if prompt_tokens.len() > steps {
        warn!(
            prompt_tokens = prompt_tokens.len(),
            steps, "Prompt is longer than the step budget"
        );
    }
    debug!(prompt_tokens = prompt_tokens.len(), steps, "Starting generation");

    let mut state = model.new_state()?;
    let mut token = prompt_tokens.first().copied().unwrap_or(BOS);
    let mut tokens = Vec::new();
    let mut start: Option<Instant> = None;
    let mut pos = 0;

    while pos < steps {
        let logits = model.forward(&mut state, token, pos)?;
        let next = match prompt_tokens.get(pos + 1) {
            Some(&forced) => forced,
            None => sampler.sample(logits.data())?,
        };
        pos += 1;

        if next == BOS {
            break;
        }
        let piece = tokenizer.decode(token, next)?;
        if let Some(bytes) = safe_piece(&piece) {
            out.write_all(bytes)?;
            out.flush()?;
        }
        tokens.push(next);
        token = next;

        // The first step is slower; time from the end of it
        if start.is_none() {
            start = Some(Instant::now());
        }
    }

    Ok(GenerationStats {
        positions: pos,
        tokens,
        elapsed: start.map_or(Duration::ZERO, |s| s.elapsed()),
    })
}

#[cfg(test)]
mod tests;
