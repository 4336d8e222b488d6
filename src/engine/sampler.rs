//! First-token sampling for `prefill`.
//!
//! Decode steps are greedy; only the token that seeds a slot goes through the
//! request's sampling hyperparameters:
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ temperature == 0 ──► argmax
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//!     ▼ Softmax
//!     ▼ Top-p filtering (optional)
//!     ▼ Renormalize + draw from the seeded RNG
//! Selected token
//! ```
//!
//! The RNG is seeded from the request, so the same request prefilled twice
//! (or on two different pools) gets the same first token.

use candle_core::{IndexOp, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler seeded from `config.seed`.
    pub fn new(config: &SamplingConfig) -> Result<Self> {
        Self::with_seed(config, config.seed)
    }

    /// Creates a sampler with an explicit seed.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Result<Self> {
        if config.temperature.is_nan() || config.temperature < 0.0 {
            return Err(Error::InvalidInput(format!(
                "temperature must be non-negative, got {}",
                config.temperature
            )));
        }
        if config.top_p.is_nan() || config.top_p <= 0.0 || config.top_p > 1.0 {
            return Err(Error::InvalidInput(format!(
                "top_p must be in (0, 1], got {}",
                config.top_p
            )));
        }
        Ok(Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Whether this sampler always picks the most likely token.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Sample one token per row of `logits` (`[vocab]` or `[batch, vocab]`).
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        match logits.rank() {
            1 => Ok(vec![self.sample_single(logits)?]),
            2 => (0..logits.dim(0)?)
                .map(|i| self.sample_single(&logits.i(i)?))
                .collect(),
            rank => Err(Error::InvalidInput(format!(
                "expected 1D or 2D logits, got {rank}D"
            ))),
        }
    }

    fn sample_single(&mut self, logits: &Tensor) -> Result<u32> {
        if self.is_greedy() {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }

        let scaled: Vec<f32> = (logits / self.temperature as f64)?.to_vec1()?;
        let mut candidates: Vec<(u32, f32)> = scaled
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }

        // Softmax over the survivors; the first entry is the maximum.
        let max = candidates.first().map_or(0.0, |c| c.1);
        let mut probs: Vec<f32> = candidates.iter().map(|c| (c.1 - max).exp()).collect();
        let sum: f32 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= sum);

        if self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let cutoff = probs
                .iter()
                .position(|&p| {
                    cumulative += p;
                    cumulative > self.top_p
                })
                .map_or(probs.len(), |i| i + 1);
            probs.truncate(cutoff);
            candidates.truncate(cutoff);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| Error::InvalidInput(format!("cannot sample from logits: {e}")))?;
        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}
