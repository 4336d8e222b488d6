//! Configuration types for slot-engine.
//!
//! Every knob in [`EngineConfig`] fixes a dimension of the decode state;
//! changing one means creating a new state with `init_decode_state`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of slots decoded together in one batch step.
    pub max_batch_size: usize,
    /// Cache capacity per slot; also the longest accepted prompt.
    pub max_seq_len: usize,
    /// Capacity of each slot's result buffer.
    pub max_decode_length: usize,
    /// Samples produced per slot per step.
    pub samples_per_slot: usize,
    /// Number of devices the partitioned axes are split across.
    pub num_partitions: usize,
    /// Tokenizer location, handed through to the tokenization collaborator.
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_seq_len: 1024,
            max_decode_length: 4096,
            samples_per_slot: 1,
            num_partitions: 1,
            tokenizer_path: None,
        }
    }
}

impl EngineConfig {
    /// Reads an engine configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every capacity is usable.
    pub fn validate(&self) -> Result<()> {
        let knobs = [
            ("max_batch_size", self.max_batch_size),
            ("max_seq_len", self.max_seq_len),
            ("max_decode_length", self.max_decode_length),
            ("samples_per_slot", self.samples_per_slot),
            ("num_partitions", self.num_partitions),
        ];
        if let Some((name, _)) = knobs.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if self.samples_per_slot != 1 {
            return Err(Error::Config(format!(
                "samples_per_slot = {} is not supported, each step yields one token per slot",
                self.samples_per_slot
            )));
        }
        if self.max_seq_len % self.num_partitions != 0 {
            return Err(Error::Config(format!(
                "max_seq_len {} is not divisible by num_partitions {}",
                self.max_seq_len, self.num_partitions
            )));
        }
        Ok(())
    }
}

/// Configuration of the reference scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Number of layers, one cache entry each.
    pub num_layers: usize,
    /// Number of key-value heads.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Seed for generated weights.
    pub seed: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            hidden_size: 64,
            num_layers: 2,
            num_kv_heads: 4,
            head_dim: 16,
            seed: 0,
        }
    }
}

impl ScorerConfig {
    /// Width of the projected attention space (heads x head_dim).
    pub fn attn_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

/// Per-request sampling hyperparameters.
///
/// Only `prefill` reads them; `insert` passes them through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// RNG seed, so a request samples identically on every pool.
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            seed: 0,
        }
    }
}

/// Hyperparameters handed to `prefill` and `insert` with each request.
pub type PerRequestHyperparams = SamplingConfig;
