//! Continuous-batching engine.
//!
//! The engine owns no mutable state. Every mutating call returns a new decode
//! state; `generate` takes it by value, `insert` borrows it so a rejected
//! insert leaves the caller's state intact:
//!
//! ```text
//!   init_decode_state ──► state
//!                           │
//!   prefill(prompt) ──► prefix ──► insert(prefix, &state, slot) ──► state
//!                                                                     │
//!                             ┌───────────────────────────────────────┘
//!                             ▼
//!                  generate(state) ──► (state, ResultTokens)   (repeat)
//! ```
//!
//! Every slot advances on every `generate`, live or not. The orchestrator
//! decides which slots' results it reads and when to overwrite a slot with
//! a new `insert`.

use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use tracing::{debug, info, trace};

use super::result::{PrefillResult, ResultTokens};
use super::sampler::Sampler;
use crate::config::{EngineConfig, PerRequestHyperparams};
use crate::core::{DecodeState, PrefillInputs, Prefix};
use crate::error::{Error, Result};
use crate::model::{Scorer, StepInput};
use crate::placement::{PlacementContract, PrefixShards};

/// Prefill / insert / generate over a fixed batch of slots.
#[derive(Debug, Clone)]
pub struct BatchEngine<S: Scorer> {
    config: EngineConfig,
    scorer: S,
    device: Device,
}

impl<S: Scorer> BatchEngine<S> {
    /// Create an engine around `scorer`.
    ///
    /// # Arguments
    ///
    /// * `config` - Batch and cache capacities
    /// * `scorer` - The model; its cache spec fixes the cache layout
    /// * `device` - Device holding every tensor
    pub fn new(config: EngineConfig, scorer: S, device: Device) -> Result<Self> {
        config.validate()?;
        let spec = scorer.cache_spec();
        if spec.num_layers == 0 || spec.num_kv_heads == 0 || spec.head_dim == 0 {
            return Err(Error::Config(format!(
                "scorer cache spec has an empty dimension: {spec:?}"
            )));
        }
        if spec.num_kv_heads % config.num_partitions != 0 {
            return Err(Error::Config(format!(
                "num_kv_heads {} is not divisible by num_partitions {}",
                spec.num_kv_heads, config.num_partitions
            )));
        }
        info!(
            max_batch_size = config.max_batch_size,
            max_seq_len = config.max_seq_len,
            max_decode_length = config.max_decode_length,
            num_partitions = config.num_partitions,
            num_layers = spec.num_layers,
            cache_bytes = spec.total_size_bytes(config.max_batch_size, config.max_seq_len),
            "Batch engine created"
        );

        Ok(Self {
            config,
            scorer,
            device,
        })
    }

    // ========== Accessors ==========

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The wrapped scorer.
    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    /// Device holding every tensor.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of slots decoded together.
    pub fn max_concurrent_decodes(&self) -> usize {
        self.config.max_batch_size
    }

    /// Samples produced per slot per step.
    pub fn samples_per_slot(&self) -> usize {
        self.config.samples_per_slot
    }

    /// Longest prompt (including an extended prefix) `prefill` accepts.
    pub fn max_prefill_length(&self) -> usize {
        self.config.max_seq_len
    }

    /// Capacity of each slot's result buffer.
    pub fn max_decode_length(&self) -> usize {
        self.config.max_decode_length
    }

    /// Tokenizer location, for the tokenization collaborator.
    pub fn tokenizer_parameters(&self) -> Option<&Path> {
        self.config.tokenizer_path.as_deref()
    }

    /// Placement of every entity this engine produces.
    pub fn placement(&self) -> PlacementContract {
        PlacementContract::new(self.config.num_partitions)
    }

    /// Load the scorer's weights on the engine device.
    pub fn load_params(&self) -> Result<S::Params> {
        self.scorer.load_params(&self.device)
    }

    // ========== Slot lifecycle ==========

    /// Create a zeroed decode state sized by the configuration.
    pub fn init_decode_state(&self) -> Result<DecodeState> {
        DecodeState::new(
            self.scorer.cache_spec(),
            self.config.max_batch_size,
            self.config.max_seq_len,
            self.config.max_decode_length,
            &self.device,
        )
    }

    /// Run one request through the scorer at batch size one.
    ///
    /// With `existing_prefix`, the new tokens continue that prefix: its cache
    /// is kept at the front and the returned prefix covers both.
    ///
    /// The input is validated before any compute. The result depends only on
    /// `params`, the inputs and `hyperparams`.
    pub fn prefill(
        &self,
        params: &S::Params,
        inputs: &PrefillInputs,
        existing_prefix: Option<&Prefix>,
        hyperparams: &PerRequestHyperparams,
    ) -> Result<(Prefix, PrefillResult)> {
        let tokens = inputs.to_batch()?.to_device(&self.device)?;
        let steps = tokens.dim(1)?;
        let vocab_size = self.scorer.vocab_size();
        let max_id = tokens.flatten_all()?.to_vec1::<u32>()?.into_iter().max().unwrap_or(0);
        if max_id as usize >= vocab_size {
            return Err(Error::InvalidInput(format!(
                "token id {max_id} outside vocabulary of {vocab_size}"
            )));
        }

        let spec = self.scorer.cache_spec();
        let base = match existing_prefix {
            Some(prefix) => {
                prefix.check(&spec)?;
                prefix.prompt_length
            }
            None => 0,
        };
        let total = base + steps;
        if total > self.max_prefill_length() {
            return Err(Error::InvalidInput(format!(
                "prompt of {total} tokens exceeds max prefill length {}",
                self.max_prefill_length()
            )));
        }
        let mut sampler = Sampler::new(hyperparams)?;

        let mut caches = spec.zeros(1, total, &self.device)?;
        if let Some(prefix) = existing_prefix {
            caches = caches
                .iter()
                .zip(&prefix.caches)
                .map(|(layer, src)| layer.assign_slot(0, 0, src))
                .collect::<Result<Vec<_>>>()?;
        }

        let window_start = Tensor::new(&[0i64], &self.device)?;
        let write_start = Tensor::new(&[base as i64], &self.device)?;
        let input = StepInput {
            tokens: &tokens,
            window_start: &window_start,
            write_start: &write_start,
        };
        let out = self.scorer.forward(params, input, caches)?;

        let logits = out.logits.squeeze(0)?.to_dtype(DType::F32)?;
        let token = sampler.sample(&logits)?[0];
        let score = candle_nn::ops::log_softmax(&logits, D::Minus1)?
            .get(token as usize)?
            .to_scalar::<f32>()?;

        debug!(
            prompt_length = total,
            extended_from = base,
            first_token = token,
            "Prefill complete"
        );

        let token = Tensor::new(&[[token]], &self.device)?;
        let prefix = Prefix {
            token: token.clone(),
            caches: out.caches,
            prompt_length: total,
        };
        let result = PrefillResult {
            data: token,
            scores: Tensor::new(&[[score]], &self.device)?,
            token_score_index: (0, 1),
        };
        Ok((prefix, result))
    }

    /// Merge `prefix` into `slot`, returning the updated state.
    ///
    /// The slot is overwritten whatever it held; the orchestrator owns slot
    /// allocation. `hyperparams` are not interpreted here. `state` is only
    /// borrowed, so after an error every in-flight slot is still there.
    pub fn insert(
        &self,
        prefix: Prefix,
        state: &DecodeState,
        slot: usize,
        hyperparams: &PerRequestHyperparams,
    ) -> Result<DecodeState> {
        trace!(slot, ?hyperparams, "Insert hyperparameters passed through");
        let prompt_length = prefix.prompt_length;
        let state = state.insert_prefix(&prefix, slot)?;
        debug!(slot, prompt_length, pos = state.pos(), "Prefix inserted");
        Ok(state)
    }

    /// Advance every slot by one decode step.
    ///
    /// Each slot's next token is the most likely one under the scorer;
    /// `float_data` carries its log-probability. A token is flagged invalid
    /// when its slot's cache is full, so the orchestrator can retire it.
    /// Not idempotent.
    pub fn generate(
        &self,
        params: &S::Params,
        state: DecodeState,
    ) -> Result<(DecodeState, ResultTokens)> {
        let (window_start, write_start) = state.step_columns()?;
        let valid = state.write_in_bounds(&write_start)?;
        let input = StepInput {
            tokens: state.tokens(),
            window_start: &window_start,
            write_start: &write_start,
        };
        let out = self.scorer.forward(params, input, state.caches().to_vec())?;

        let logits = out.logits.to_dtype(DType::F32)?;
        let next = logits.argmax_keepdim(D::Minus1)?;
        let scores = candle_nn::ops::log_softmax(&logits, D::Minus1)?.gather(&next, D::Minus1)?;

        let result = ResultTokens::pack(&next, &valid, &scores, state.gen_len())?;
        let state = state.advance(&next, out.caches)?;
        debug!(pos = state.pos(), "Generate step complete");
        Ok((state, result))
    }

    // ========== Prefix operations ==========

    /// Trim `prefix` to its first `new_length` positions.
    pub fn shrink_prefix(&self, prefix: Prefix, new_length: usize) -> Result<Prefix> {
        prefix.shrink(new_length)
    }

    /// Joining prefixes is not supported; always fails.
    pub fn join_prefixes(&self, _first: &Prefix, _second: &Prefix) -> Result<Prefix> {
        Err(Error::UnsupportedOperation("join_prefixes"))
    }

    /// Shard `prefix` for transfer to another engine.
    pub fn export_prefix(&self, prefix: &Prefix) -> Result<PrefixShards> {
        self.placement().export_prefix(prefix)
    }

    /// Reassemble a transferred prefix and check it fits this engine's cache.
    pub fn import_prefix(&self, shards: PrefixShards) -> Result<Prefix> {
        let prefix = shards.gather()?.to_device(&self.device)?;
        prefix.check(&self.scorer.cache_spec())?;
        Ok(prefix)
    }
}
