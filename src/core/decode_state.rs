//! Shared batch decode state.
//!
//! The decode state holds every slot's latest token, result buffer, KV cache
//! and counters. Every transition returns a new state and leaves its input
//! untouched; `advance` consumes the old one, `insert_prefix` only borrows it.
//!
//! ## Layout
//!
//! | field         | shape                                   | dtype |
//! |---------------|-----------------------------------------|-------|
//! | `tokens`      | `[batch, 1]`                            | u32   |
//! | `results`     | `[batch, max_decode_length]`            | u32   |
//! | `caches[l]`   | `[batch, max_seq_len, kv_heads, head]`  | f32   |
//! | `context_pos` | `[batch, 1]`                            | u32   |
//! | `gen_len`     | `[batch, 1]`                            | u32   |
//! | `pos`         | scalar                                  | usize |
//!
//! A slot that was never inserted into reads as zeros everywhere.

use candle_core::{DType, Device, Tensor};

use super::kv_cache::{one_hot_columns, CacheSpec, LayerCache};
use super::prefix::Prefix;
use crate::error::{Error, Result};

/// Batch-shaped decode state advanced by every `generate` call.
#[derive(Debug, Clone)]
pub struct DecodeState {
    tokens: Tensor,
    results: Tensor,
    caches: Vec<LayerCache>,
    pos: usize,
    context_pos: Tensor,
    gen_len: Tensor,
    spec: CacheSpec,
}

impl DecodeState {
    /// Create a zeroed decode state.
    pub fn new(
        spec: CacheSpec,
        max_batch_size: usize,
        max_seq_len: usize,
        max_decode_length: usize,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            tokens: Tensor::zeros((max_batch_size, 1), DType::U32, device)?,
            results: Tensor::zeros((max_batch_size, max_decode_length), DType::U32, device)?,
            caches: spec.zeros(max_batch_size, max_seq_len, device)?,
            pos: 0,
            context_pos: Tensor::zeros((max_batch_size, 1), DType::U32, device)?,
            gen_len: Tensor::zeros((max_batch_size, 1), DType::U32, device)?,
            spec,
        })
    }

    // ========== Getters ==========

    /// Latest token per slot, `[batch, 1]`.
    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    /// Result buffer, `[batch, max_decode_length]`.
    pub fn results(&self) -> &Tensor {
        &self.results
    }

    /// Per-layer caches.
    pub fn caches(&self) -> &[LayerCache] {
        &self.caches
    }

    /// Absolute batch step counter shared by every slot.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Context tokens consumed per slot, `[batch, 1]`.
    pub fn context_pos(&self) -> &Tensor {
        &self.context_pos
    }

    /// Tokens generated per slot since its last insertion, `[batch, 1]`.
    pub fn gen_len(&self) -> &Tensor {
        &self.gen_len
    }

    /// Cache layout of this state.
    pub fn spec(&self) -> &CacheSpec {
        &self.spec
    }

    /// Number of slots.
    pub fn max_batch_size(&self) -> usize {
        self.tokens.dims()[0]
    }

    /// Cache capacity per slot.
    pub fn max_seq_len(&self) -> usize {
        self.caches.first().map_or(0, LayerCache::seq_len)
    }

    /// Result buffer capacity per slot.
    pub fn max_decode_length(&self) -> usize {
        self.results.dims()[1]
    }

    /// Device holding the state.
    pub fn device(&self) -> &Device {
        self.tokens.device()
    }

    // ========== Host views ==========

    /// Latest token of `slot`.
    pub fn token_at(&self, slot: usize) -> Result<u32> {
        self.check_slot(slot)?;
        Ok(self.tokens.flatten_all()?.to_vec1::<u32>()?[slot])
    }

    /// Result buffer row of `slot`.
    pub fn results_row(&self, slot: usize) -> Result<Vec<u32>> {
        self.check_slot(slot)?;
        Ok(self.results.get(slot)?.to_vec1::<u32>()?)
    }

    /// Generation length of every slot.
    pub fn gen_lens(&self) -> Result<Vec<u32>> {
        Ok(self.gen_len.flatten_all()?.to_vec1::<u32>()?)
    }

    /// Context length of every slot.
    pub fn context_lens(&self) -> Result<Vec<u32>> {
        Ok(self.context_pos.flatten_all()?.to_vec1::<u32>()?)
    }

    /// Caches of `slot`, each `[1, max_seq_len, kv_heads, head_dim]`.
    pub fn slot_caches(&self, slot: usize) -> Result<Vec<LayerCache>> {
        self.check_slot(slot)?;
        self.caches.iter().map(|layer| layer.slot(slot)).collect()
    }

    // ========== Transitions ==========

    /// Per-slot cache columns for the next step, both `[batch]` (i64).
    ///
    /// `window_start` is the column the slot was inserted at and
    /// `write_start` is where the step's key/value go:
    ///
    /// ```text
    /// window_start = pos - (gen_len - 1)
    /// write_start  = window_start + context_pos
    /// ```
    pub fn step_columns(&self) -> Result<(Tensor, Tensor)> {
        let device = self.device();
        let gen_len = self.gen_len.to_dtype(DType::I64)?.squeeze(1)?;
        let context = self.context_pos.to_dtype(DType::I64)?.squeeze(1)?;

        let one = Tensor::new(1i64, device)?;
        let pos = Tensor::new(self.pos as i64, device)?;

        let elapsed = gen_len.broadcast_sub(&one)?;
        let window_start = pos.broadcast_sub(&elapsed)?;
        let write_start = (&window_start + &context)?;
        Ok((window_start, write_start))
    }

    /// Whether each slot's next write column still fits the cache, `[batch, 1]` (u32).
    ///
    /// A slot whose write column has reached `max_seq_len` loses the step's
    /// key/value, so its token no longer reflects its full context.
    pub fn write_in_bounds(&self, write_start: &Tensor) -> Result<Tensor> {
        let capacity = Tensor::new(self.max_seq_len() as i64, self.device())?;
        Ok(write_start
            .broadcast_lt(&capacity)?
            .to_dtype(DType::U32)?
            .unsqueeze(1)?)
    }

    /// Merge `prefix` into `slot`, overwriting whatever the slot held.
    ///
    /// The prefix cache lands at column `pos` so it lines up with slots that
    /// are already decoding; the rest of the slot's cache row is zeroed.
    /// Other slots are untouched. Every check runs before any write, and
    /// `self` is left as it was whether or not the insert succeeds.
    pub fn insert_prefix(&self, prefix: &Prefix, slot: usize) -> Result<Self> {
        self.check_slot(slot)?;
        prefix.check(&self.spec)?;
        let needed = self.pos + prefix.prompt_length;
        if needed > self.max_seq_len() {
            return Err(Error::CacheExhausted {
                needed,
                capacity: self.max_seq_len(),
            });
        }

        let device = self.device().clone();
        let token = prefix.token.to_dtype(DType::U32)?.reshape((1, 1))?;
        let max_decode = self.max_decode_length();
        let row = slot..slot + 1;

        let tokens = self.tokens.slice_assign(&[row.clone(), 0..1], &token)?;

        let fresh = Tensor::zeros((1, max_decode), DType::U32, &device)?
            .slice_assign(&[0..1, 0..1], &token)?;
        let results = self.results.slice_assign(&[row.clone(), 0..max_decode], &fresh)?;

        let caches = self
            .caches
            .iter()
            .zip(&prefix.caches)
            .map(|(layer, src)| layer.replace_slot(slot, self.pos, src))
            .collect::<Result<Vec<_>>>()?;

        let one = Tensor::ones((1, 1), DType::U32, &device)?;
        let gen_len = self.gen_len.slice_assign(&[row.clone(), 0..1], &one)?;
        let context = Tensor::new(&[[prefix.prompt_length as u32]], &device)?;
        let context_pos = self.context_pos.slice_assign(&[row, 0..1], &context)?;

        Ok(Self {
            tokens,
            results,
            caches,
            pos: self.pos,
            context_pos,
            gen_len,
            spec: self.spec,
        })
    }

    /// Apply one batch step for every slot at once.
    ///
    /// `next` is `[batch, 1]` u32. Each slot's token is written into its
    /// result row at offset `gen_len[slot]`; offsets past the buffer write
    /// nothing. All counters advance by one, idle slots included.
    pub fn advance(self, next: &Tensor, caches: Vec<LayerCache>) -> Result<Self> {
        let (batch, max_decode) = self.results.dims2()?;
        if next.dims() != [batch, 1] {
            return Err(Error::InvalidInput(format!(
                "expected next tokens [{batch}, 1], got {:?}",
                next.dims()
            )));
        }
        self.spec.check(&caches)?;
        let device = self.device().clone();
        let next = next.to_dtype(DType::U32)?;

        let offsets = self.gen_len.to_dtype(DType::I64)?.squeeze(1)?;
        let mask = one_hot_columns(&offsets, max_decode)?;
        let results = mask.where_cond(&next.broadcast_as((batch, max_decode))?, &self.results)?;

        let one = Tensor::ones((1, 1), DType::U32, &device)?;

        Ok(Self {
            tokens: next,
            results,
            caches,
            pos: self.pos + 1,
            context_pos: self.context_pos.broadcast_add(&one)?,
            gen_len: self.gen_len.broadcast_add(&one)?,
            spec: self.spec,
        })
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        let max_batch_size = self.max_batch_size();
        if slot >= max_batch_size {
            return Err(Error::SlotOutOfRange {
                slot,
                max_batch_size,
            });
        }
        Ok(())
    }
}
