//! Result records handed back to the orchestrator.
//!
//! `generate` packs every slot's outcome into one `[batch, 3]` buffer so the
//! orchestrator decodes the whole batch with a single fixed-offset scheme:
//!
//! ```text
//!            tokens_idx  valid_idx  length_idx
//!               (0,1)      (1,2)      (2,3)
//! slot 0:   [   token  ,   valid  ,  gen_len   ]
//! slot 1:   [   token  ,   valid  ,  gen_len   ]
//! ...
//! ```
//!
//! `gen_len` is the slot's generation length *before* the step, i.e. the
//! result-buffer offset the token was written to. `valid` drops to 0 once
//! the slot's cache is full and the step's key/value had nowhere to go.

use std::ops::Range;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Output of `prefill` for a single request.
#[derive(Debug, Clone)]
pub struct PrefillResult {
    /// First generated token, `[1, 1]` (u32).
    pub data: Tensor,
    /// Log-probability of the first token, `[1, 1]` (f32).
    pub scores: Tensor,
    /// Column range of the score in `scores`.
    pub token_score_index: (usize, usize),
}

impl PrefillResult {
    /// First token as a host value.
    pub fn token(&self) -> Result<u32> {
        Ok(self.data.flatten_all()?.to_vec1::<u32>()?[0])
    }

    /// Score of the first token as a host value.
    pub fn score(&self) -> Result<f32> {
        Ok(self.scores.flatten_all()?.to_vec1::<f32>()?[0])
    }
}

/// Packed outcome of one batch step.
#[derive(Debug, Clone)]
pub struct ResultTokens {
    /// `[batch, 3]` (u32): token, validity flag, generation length.
    pub data: Tensor,
    /// `[batch, 1]` (f32): log-probability of the chosen token.
    pub float_data: Tensor,
    /// Column range of the token in `data`.
    pub tokens_idx: (usize, usize),
    /// Column range of the validity flag in `data`.
    pub valid_idx: (usize, usize),
    /// Column range of the generation length in `data`.
    pub length_idx: (usize, usize),
    /// Column range of the score in `float_data`.
    pub scores_idx: (usize, usize),
    /// Samples produced per slot.
    pub samples_per_slot: usize,
}

/// One slot's view of a [`ResultTokens`].
#[derive(Debug, Clone, PartialEq)]
pub struct SlotData {
    /// Tokens produced this step.
    pub tokens: Vec<u32>,
    /// Validity flag per token.
    pub valid: Vec<bool>,
    /// Generation length before the step.
    pub length: u32,
    /// Log-probability per token.
    pub scores: Vec<f32>,
}

impl ResultTokens {
    /// Pack `tokens` `[batch, 1]`, their validity flags, their scores and the
    /// pre-step `gen_len`.
    pub fn pack(
        tokens: &Tensor,
        valid: &Tensor,
        scores: &Tensor,
        gen_len: &Tensor,
    ) -> Result<Self> {
        let tokens = tokens.to_dtype(DType::U32)?;
        let valid = valid.to_dtype(DType::U32)?;
        if valid.dims() != tokens.dims() {
            return Err(Error::InvalidInput(format!(
                "validity flags {:?} do not match tokens {:?}",
                valid.dims(),
                tokens.dims()
            )));
        }
        let length = gen_len.to_dtype(DType::U32)?;
        let data = Tensor::cat(&[&tokens, &valid, &length], 1)?;
        let width = tokens.dim(1)?;
        Ok(Self {
            data,
            float_data: scores.to_dtype(DType::F32)?,
            tokens_idx: (0, width),
            valid_idx: (width, 2 * width),
            length_idx: (2 * width, 2 * width + 1),
            scores_idx: (0, width),
            samples_per_slot: 1,
        })
    }

    /// Number of slots in the record.
    pub fn batch_size(&self) -> usize {
        self.data.dims()[0]
    }

    /// Decode the columns of `slot`.
    pub fn slot_data(&self, slot: usize) -> Result<SlotData> {
        let max_batch_size = self.batch_size();
        if slot >= max_batch_size {
            return Err(Error::SlotOutOfRange {
                slot,
                max_batch_size,
            });
        }
        let row = self.data.get(slot)?.to_vec1::<u32>()?;
        let scores = self.float_data.get(slot)?.to_vec1::<f32>()?;
        let span = |(start, end): (usize, usize)| -> Range<usize> { start..end };

        Ok(SlotData {
            tokens: row[span(self.tokens_idx)].to_vec(),
            valid: row[span(self.valid_idx)].iter().map(|&v| v != 0).collect(),
            length: row[self.length_idx.0],
            scores: scores[span(self.scores_idx)].to_vec(),
        })
    }
}
