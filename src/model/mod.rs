//! Scorer seam and implementations.
//!
//! The engine never looks inside a model. It hands a [`Scorer`] a batch of
//! token ids, the per-row cache columns to attend and write, and the caches
//! themselves, and gets back last-position logits and the updated caches.
//! A decode step feeds one token per row, so it writes exactly one cache
//! column per row.
//!
//! ```text
//!   tokens [B, T] ──┐
//!   window / write ─┼──► Scorer::forward ──► logits [B, V]
//!   caches ─────────┘                   └──► caches (T new columns per row)
//! ```
//!
//! This module contains:
//! - The [`Scorer`] trait
//! - Weight loading from SafeTensors
//! - [`ReferenceScorer`], a small attention model over the slot cache layout

pub mod loader;
pub mod reference;

use candle_core::{Device, Tensor};

use crate::core::{CacheSpec, LayerCache};
use crate::error::Result;

pub use loader::{load_safetensors, load_scorer_config};
pub use reference::{ReferenceParams, ReferenceScorer};

/// Inputs of one scorer call.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// Token ids, `[batch, steps]` (u32).
    pub tokens: &'a Tensor,
    /// First column each row may attend, `[batch]` (i64).
    pub window_start: &'a Tensor,
    /// Column the first new key/value of each row is written to, `[batch]` (i64).
    pub write_start: &'a Tensor,
}

/// Outputs of one scorer call.
#[derive(Debug, Clone)]
pub struct ScorerOutput {
    /// Logits of the last position of every row, `[batch, vocab_size]`.
    pub logits: Tensor,
    /// Caches with the new columns written.
    pub caches: Vec<LayerCache>,
}

/// An opaque model that scores tokens against a slot-indexed cache.
pub trait Scorer {
    /// Immutable weight set, loaded once and shared by every call.
    type Params;

    /// Load (or generate) the weights on `device`.
    fn load_params(&self, device: &Device) -> Result<Self::Params>;

    /// Layout of the caches this scorer reads and writes.
    fn cache_spec(&self) -> CacheSpec;

    /// Vocabulary size of the logits.
    fn vocab_size(&self) -> usize;

    /// Score `input.tokens`, writing their keys/values into `caches`.
    fn forward(
        &self,
        params: &Self::Params,
        input: StepInput<'_>,
        caches: Vec<LayerCache>,
    ) -> Result<ScorerOutput>;
}
