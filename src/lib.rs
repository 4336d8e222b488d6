//! slot-engine: a continuous-batching decode-state engine.
//!
//! This crate implements the request-batching core of an LLM inference
//! server:
//! - Prefill of a single request into a detached prefix
//! - Insertion of a prefix into one slot of a fixed-size batch
//! - Batched generation advancing every slot by one step
//! - A placement contract for moving prefixes between prefill and decode pools
//!
//! The model is an opaque [`Scorer`]; [`ReferenceScorer`] is a small
//! attention model used by the demo and tests.

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod model;
pub mod placement;

pub use config::{EngineConfig, PerRequestHyperparams, SamplingConfig, ScorerConfig};
pub use crate::core::{CacheSpec, DecodeState, LayerCache, PrefillInputs, Prefix};
pub use engine::{BatchEngine, PrefillResult, ResultTokens, Sampler, SlotData};
pub use error::{Error, Result};
pub use model::{
    load_safetensors, load_scorer_config, ReferenceParams, ReferenceScorer, Scorer, ScorerOutput,
    StepInput,
};
pub use placement::{Partition, PlacementContract, PrefixShards};
