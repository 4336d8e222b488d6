//! Inference engine.
//!
//! This module contains:
//! - BatchEngine for prefill, insert and generate
//! - Result records returned to the orchestrator
//! - Sampler for the first token of a request

pub mod batch_engine;
pub mod result;
pub mod sampler;

pub use batch_engine::BatchEngine;
pub use result::{PrefillResult, ResultTokens, SlotData};
pub use sampler::Sampler;
