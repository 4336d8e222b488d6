//! Core state for slot-engine.
//!
//! This module contains the data the engine operations move around:
//! - KV cache layout and column-addressed writes
//! - DecodeState, the batch-shaped state shared by every slot
//! - Prefix, the detached output of prefill

pub mod decode_state;
pub mod kv_cache;
pub mod prefix;

pub use decode_state::DecodeState;
pub use kv_cache::{CacheSpec, LayerCache};
pub use prefix::{PrefillInputs, Prefix};
