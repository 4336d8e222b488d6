//! Error types for slot-engine.

use thiserror::Error;

/// Result type alias for slot-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for slot-engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Prompt input is not a well-formed one-dimensional token sequence.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation is part of the engine interface but intentionally unimplemented.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Slot index outside `[0, max_batch_size)`.
    #[error("slot {slot} out of range (max batch size {max_batch_size})")]
    SlotOutOfRange { slot: usize, max_batch_size: usize },

    /// Inserting at the current batch step would run past the cache capacity.
    #[error("cache exhausted: {needed} positions needed, capacity {capacity}")]
    CacheExhausted { needed: usize, capacity: usize },

    /// Prefix cache does not match the layout of the decode state.
    #[error("prefix mismatch: {0}")]
    PrefixMismatch(String),

    /// Partitioning or re-partitioning failed.
    #[error("placement error: {0}")]
    Placement(String),

    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
