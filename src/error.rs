//! Engine-level errors returned by the public API.

use thiserror::Error;

use crate::batch::{BatchId, BatchStatus};
use crate::scheduler::{ItemId, QueueError};

/// A batch submission was rejected before anything was enqueued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("batch has no items")]
    EmptyBatch,

    #[error("batch has {count} items, maximum is {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("concurrency limit {value} outside 1..={max}")]
    ConcurrencyLimit { value: usize, max: usize },

    #[error("rate limit must be a positive number of requests per second, got {0}")]
    RateLimit(f64),

    #[error("cache ttl of {secs}s exceeds maximum of {max}s")]
    Ttl { secs: u64, max: u64 },

    #[error("item {index} is invalid: {reason}")]
    InvalidItem { index: usize, reason: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    QueueFull(#[from] QueueError),

    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("item {item_id} not found in batch {batch_id}")]
    ItemNotFound { batch_id: BatchId, item_id: ItemId },

    #[error("batch {batch_id} is still {status}")]
    NotTerminal { batch_id: BatchId, status: BatchStatus },

    #[error("batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition { batch_id: BatchId, from: BatchStatus, to: BatchStatus },

    #[error("engine is shutting down")]
    ShuttingDown,
}
