//! Span helpers for batches and items.

use tracing::{info_span, Span};

use crate::batch::BatchId;
use crate::scheduler::ItemId;

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Span for one work item execution.
pub struct ItemSpan;

impl ItemSpan {
    /// `status`, `error.message`, `attempts`, `source` and `latency_ms`
    /// are filled in once the item finishes.
    pub fn new(batch_id: &BatchId, item_id: ItemId, kind: &str) -> Span {
        info_span!(
            "extract_item",
            batch_id = %batch_id,
            item_id,
            kind = %kind,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            attempts = tracing::field::Empty,
            source = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}

/// Span covering batch submission.
pub struct BatchSpan;

impl BatchSpan {
    pub fn new(batch_id: &BatchId, items: usize) -> Span {
        info_span!("extract_batch", batch_id = %batch_id, items)
    }
}
