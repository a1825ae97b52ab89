//! Telemetry for the extraction engine.
//!
//! Structured logging through `tracing`, per-item spans, and metrics
//! through the `metrics` facade. No exporter is installed here; the
//! embedding application chooses one.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    describe_metrics, record_batch_finished, record_cache_lookup, record_item_outcome,
    record_queue_depth, record_rate_limit_wait, record_retry,
};
pub use spans::{BatchSpan, ItemSpan, SpanExt};
