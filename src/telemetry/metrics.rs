//! Metric names and recording helpers over the `metrics` facade.
//!
//! Without an installed recorder every call is a no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

use crate::scheduler::CacheSource;

pub const ITEMS_TOTAL: &str = "extract_items_total";
pub const ITEM_LATENCY_MS: &str = "extract_item_latency_ms";
pub const ITEM_ATTEMPTS: &str = "extract_item_attempts";
pub const CACHE_LOOKUPS_TOTAL: &str = "extract_cache_lookups_total";
pub const RETRIES_TOTAL: &str = "extract_retries_total";
pub const RATE_LIMIT_WAIT_MS: &str = "extract_rate_limit_wait_ms";
pub const QUEUE_DEPTH: &str = "extract_queue_depth";
pub const BATCHES_TOTAL: &str = "extract_batches_total";
pub const BATCH_DURATION_MS: &str = "extract_batch_duration_ms";

/// Register descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(ITEMS_TOTAL, Unit::Count, "Work items reaching a terminal state, by outcome");
    describe_histogram!(ITEM_LATENCY_MS, Unit::Milliseconds, "Item latency from start to terminal state");
    describe_histogram!(ITEM_ATTEMPTS, Unit::Count, "Extractor attempts per executed item");
    describe_counter!(CACHE_LOOKUPS_TOTAL, Unit::Count, "Cache lookups, by hit, computed or joined");
    describe_counter!(RETRIES_TOTAL, Unit::Count, "Retries after transient extractor failures");
    describe_histogram!(RATE_LIMIT_WAIT_MS, Unit::Milliseconds, "Time spent waiting for rate limit tokens");
    describe_gauge!(QUEUE_DEPTH, Unit::Count, "Items waiting in the shared work queue");
    describe_counter!(BATCHES_TOTAL, Unit::Count, "Batches reaching a terminal status");
    describe_histogram!(BATCH_DURATION_MS, Unit::Milliseconds, "Wall-clock batch duration");
}

pub fn record_item_outcome(outcome: &'static str, latency: Duration, attempts: u32) {
    counter!(ITEMS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(ITEM_LATENCY_MS).record(latency.as_secs_f64() * 1000.0);
    if attempts > 0 {
        histogram!(ITEM_ATTEMPTS).record(f64::from(attempts));
    }
}

pub fn record_cache_lookup(source: CacheSource) {
    counter!(CACHE_LOOKUPS_TOTAL, "source" => source.as_str()).increment(1);
}

pub fn record_retry(reason: &'static str) {
    counter!(RETRIES_TOTAL, "reason" => reason).increment(1);
}

/// `scope` is `"batch"` or `"global"`.
pub fn record_rate_limit_wait(scope: &'static str, waited: Duration) {
    histogram!(RATE_LIMIT_WAIT_MS, "scope" => scope).record(waited.as_secs_f64() * 1000.0);
}

pub fn record_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn record_batch_finished(status: &'static str, elapsed: Option<Duration>) {
    counter!(BATCHES_TOTAL, "status" => status).increment(1);
    if let Some(elapsed) = elapsed {
        histogram!(BATCH_DURATION_MS).record(elapsed.as_secs_f64() * 1000.0);
    }
}
