//! Telemetry module tests.

use std::path::PathBuf;
use std::time::Duration;

use extract_core::batch::BatchId;
use extract_core::scheduler::CacheSource;
use extract_core::telemetry::{
    describe_metrics, record_batch_finished, record_cache_lookup, record_item_outcome,
    record_queue_depth, record_rate_limit_wait, record_retry, BatchSpan, ItemSpan, LogConfig,
    LogError, LogFormat, SpanExt,
};

// =============================================================================
// LogConfig Tests
// =============================================================================

#[test]
fn log_config_default_is_json() {
    let config = LogConfig::default();
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, "info");
    assert!(config.output_path.is_none());
}

#[test]
fn log_config_with_output_path() {
    let config = LogConfig {
        format: LogFormat::Pretty,
        level: "extract_core::scheduler=trace".to_string(),
        output_path: Some(PathBuf::from("/tmp/extract.log")),
    };
    assert_eq!(config.format, LogFormat::Pretty);
    assert_eq!(config.output_path, Some(PathBuf::from("/tmp/extract.log")));
}

#[test]
fn log_format_parses_names() {
    assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
    assert_eq!(" Pretty ".parse::<LogFormat>(), Ok(LogFormat::Pretty));
    assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Pretty));
    assert!("xml".parse::<LogFormat>().is_err());
}

// =============================================================================
// LogError Tests
// =============================================================================

#[test]
fn log_error_display() {
    let error = LogError::InvalidFilter("bad filter".to_string());
    assert!(error.to_string().contains("Invalid log filter"));
    assert!(error.to_string().contains("bad filter"));

    let error = LogError::FileOpen("permission denied".to_string());
    assert!(error.to_string().contains("Failed to open log file"));

    assert_eq!(LogError::AlreadyInitialized.to_string(), "Subscriber already initialized");
}

// =============================================================================
// Span Tests
// =============================================================================

#[test]
fn item_span_records_results_without_subscriber() {
    let batch_id = BatchId::new();
    let span = ItemSpan::new(&batch_id, 3, "company_lookup");
    span.record("attempts", 2u32);
    span.record("source", "computed");
    span.record_result::<(), String>(&Ok(()));
    span.record_result::<(), String>(&Err("upstream timeout".to_string()));
}

#[test]
fn batch_span_can_be_entered() {
    let span = BatchSpan::new(&BatchId::new(), 12);
    let _guard = span.enter();
    tracing::info!("inside batch span");
}

// =============================================================================
// Metrics Tests
// =============================================================================

#[test]
fn metrics_calls_are_safe_without_recorder() {
    describe_metrics();
    record_item_outcome("succeeded", Duration::from_millis(40), 1);
    record_item_outcome("failed", Duration::ZERO, 3);
    record_cache_lookup(CacheSource::Hit);
    record_cache_lookup(CacheSource::Joined);
    record_retry("network");
    record_rate_limit_wait("global", Duration::from_millis(5));
    record_queue_depth(42);
    record_batch_finished("completed", Some(Duration::from_secs(2)));
    record_batch_finished("cancelled", None);
}
