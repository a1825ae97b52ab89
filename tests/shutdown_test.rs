//! Drain coordination and engine shutdown.

use std::sync::Arc;
use std::time::Duration;

use extract_core::extractor::{ExtractError, ExtractionMode, ScriptedExtractor};
use extract_core::scheduler::{RateLimitConfig, RetryPolicy};
use extract_core::shutdown::{DrainCoordinator, DrainState};
use extract_core::{
    BatchOptions, BatchStatus, EngineConfig, EngineError, ExtractRequest, ExtractionEngine, ItemSpec, ItemState,
    ShutdownResult,
};

fn test_config() -> EngineConfig {
    EngineConfig {
        max_concurrent: 4,
        global_rate: RateLimitConfig { capacity: 1000, refill_per_sec: 1000.0 },
        item_timeout: Duration::from_secs(5),
        retry: RetryPolicy::none(),
        token_poll_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}

fn companies(names: &[&str]) -> Vec<ItemSpec> {
    names
        .iter()
        .map(|name| ItemSpec::new(ExtractRequest::company(*name, ExtractionMode::Basic)))
        .collect()
}

async fn until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn drain_with_nothing_in_flight_completes() {
    let drain = DrainCoordinator::new();
    assert!(drain.is_accepting());

    let result = drain.initiate(Duration::from_secs(1)).await;
    assert_eq!(result, ShutdownResult::Complete);
    assert_eq!(drain.state(), DrainState::Stopped);
    assert!(drain.track().is_none());
}

#[tokio::test]
async fn drain_waits_for_guards() {
    let drain = Arc::new(DrainCoordinator::new());
    let guard = drain.track().unwrap();
    assert_eq!(drain.in_flight(), 1);

    let waiter = {
        let drain = Arc::clone(&drain);
        tokio::spawn(async move { drain.initiate(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(drain.state(), DrainState::Draining);
    assert!(drain.track().is_none());

    drop(guard);
    assert_eq!(waiter.await.unwrap(), ShutdownResult::Complete);
    assert_eq!(drain.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn drain_times_out_with_remaining_count() {
    let drain = DrainCoordinator::new();
    let _a = drain.track().unwrap();
    let _b = drain.track().unwrap();

    let result = drain.initiate(Duration::from_millis(100)).await;
    assert_eq!(result, ShutdownResult::Timeout { remaining: 2 });
}

#[tokio::test]
async fn shutdown_fails_items_that_never_started() {
    let extractor = Arc::new(ScriptedExtractor::new().with_delay(Duration::from_millis(30)));
    let engine = ExtractionEngine::new(test_config(), extractor.clone());
    engine.start();

    let id = engine
        .submit_batch(companies(&["a", "b", "c", "d"]), BatchOptions::default().with_concurrency(1))
        .await
        .unwrap();
    until(|| extractor.in_progress() == 1).await;

    let result = engine.shutdown(Duration::from_secs(5)).await;
    assert_eq!(result, ShutdownResult::Complete);

    let status = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_batch(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, BatchStatus::Failed);

    let results = engine.get_batch_results(&id).unwrap();
    assert_eq!(results.summary.succeeded, 1);
    assert_eq!(results.summary.failed, 3);
    assert!(results.summary.fault.is_some());
    for item in results.items.iter().filter(|item| item.state == ItemState::Failed) {
        assert!(matches!(item.error, Some(ExtractError::Infrastructure { .. })));
        assert!(item.started_at.is_none());
        assert_eq!(item.attempts, 0);
    }
    assert_eq!(extractor.calls(), 1);
}

#[tokio::test]
async fn shutdown_reports_items_still_running() {
    let extractor = Arc::new(ScriptedExtractor::new().gated());
    let engine = ExtractionEngine::new(test_config(), extractor.clone());
    engine.start();

    let id = engine
        .submit_batch(companies(&["slow", "queued"]), BatchOptions::default().with_concurrency(1))
        .await
        .unwrap();
    until(|| extractor.in_progress() == 1).await;

    let result = engine.shutdown(Duration::from_millis(50)).await;
    assert_eq!(result, ShutdownResult::Timeout { remaining: 1 });

    // The running item still lands; the batch then finalizes as faulted.
    extractor.release(1);
    let status = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_batch(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, BatchStatus::Failed);
    let snapshot = engine.get_batch_status(&id).unwrap();
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.failed, 1);
}

#[tokio::test]
async fn cancelled_batch_leftovers_stay_cancelled_on_shutdown() {
    let extractor = Arc::new(ScriptedExtractor::new().gated());
    let engine = ExtractionEngine::new(test_config(), extractor.clone());
    engine.start();

    let id = engine
        .submit_batch(companies(&["x", "y", "z"]), BatchOptions::default().with_concurrency(1))
        .await
        .unwrap();
    until(|| extractor.in_progress() == 1).await;
    assert!(engine.cancel_batch(&id).await.unwrap());

    extractor.release(1);
    engine.shutdown(Duration::from_secs(5)).await;

    let snapshot = engine.get_batch_status(&id).unwrap();
    assert_eq!(snapshot.status, BatchStatus::Cancelled);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.cancelled, 2);
    assert_eq!(snapshot.failed, 0);
}

#[tokio::test]
async fn submissions_are_refused_after_shutdown() {
    let extractor = Arc::new(ScriptedExtractor::new());
    let engine = ExtractionEngine::new(test_config(), extractor.clone());
    engine.start();
    engine.shutdown(Duration::from_secs(1)).await;

    let err = engine
        .submit_batch(companies(&["late"]), BatchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown));
    assert_eq!(extractor.calls(), 0);
}
