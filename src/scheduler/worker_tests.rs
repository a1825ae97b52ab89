//! Tests for the dispatcher and item execution.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::batch::{BatchId, BatchStatus, ItemSpec, ItemState};
use crate::config::BatchOptions;
use crate::extractor::{ExtractionMode, ScriptedExtractor, TransientKind};
use crate::scheduler::{CacheConfig, RateLimitConfig, WorkQueueConfig};

fn context(extractor: Arc<dyn Extractor>, config: WorkerPoolConfig) -> Arc<WorkerContext> {
    Arc::new(WorkerContext {
        scheduler: Arc::new(WorkScheduler::new(WorkQueueConfig { max_pending: 64 })),
        tracker: Arc::new(crate::batch::BatchTracker::new()),
        cache: CacheStore::new(CacheConfig::default()),
        limiter: Arc::new(RateLimiter::new(RateLimitConfig { capacity: 1000, refill_per_sec: 1000.0 })),
        extractor,
        drain: Arc::new(DrainCoordinator::new()),
        config,
    })
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        multiplier: 1.0,
        max_delay: Duration::from_millis(1),
        jitter: 0.0,
    }
}

fn companies(names: &[&str]) -> Vec<ItemSpec> {
    names
        .iter()
        .map(|name| ItemSpec::new(ExtractRequest::company(*name, ExtractionMode::Full)))
        .collect()
}

async fn submit(ctx: &WorkerContext, specs: Vec<ItemSpec>, options: BatchOptions) -> BatchId {
    let (handle, items) = ctx.tracker.create(specs, options);
    ctx.scheduler.enqueue_all(items).await.unwrap();
    handle.id()
}

async fn wait_done(ctx: &WorkerContext, id: &BatchId) -> BatchStatus {
    tokio::time::timeout(Duration::from_secs(5), ctx.tracker.wait(id))
        .await
        .expect("batch should finish")
        .unwrap()
}

struct PanickingExtractor;

#[async_trait::async_trait]
impl Extractor for PanickingExtractor {
    async fn run(&self, _: &ExtractRequest) -> Result<Extracted, ExtractError> {
        panic!("parser blew up");
    }
}

#[tokio::test]
async fn pool_completes_every_item() {
    let extractor = Arc::new(ScriptedExtractor::new());
    let ctx = context(extractor.clone(), WorkerPoolConfig::default());
    let shutdown = CancellationToken::new();
    let pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["Acme", "Globex", "Initech"]), BatchOptions::default().with_concurrency(2)).await;
    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Completed);

    let results = ctx.tracker.get_results(&id).unwrap();
    assert_eq!(results.summary.succeeded, 3);
    for item in &results.items {
        assert_eq!(item.state, ItemState::Succeeded);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.source, Some(CacheSource::Computed));
    }
    assert_eq!(extractor.calls(), 3);

    shutdown.cancel();
    ctx.scheduler.wake();
    tokio::time::timeout(Duration::from_secs(1), pool).await.unwrap().unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let extractor = Arc::new(ScriptedExtractor::new().fail_transiently("Acme", 2));
    let config = WorkerPoolConfig { retry: fast_retry(3), ..Default::default() };
    let ctx = context(extractor.clone(), config);
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["Acme"]), BatchOptions::default()).await;
    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Completed);

    let results = ctx.tracker.get_results(&id).unwrap();
    assert_eq!(results.items[0].attempts, 3);
    assert_eq!(extractor.calls_for("Acme"), 3);
    shutdown.cancel();
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let extractor = Arc::new(ScriptedExtractor::new().fail_transiently("Acme", 10));
    let config = WorkerPoolConfig { retry: fast_retry(2), ..Default::default() };
    let ctx = context(extractor.clone(), config);
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["Acme"]), BatchOptions::default()).await;
    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Failed);

    let item = &ctx.tracker.get_results(&id).unwrap().items[0];
    assert_eq!(item.attempts, 2);
    assert!(matches!(item.error, Some(ExtractError::Transient { kind: TransientKind::Network, .. })));
    shutdown.cancel();
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let extractor = Arc::new(ScriptedExtractor::new().fail_permanently("Globex"));
    let config = WorkerPoolConfig { retry: fast_retry(5), ..Default::default() };
    let ctx = context(extractor.clone(), config);
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["Acme", "Globex"]), BatchOptions::default()).await;
    // One success is enough for the batch to complete.
    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Completed);

    let results = ctx.tracker.get_results(&id).unwrap();
    assert_eq!(results.summary.failed, 1);
    assert_eq!(extractor.calls_for("Globex"), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn slow_extractor_times_out() {
    let extractor = Arc::new(ScriptedExtractor::new().with_delay(Duration::from_millis(500)));
    let config = WorkerPoolConfig {
        item_timeout: Duration::from_millis(20),
        retry: RetryPolicy::none(),
        ..Default::default()
    };
    let ctx = context(extractor, config);
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["Acme"]), BatchOptions::default()).await;
    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Failed);

    let item = &ctx.tracker.get_results(&id).unwrap().items[0];
    assert!(matches!(item.error, Some(ExtractError::Transient { kind: TransientKind::Timeout, .. })));
    shutdown.cancel();
}

#[tokio::test]
async fn batch_concurrency_limit_is_respected() {
    let extractor = Arc::new(ScriptedExtractor::new().with_delay(Duration::from_millis(20)));
    let ctx = context(extractor.clone(), WorkerPoolConfig { max_concurrent: 8, ..Default::default() });
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let names = ["a", "b", "c", "d", "e", "f"];
    let (handle, items) = ctx.tracker.create(companies(&names), BatchOptions::default().with_concurrency(2));
    ctx.scheduler.enqueue_all(items).await.unwrap();
    assert_eq!(wait_done(&ctx, &handle.id()).await, BatchStatus::Completed);

    assert!(handle.peak_running() <= 2, "peak was {}", handle.peak_running());
    assert!(extractor.peak_concurrency() <= 2);
    assert_eq!(extractor.calls(), 6);
    shutdown.cancel();
}

#[tokio::test]
async fn identical_requests_share_one_call() {
    let extractor = Arc::new(ScriptedExtractor::new().with_delay(Duration::from_millis(30)));
    let ctx = context(extractor.clone(), WorkerPoolConfig::default());
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["Acme", "ACME", " acme "]), BatchOptions::default().with_concurrency(3)).await;
    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Completed);

    assert_eq!(extractor.calls(), 1);
    let results = ctx.tracker.get_results(&id).unwrap();
    let computed = results
        .items
        .iter()
        .filter(|item| item.source == Some(CacheSource::Computed))
        .count();
    assert_eq!(computed, 1);
    assert_eq!(results.summary.total_attempts, 1);
    shutdown.cancel();
}

#[tokio::test]
async fn extractor_panic_faults_the_batch() {
    let ctx = context(Arc::new(PanickingExtractor), WorkerPoolConfig { retry: fast_retry(3), ..Default::default() });
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["Acme"]), BatchOptions::default()).await;
    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Failed);

    let results = ctx.tracker.get_results(&id).unwrap();
    assert!(matches!(results.items[0].error, Some(ExtractError::Infrastructure { .. })));
    assert!(results.summary.fault.is_some());
    shutdown.cancel();
}

#[tokio::test]
async fn cancelled_batch_skips_unstarted_items() {
    let extractor = Arc::new(ScriptedExtractor::new().gated());
    let ctx = context(extractor.clone(), WorkerPoolConfig::default());
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    let id = submit(&ctx, companies(&["a", "b", "c"]), BatchOptions::default().with_concurrency(1)).await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while extractor.in_progress() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    let (cancelled, parked) = ctx.tracker.cancel(&id).unwrap();
    assert!(cancelled);
    assert!(parked.is_empty());
    extractor.release(3);

    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Cancelled);
    let snapshot = ctx.tracker.get_status(&id).unwrap();
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.cancelled, 2);
    assert_eq!(extractor.calls(), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn higher_priority_items_start_first() {
    let extractor = Arc::new(ScriptedExtractor::new());
    let ctx = context(extractor.clone(), WorkerPoolConfig { max_concurrent: 1, ..Default::default() });

    let specs = vec![
        ItemSpec::new(ExtractRequest::company("low", ExtractionMode::Full)).with_priority(crate::scheduler::Priority::Low),
        ItemSpec::new(ExtractRequest::company("normal", ExtractionMode::Full)),
        ItemSpec::new(ExtractRequest::company("high", ExtractionMode::Full)).with_priority(crate::scheduler::Priority::High),
    ];
    // Enqueue before the pool starts so ordering is decided by the queue alone.
    let id = submit(&ctx, specs, BatchOptions::default().with_concurrency(1)).await;
    let shutdown = CancellationToken::new();
    let _pool = spawn_pool(ctx.clone(), shutdown.clone());

    assert_eq!(wait_done(&ctx, &id).await, BatchStatus::Completed);
    assert_eq!(extractor.start_order(), vec!["high", "normal", "low"]);
    shutdown.cancel();
}

#[tokio::test]
async fn pool_exits_on_shutdown() {
    let ctx = context(Arc::new(ScriptedExtractor::new()), WorkerPoolConfig::default());
    let shutdown = CancellationToken::new();
    let pool = spawn_pool(ctx.clone(), shutdown.clone());

    shutdown.cancel();
    ctx.scheduler.wake();
    let result = tokio::time::timeout(Duration::from_secs(1), pool).await;
    assert!(result.is_ok(), "dispatcher should stop after cancellation");
}
