//! Dispatcher loop and per-item execution.
//!
//! The dispatcher takes a pool permit, dequeues the next item, checks the
//! batch (cancelled, paused), takes a batch slot and spawns the item.
//! Items run through the cache, the rate limiters and the extractor with
//! retries, and report exactly one outcome to the tracker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::dedup::{CacheSource, CacheStore};
use super::item::WorkItem;
use super::queue::WorkScheduler;
use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use crate::batch::{Admission, BatchHandle, BatchTracker, ItemOutcome, Outcome};
use crate::extractor::{ExtractError, ExtractRequest, Extracted, Extractor};
use crate::shutdown::DrainCoordinator;
use crate::telemetry::{self, ItemSpan};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Items executing at once across all batches.
    pub max_concurrent: usize,
    /// Bound on each extractor call and on each token wait.
    pub item_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            item_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared services handed to the pool.
pub struct WorkerContext {
    pub scheduler: Arc<WorkScheduler>,
    pub tracker: Arc<BatchTracker>,
    pub cache: CacheStore,
    /// Global quota shared by every batch.
    pub limiter: Arc<RateLimiter>,
    pub extractor: Arc<dyn Extractor>,
    pub drain: Arc<DrainCoordinator>,
    pub config: WorkerPoolConfig,
}

/// Spawn the dispatcher. Returns a handle for shutdown.
pub fn spawn_pool(ctx: Arc<WorkerContext>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        dispatch_loop(ctx, shutdown).await;
    })
}

async fn dispatch_loop(ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    let permits = Arc::new(Semaphore::new(ctx.config.max_concurrent.max(1)));
    loop {
        let permit = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let item = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            item = ctx.scheduler.wait_and_dequeue() => item,
        };
        dispatch(&ctx, item, permit, &shutdown).await;
    }
    tracing::info!("dispatcher: shutdown signal received");
}

async fn dispatch(ctx: &Arc<WorkerContext>, item: WorkItem, permit: OwnedSemaphorePermit, shutdown: &CancellationToken) {
    let handle = match ctx.tracker.handle(&item.batch_id) {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!(batch_id = %item.batch_id, item_id = item.id, "dropping item of unknown batch");
            return;
        }
    };
    let Some(item) = admit(ctx, &handle, item) else { return };

    // Slot is taken before spawning so start order follows dequeue order.
    let slot = tokio::select! {
        biased;
        () = shutdown.cancelled() => {
            ctx.scheduler.requeue(item).await;
            return;
        }
        slot = handle.slots().acquire_owned() => match slot {
            Ok(slot) => slot,
            Err(_) => return,
        },
    };
    // The batch may have been paused or cancelled while we waited.
    let Some(item) = admit(ctx, &handle, item) else { return };
    let Some(drain) = ctx.drain.track() else {
        ctx.scheduler.requeue(item).await;
        return;
    };

    let batch_id = item.batch_id;
    let item_id = item.id;
    let task = {
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let _permit = permit;
            let _slot = slot;
            let _drain = drain;
            execute_item(&ctx, handle, item).await;
        })
    };

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let Err(e) = task.await else { return };
        let reason = if e.is_panic() { "worker task panicked" } else { "worker task aborted" };
        tracing::error!(batch_id = %batch_id, item_id, reason, "item task failed");
        let _ = ctx.tracker.mark_fault(&batch_id, reason);
        let _ = ctx
            .tracker
            .record_result(&batch_id, item_id, ItemOutcome::aborted(ExtractError::infrastructure(reason)));
    });
}

/// Returns the item if it should run now.
fn admit(ctx: &WorkerContext, handle: &BatchHandle, item: WorkItem) -> Option<WorkItem> {
    match handle.admit(item) {
        Admission::Run(item) => Some(item),
        Admission::Parked => None,
        Admission::Cancelled(item) => {
            if let Err(e) = ctx.tracker.record_result(&item.batch_id, item.id, ItemOutcome::cancelled()) {
                tracing::warn!(item_id = item.id, error = %e, "failed to record cancelled item");
            }
            None
        }
    }
}

async fn execute_item(ctx: &Arc<WorkerContext>, handle: Arc<BatchHandle>, item: WorkItem) {
    let span = ItemSpan::new(&item.batch_id, item.id, item.request.kind());
    async {
        let started = Instant::now();
        let running = handle.mark_running(item.id);
        let key = item.request.fingerprint();
        let attempts = Arc::new(AtomicU32::new(0));

        let (source, result) = ctx
            .cache
            .get_or_compute(&key, handle.options().ttl, || {
                let ctx = Arc::clone(ctx);
                let batch_limiter = handle.limiter().cloned();
                let request = item.request.clone();
                let attempts = Arc::clone(&attempts);
                async move { run_attempts(&ctx, batch_limiter.as_deref(), &request, &attempts).await }.boxed()
            })
            .await;
        let elapsed = started.elapsed();
        drop(running);

        let attempts = match source {
            CacheSource::Computed => attempts.load(Ordering::SeqCst),
            CacheSource::Hit | CacheSource::Joined => 0,
        };
        let span = tracing::Span::current();
        span.record("attempts", attempts);
        span.record("source", source.as_str());
        span.record("latency_ms", elapsed.as_millis() as u64);
        telemetry::SpanExt::record_result(&span, &result);

        let outcome = match result {
            Ok(value) => Outcome::Succeeded(value),
            Err(error) => {
                tracing::debug!(fingerprint = %key, error = %error, "item failed");
                Outcome::Failed(error)
            }
        };
        let report = ItemOutcome { outcome, attempts, source: Some(source), elapsed: Some(elapsed) };
        if let Err(e) = ctx.tracker.record_result(&item.batch_id, item.id, report) {
            tracing::warn!(error = %e, "failed to record item outcome");
        }
    }
    .instrument(span)
    .await
}

/// Token acquisition and extractor calls with retry. Runs on the
/// single-flight owner only.
async fn run_attempts(
    ctx: &WorkerContext,
    batch_limiter: Option<&RateLimiter>,
    request: &ExtractRequest,
    attempts: &AtomicU32,
) -> Result<Extracted, ExtractError> {
    let policy = &ctx.config.retry;
    let mut attempt = 0;
    loop {
        attempt += 1;
        attempts.store(attempt, Ordering::SeqCst);

        let result = match acquire_tokens(ctx, batch_limiter).await {
            Ok(()) => call_extractor(ctx, request).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(attempt, &e) => {
                let delay = policy.delay_for(attempt);
                telemetry::record_retry(retry_reason(&e));
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Batch token first, then the global one, both bounded by the item timeout.
async fn acquire_tokens(ctx: &WorkerContext, batch_limiter: Option<&RateLimiter>) -> Result<(), ExtractError> {
    let deadline = Instant::now() + ctx.config.item_timeout;
    if let Some(limiter) = batch_limiter {
        let waited = limiter
            .acquire(1, deadline)
            .await
            .map_err(|e| ExtractError::rate_limited(format!("batch {e}")))?;
        telemetry::record_rate_limit_wait("batch", waited);
    }
    let waited = ctx
        .limiter
        .acquire(1, deadline)
        .await
        .map_err(|e| ExtractError::rate_limited(format!("global {e}")))?;
    telemetry::record_rate_limit_wait("global", waited);
    Ok(())
}

async fn call_extractor(ctx: &WorkerContext, request: &ExtractRequest) -> Result<Extracted, ExtractError> {
    let timeout = ctx.config.item_timeout;
    match tokio::time::timeout(timeout, ctx.extractor.run(request)).await {
        Ok(result) => result,
        Err(_) => Err(ExtractError::timeout(format!("extractor call exceeded {}ms", timeout.as_millis()))),
    }
}

fn retry_reason(error: &ExtractError) -> &'static str {
    match error {
        ExtractError::Transient { kind, .. } => kind.as_str(),
        _ => "other",
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
