//! extract-core
//!
//! Batch extraction engine: turns many independently submitted extraction
//! requests (company lookups, paginated searches, crawl targets) into
//! throughput-managed work under a shared upstream quota.
//!
//! # Pipeline
//!
//! - **Submit**: a batch is validated, recorded by the tracker and its
//!   items pushed onto one priority queue shared by every batch.
//! - **Dispatch**: the worker pool pulls items in tier/FIFO order under a
//!   global and a per-batch concurrency bound.
//! - **Execute**: each item consults the result cache (joining identical
//!   in-flight work), takes rate-limit tokens, calls the [`Extractor`]
//!   under a timeout and retries transient failures.
//! - **Track**: outcomes are recorded exactly once per item; the last one
//!   finalizes the batch and its summary.

pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod extractor;
pub mod persist;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use batch::{BatchId, BatchResults, BatchStatus, ItemOutcome, ItemSpec, ItemState, StatusSnapshot};
pub use config::{BatchOptions, EngineConfig};
pub use error::{EngineError, ValidationError};
pub use extractor::{ExtractError, ExtractRequest, Extracted, Extractor};
pub use shutdown::ShutdownResult;

use batch::BatchTracker;
use persist::StateStore;
use scheduler::{
    spawn_pool, CacheStore, ItemId, RateLimiter, WorkQueueConfig, WorkScheduler, WorkerContext,
    WorkerPoolConfig,
};
use shutdown::DrainCoordinator;
use telemetry::BatchSpan;

const SHUTDOWN_REASON: &str = "engine shut down before item ran";

/// Public entry point: owns the shared services and the worker pool.
pub struct ExtractionEngine {
    config: EngineConfig,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ExtractionEngine {
    pub fn new(config: EngineConfig, extractor: Arc<dyn Extractor>) -> Self {
        Self::build(config, extractor, None)
    }

    /// Engine that mirrors batch, item and cache state into `store`.
    pub fn with_persistence(config: EngineConfig, extractor: Arc<dyn Extractor>, store: Arc<dyn StateStore>) -> Self {
        Self::build(config, extractor, Some(store))
    }

    fn build(config: EngineConfig, extractor: Arc<dyn Extractor>, store: Option<Arc<dyn StateStore>>) -> Self {
        let mut tracker = BatchTracker::new().with_token_poll_interval(config.token_poll_interval);
        let cache = match &store {
            Some(store) => {
                tracker = tracker.with_store(Arc::clone(store));
                CacheStore::with_store(config.cache.clone(), Arc::clone(store))
            }
            None => CacheStore::new(config.cache.clone()),
        };
        let limiter = RateLimiter::new(config.global_rate).with_poll_interval(config.token_poll_interval);

        let ctx = Arc::new(WorkerContext {
            scheduler: Arc::new(WorkScheduler::new(WorkQueueConfig { max_pending: config.max_pending })),
            tracker: Arc::new(tracker),
            cache,
            limiter: Arc::new(limiter),
            extractor,
            drain: Arc::new(DrainCoordinator::new()),
            config: WorkerPoolConfig {
                max_concurrent: config.max_concurrent,
                item_timeout: config.item_timeout,
                retry: config.retry.clone(),
            },
        });

        Self {
            config,
            ctx,
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            maintenance: Mutex::new(None),
        }
    }

    /// Spawn the worker pool and the maintenance task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        *dispatcher = Some(spawn_pool(Arc::clone(&self.ctx), self.shutdown.clone()));
        *self.maintenance.lock() = Some(spawn_maintenance(
            Arc::clone(&self.ctx),
            self.config.maintenance_interval,
            self.config.batch_retention,
            self.shutdown.clone(),
        ));
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            max_pending = self.config.max_pending,
            "extraction engine started"
        );
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine defaults for [`submit_batch`](Self::submit_batch).
    pub fn default_options(&self) -> BatchOptions {
        self.config.defaults.clone()
    }

    /// Validate and enqueue a batch. Nothing is enqueued if any check fails.
    pub async fn submit_batch(&self, items: Vec<ItemSpec>, options: BatchOptions) -> Result<BatchId, EngineError> {
        if self.shutdown.is_cancelled() || !self.ctx.drain.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        if items.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        if items.len() > self.config.max_batch_items {
            return Err(ValidationError::TooManyItems { count: items.len(), max: self.config.max_batch_items }.into());
        }
        options.validate(&self.config)?;
        for (index, spec) in items.iter().enumerate() {
            if let Err(e) = spec.request.validate() {
                return Err(ValidationError::InvalidItem { index, reason: e.to_string() }.into());
            }
        }

        let count = items.len();
        let (handle, work) = self.ctx.tracker.create(items, options);
        let batch_id = handle.id();
        let span = BatchSpan::new(&batch_id, count);
        if let Err(e) = self.ctx.scheduler.enqueue_all(work).instrument(span.clone()).await {
            self.ctx.tracker.discard(&batch_id);
            tracing::warn!(parent: &span, error = %e, "batch rejected");
            return Err(e.into());
        }
        tracing::info!(parent: &span, concurrency = handle.options().concurrency_limit, "batch submitted");
        Ok(batch_id)
    }

    pub fn get_batch_status(&self, batch_id: &BatchId) -> Result<StatusSnapshot, EngineError> {
        self.ctx.tracker.get_status(batch_id)
    }

    /// Per-item results and summary. `NotTerminal` while the batch runs.
    pub fn get_batch_results(&self, batch_id: &BatchId) -> Result<BatchResults, EngineError> {
        self.ctx.tracker.get_results(batch_id)
    }

    /// Cancel every item that has not started. Running items finish.
    ///
    /// Returns `false` if the batch was already terminal or cancelled.
    pub async fn cancel_batch(&self, batch_id: &BatchId) -> Result<bool, EngineError> {
        let (cancelled, mut pending) = self.ctx.tracker.cancel(batch_id)?;
        if !cancelled {
            return Ok(false);
        }
        pending.extend(self.ctx.scheduler.drain_batch(batch_id).await);
        for item in pending {
            self.ctx.tracker.record_result(batch_id, item.id, ItemOutcome::cancelled())?;
        }
        Ok(true)
    }

    /// Cancel one queued or parked item.
    ///
    /// Returns `false` if the item has already been picked up.
    pub async fn cancel_item(&self, batch_id: &BatchId, item_id: ItemId) -> Result<bool, EngineError> {
        let handle = self.ctx.tracker.handle(batch_id)?;
        let state = handle
            .item_state(item_id)
            .ok_or(EngineError::ItemNotFound { batch_id: *batch_id, item_id })?;
        if state != ItemState::Queued {
            return Ok(false);
        }
        let removed = match self.ctx.scheduler.cancel(item_id).await {
            Some(item) => Some(item),
            None => handle.take_parked(item_id),
        };
        match removed {
            Some(item) => self.ctx.tracker.record_result(batch_id, item.id, ItemOutcome::cancelled()),
            None => Ok(false),
        }
    }

    /// Stop starting items of this batch. Running items finish.
    pub fn pause_batch(&self, batch_id: &BatchId) -> Result<(), EngineError> {
        self.ctx.tracker.pause(batch_id)
    }

    /// Put parked items back on the queue in their original order.
    pub async fn resume_batch(&self, batch_id: &BatchId) -> Result<(), EngineError> {
        let parked = self.ctx.tracker.resume(batch_id)?;
        self.ctx.scheduler.requeue_all(parked).await;
        Ok(())
    }

    pub async fn wait_for_batch(&self, batch_id: &BatchId) -> Result<BatchStatus, EngineError> {
        self.ctx.tracker.wait(batch_id).await
    }

    /// Forget a terminal batch.
    pub fn remove_batch(&self, batch_id: &BatchId) -> Result<(), EngineError> {
        self.ctx.tracker.remove(batch_id)
    }

    /// Items waiting in the shared queue.
    pub async fn queue_depth(&self) -> usize {
        self.ctx.scheduler.len().await
    }

    /// Stop dispatching, wait up to `timeout` for running items, then fail
    /// whatever never started.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownResult {
        self.shutdown.cancel();
        self.ctx.scheduler.wake();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "dispatcher task failed");
            }
        }
        let maintenance = self.maintenance.lock().take();
        if let Some(task) = maintenance {
            let _ = task.await;
        }

        let result = self.ctx.drain.initiate(timeout).await;

        let mut leftovers = self.ctx.scheduler.drain_all().await;
        for batch_id in self.ctx.tracker.batch_ids() {
            if let Ok(handle) = self.ctx.tracker.handle(&batch_id) {
                leftovers.extend(handle.take_all_parked());
            }
        }
        let abandoned = leftovers.len();
        for item in leftovers {
            let cancelled = self
                .ctx
                .tracker
                .handle(&item.batch_id)
                .map(|handle| handle.is_cancelled())
                .unwrap_or(false);
            let outcome = if cancelled {
                ItemOutcome::cancelled()
            } else {
                let _ = self.ctx.tracker.mark_fault(&item.batch_id, SHUTDOWN_REASON);
                ItemOutcome::aborted(ExtractError::infrastructure(SHUTDOWN_REASON))
            };
            let _ = self.ctx.tracker.record_result(&item.batch_id, item.id, outcome);
        }

        match &result {
            ShutdownResult::Complete => tracing::info!(abandoned, "engine shut down"),
            ShutdownResult::Timeout { remaining } => {
                tracing::warn!(abandoned, remaining, "engine shut down with items still running")
            }
        }
        result
    }
}

impl Drop for ExtractionEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.ctx.scheduler.wake();
    }
}

/// Periodic cache expiry and retention cleanup of finished batches.
fn spawn_maintenance(
    ctx: Arc<WorkerContext>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let expired = ctx.cache.cleanup();
            let removed = ctx.tracker.cleanup(retention);
            if expired > 0 || removed > 0 {
                tracing::debug!(expired, removed, "maintenance pass");
            }
        }
    })
}
