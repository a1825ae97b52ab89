//! Batch registry and progress accounting.
//!
//! Counters are atomics so concurrent workers never lose updates; the
//! per-item map and the batch status each sit behind their own mutex and
//! are never held together. Each item reaches a terminal state exactly
//! once, and the worker that records the last one finalizes the batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;

use super::record::{ItemOutcome, ItemRecord, Outcome};
use super::status::{BatchStatus, ItemState};
use super::summary::{BatchResults, BatchSummary, ItemResult, StatusSnapshot};
use super::{BatchId, ItemSpec};
use crate::config::BatchOptions;
use crate::error::EngineError;
use crate::extractor::ExtractError;
use crate::persist::{self, StateStore};
use crate::scheduler::{ItemId, RateLimitConfig, RateLimiter, WorkItem};
use crate::telemetry;

/// Decision taken when the dispatcher pulls an item of this batch.
#[derive(Debug)]
pub(crate) enum Admission {
    Run(WorkItem),
    /// Held on the batch until it is resumed or cancelled.
    Parked,
    /// The batch was cancelled before the item started.
    Cancelled(WorkItem),
}

struct BatchState {
    status: BatchStatus,
    cancel_requested: bool,
    fault: Option<String>,
    parked: Vec<WorkItem>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    completed_at: Option<DateTime<Utc>>,
    wall_clock: Option<Duration>,
}

/// Shared state of one batch.
pub struct BatchHandle {
    id: BatchId,
    options: BatchOptions,
    item_ids: Vec<ItemId>,
    items: Mutex<HashMap<ItemId, ItemRecord>>,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    finished: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    state: Mutex<BatchState>,
    slots: Arc<Semaphore>,
    limiter: Option<Arc<RateLimiter>>,
    done: watch::Sender<Option<BatchStatus>>,
    created_at: DateTime<Utc>,
}

impl BatchHandle {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn total(&self) -> usize {
        self.item_ids.len()
    }

    pub fn status(&self) -> BatchStatus {
        self.state.lock().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancel_requested
    }

    /// Per-batch concurrency slots, sized `concurrency_limit`.
    pub fn slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.slots)
    }

    /// Per-batch token bucket, when the batch carries a rate limit.
    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Items executing right now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of items observed executing at once.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    /// Current state of one item, or `None` if it is not part of this batch.
    pub fn item_state(&self, item_id: ItemId) -> Option<ItemState> {
        self.items.lock().get(&item_id).map(|rec| rec.state)
    }

    pub(crate) fn admit(&self, item: WorkItem) -> Admission {
        let mut state = self.state.lock();
        if state.cancel_requested || state.status.is_terminal() {
            return Admission::Cancelled(item);
        }
        match state.status {
            BatchStatus::Paused => {
                state.parked.push(item);
                Admission::Parked
            }
            BatchStatus::Queued => {
                state.status = BatchStatus::Processing;
                state.started_at = Some(Utc::now());
                state.started = Some(Instant::now());
                Admission::Run(item)
            }
            _ => Admission::Run(item),
        }
    }

    /// Remove a parked item, if it is parked here.
    pub(crate) fn take_parked(&self, item_id: ItemId) -> Option<WorkItem> {
        let mut state = self.state.lock();
        let pos = state.parked.iter().position(|item| item.id == item_id)?;
        Some(state.parked.remove(pos))
    }

    pub(crate) fn take_all_parked(&self) -> Vec<WorkItem> {
        std::mem::take(&mut self.state.lock().parked)
    }

    /// Mark an item as executing. The returned guard keeps it counted.
    pub fn mark_running(self: &Arc<Self>, item_id: ItemId) -> RunningGuard {
        if let Some(rec) = self.items.lock().get_mut(&item_id) {
            if !rec.state.is_terminal() {
                rec.state = ItemState::Running;
                rec.started_at = Some(Utc::now());
            }
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        RunningGuard { batch: Arc::clone(self) }
    }

    fn mark_fault(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.fault.is_none() && !state.status.is_terminal() {
            state.fault = Some(reason.to_string());
        }
    }

    /// Returns the item snapshot if this call made it terminal, plus the
    /// batch status if it also finalized the batch.
    fn record(&self, item_id: ItemId, outcome: ItemOutcome) -> Result<Option<(ItemResult, Option<BatchStatus>)>, EngineError> {
        let state = outcome.outcome.state();
        let attempts = outcome.attempts;
        let elapsed = outcome.elapsed;
        // An item that ran and hit an infrastructure error faults the batch.
        let fault = match &outcome.outcome {
            Outcome::Failed(e @ ExtractError::Infrastructure { .. }) if outcome.elapsed.is_some() => Some(e.to_string()),
            _ => None,
        };
        let snapshot = {
            let mut items = self.items.lock();
            let rec = items.get_mut(&item_id).ok_or(EngineError::ItemNotFound { batch_id: self.id, item_id })?;
            if !rec.finish(outcome) {
                return Ok(None);
            }
            rec.to_result()
        };

        match state {
            ItemState::Succeeded => self.succeeded.fetch_add(1, Ordering::SeqCst),
            ItemState::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
            _ => self.cancelled.fetch_add(1, Ordering::SeqCst),
        };
        telemetry::record_item_outcome(state.as_str(), elapsed.unwrap_or_default(), attempts);
        if let Some(reason) = fault {
            self.mark_fault(&reason);
        }

        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        let finalized = if finished == self.total() { self.finalize() } else { None };
        Ok(Some((snapshot, finalized)))
    }

    fn finalize(&self) -> Option<BatchStatus> {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let cancelled = self.cancelled.load(Ordering::SeqCst);

        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        let status = if state.fault.is_some() {
            BatchStatus::Failed
        } else if state.cancel_requested {
            BatchStatus::Cancelled
        } else if succeeded == 0 && failed > 0 {
            BatchStatus::Failed
        } else if cancelled == self.total() {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };
        state.status = status;
        state.completed_at = Some(Utc::now());
        state.wall_clock = state.started.map(|at| at.elapsed());
        let wall_clock = state.wall_clock;
        drop(state);

        telemetry::record_batch_finished(status.as_str(), wall_clock);
        tracing::info!(batch_id = %self.id, status = %status, succeeded, failed, cancelled, "batch finished");
        Some(status)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let total = self.total();
        let completed = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        let finished = completed + failed + cancelled;
        let state = self.state.lock();
        StatusSnapshot {
            batch_id: self.id,
            status: state.status,
            total,
            completed,
            failed,
            cancelled,
            running: self.running.load(Ordering::SeqCst),
            remaining: total.saturating_sub(finished),
            percentage: if total == 0 { 100.0 } else { finished as f64 * 100.0 / total as f64 },
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            fault: state.fault.clone(),
        }
    }

    fn item_results(&self) -> Vec<ItemResult> {
        let items = self.items.lock();
        self.item_ids
            .iter()
            .filter_map(|id| items.get(id).map(ItemRecord::to_result))
            .collect()
    }

    fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().completed_at
    }
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle")
            .field("id", &self.id)
            .field("total", &self.total())
            .field("status", &self.status())
            .finish()
    }
}

/// Keeps an item counted as running until dropped.
pub struct RunningGuard {
    batch: Arc<BatchHandle>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.batch.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of every live batch.
pub struct BatchTracker {
    batches: DashMap<BatchId, Arc<BatchHandle>>,
    next_item_id: AtomicU64,
    store: Option<Arc<dyn StateStore>>,
    token_poll_interval: Duration,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self {
            batches: DashMap::new(),
            next_item_id: AtomicU64::new(1),
            store: None,
            token_poll_interval: Duration::from_millis(50),
        }
    }

    /// Persist batch and item snapshots to `store`, best-effort.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_token_poll_interval(mut self, interval: Duration) -> Self {
        self.token_poll_interval = interval;
        self
    }

    /// Register a batch and build its work items in submission order.
    ///
    /// Items without a priority of their own take the batch priority.
    pub fn create(&self, specs: Vec<ItemSpec>, options: BatchOptions) -> (Arc<BatchHandle>, Vec<WorkItem>) {
        let id = BatchId::new();
        let mut work = Vec::with_capacity(specs.len());
        let mut records = HashMap::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let item_id = self.next_item_id.fetch_add(1, Ordering::Relaxed);
            let priority = spec.priority.unwrap_or(options.priority);
            let item = WorkItem::new(item_id, id, spec.request, priority);
            records.insert(item_id, ItemRecord::new(item_id, index, item.request.clone(), priority, item.submitted_at));
            work.push(item);
        }

        let limiter = options.rate_limit.map(|rate| {
            Arc::new(RateLimiter::new(RateLimitConfig::per_second(rate)).with_poll_interval(self.token_poll_interval))
        });
        let (done, _) = watch::channel(None);
        let handle = Arc::new(BatchHandle {
            id,
            item_ids: work.iter().map(|item| item.id).collect(),
            items: Mutex::new(records),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            state: Mutex::new(BatchState {
                status: BatchStatus::Queued,
                cancel_requested: false,
                fault: None,
                parked: Vec::new(),
                started_at: None,
                started: None,
                completed_at: None,
                wall_clock: None,
            }),
            slots: Arc::new(Semaphore::new(options.concurrency_limit.max(1))),
            limiter,
            done,
            created_at: Utc::now(),
            options,
        });
        self.batches.insert(id, Arc::clone(&handle));

        self.persist_batch(&handle);
        for result in handle.item_results() {
            self.persist_item(&id, &result);
        }
        tracing::debug!(batch_id = %id, items = handle.total(), "batch created");
        (handle, work)
    }

    pub fn handle(&self, batch_id: &BatchId) -> Result<Arc<BatchHandle>, EngineError> {
        self.batches
            .get(batch_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::BatchNotFound(*batch_id))
    }

    /// Record a terminal outcome for an item.
    ///
    /// Returns `Ok(false)` if the item was already terminal; the first
    /// recorded outcome wins.
    pub fn record_result(&self, batch_id: &BatchId, item_id: ItemId, outcome: ItemOutcome) -> Result<bool, EngineError> {
        let handle = self.handle(batch_id)?;
        let Some((item, finalized)) = handle.record(item_id, outcome)? else {
            return Ok(false);
        };
        self.persist_item(batch_id, &item);
        if let Some(status) = finalized {
            self.persist_batch(&handle);
            // Waiters wake only once the final state is persisted.
            handle.done.send_replace(Some(status));
        }
        Ok(true)
    }

    pub fn get_status(&self, batch_id: &BatchId) -> Result<StatusSnapshot, EngineError> {
        Ok(self.handle(batch_id)?.snapshot())
    }

    /// Per-item detail and summary. Fails with `NotTerminal` while running.
    pub fn get_results(&self, batch_id: &BatchId) -> Result<BatchResults, EngineError> {
        let handle = self.handle(batch_id)?;
        let (status, fault, wall_clock) = {
            let state = handle.state.lock();
            (state.status, state.fault.clone(), state.wall_clock)
        };
        if !status.is_terminal() {
            return Err(EngineError::NotTerminal { batch_id: *batch_id, status });
        }
        let items = handle.item_results();
        let summary = BatchSummary::from_items(&items, fault, wall_clock);
        Ok(BatchResults { batch_id: *batch_id, status, items, summary })
    }

    /// Request cooperative cancellation.
    ///
    /// Returns whether this call cancelled the batch, plus any items that
    /// were parked on it. Running items are left to finish.
    pub fn cancel(&self, batch_id: &BatchId) -> Result<(bool, Vec<WorkItem>), EngineError> {
        let handle = self.handle(batch_id)?;
        let mut state = handle.state.lock();
        if state.status.is_terminal() || state.cancel_requested {
            return Ok((false, Vec::new()));
        }
        state.cancel_requested = true;
        let parked = std::mem::take(&mut state.parked);
        tracing::info!(batch_id = %batch_id, parked = parked.len(), "batch cancellation requested");
        Ok((true, parked))
    }

    /// `processing -> paused`. Items dequeued while paused are parked.
    pub fn pause(&self, batch_id: &BatchId) -> Result<(), EngineError> {
        let handle = self.handle(batch_id)?;
        let mut state = handle.state.lock();
        if state.cancel_requested || !state.status.can_transition_to(BatchStatus::Paused) {
            return Err(EngineError::InvalidTransition {
                batch_id: *batch_id,
                from: state.status,
                to: BatchStatus::Paused,
            });
        }
        state.status = BatchStatus::Paused;
        drop(state);
        tracing::info!(batch_id = %batch_id, "batch paused");
        self.persist_batch(&handle);
        Ok(())
    }

    /// `paused -> processing`. Returns parked items in the order they were parked.
    pub fn resume(&self, batch_id: &BatchId) -> Result<Vec<WorkItem>, EngineError> {
        let handle = self.handle(batch_id)?;
        let mut state = handle.state.lock();
        if state.status != BatchStatus::Paused {
            return Err(EngineError::InvalidTransition {
                batch_id: *batch_id,
                from: state.status,
                to: BatchStatus::Processing,
            });
        }
        state.status = BatchStatus::Processing;
        let parked = std::mem::take(&mut state.parked);
        drop(state);
        tracing::info!(batch_id = %batch_id, requeued = parked.len(), "batch resumed");
        self.persist_batch(&handle);
        Ok(parked)
    }

    /// Flag an infrastructure fault; the batch will end `failed`.
    pub fn mark_fault(&self, batch_id: &BatchId, reason: &str) -> Result<(), EngineError> {
        let handle = self.handle(batch_id)?;
        handle.mark_fault(reason);
        tracing::error!(batch_id = %batch_id, reason, "batch fault");
        Ok(())
    }

    /// Resolve once the batch reaches a terminal status.
    pub async fn wait(&self, batch_id: &BatchId) -> Result<BatchStatus, EngineError> {
        let handle = self.handle(batch_id)?;
        let mut rx = handle.done.subscribe();
        let status = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::BatchNotFound(*batch_id))?;
        Ok(status.unwrap_or(BatchStatus::Failed))
    }

    /// Drop a terminal batch and its persisted state.
    pub fn remove(&self, batch_id: &BatchId) -> Result<(), EngineError> {
        let handle = self.handle(batch_id)?;
        let status = handle.status();
        if !status.is_terminal() {
            return Err(EngineError::NotTerminal { batch_id: *batch_id, status });
        }
        self.batches.remove(batch_id);
        self.forget_persisted(batch_id);
        Ok(())
    }

    /// Drop a batch whose items never reached the queue.
    pub(crate) fn discard(&self, batch_id: &BatchId) {
        if self.batches.remove(batch_id).is_some() {
            self.forget_persisted(batch_id);
        }
    }

    /// Remove terminal batches finished more than `retention` ago.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let expired: Vec<BatchId> = self
            .batches
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .completed_at()
                    .is_some_and(|at| now.signed_duration_since(at) >= retention)
            })
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.batches.remove(id);
            self.forget_persisted(id);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "expired batches removed");
        }
        expired.len()
    }

    /// Ids of every tracked batch.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.batches.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn persist_batch(&self, handle: &BatchHandle) {
        let Some(store) = &self.store else { return };
        if let Err(e) = persist::put_json(store.as_ref(), &persist::keys::batch(&handle.id), &handle.snapshot(), None) {
            tracing::warn!(batch_id = %handle.id, error = %e, "failed to persist batch");
        }
    }

    fn persist_item(&self, batch_id: &BatchId, item: &ItemResult) {
        let Some(store) = &self.store else { return };
        if let Err(e) = persist::put_json(store.as_ref(), &persist::keys::item(batch_id, item.item_id), item, None) {
            tracing::warn!(batch_id = %batch_id, item_id = item.item_id, error = %e, "failed to persist item");
        }
    }

    fn forget_persisted(&self, batch_id: &BatchId) {
        let Some(store) = &self.store else { return };
        let result = store.keys(&persist::keys::items_of(batch_id)).and_then(|keys| {
            for key in keys {
                store.delete(&key)?;
            }
            store.delete(&persist::keys::batch(batch_id)).map(|_| ())
        });
        if let Err(e) = result {
            tracing::warn!(batch_id = %batch_id, error = %e, "failed to remove persisted batch");
        }
    }
}

impl Default for BatchTracker {
    fn default() -> Self {
        Self::new()
    }
}
