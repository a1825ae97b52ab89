//! Per-item bookkeeping owned by the tracker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::status::ItemState;
use super::summary::ItemResult;
use crate::extractor::{ExtractError, ExtractRequest, Extracted};
use crate::scheduler::{CacheSource, ItemId, Priority};

/// Terminal result of a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(Arc<Extracted>),
    Failed(ExtractError),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> ItemState {
        match self {
            Self::Succeeded(_) => ItemState::Succeeded,
            Self::Failed(_) => ItemState::Failed,
            Self::Cancelled => ItemState::Cancelled,
        }
    }
}

/// What a worker reports back when an item finishes.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub outcome: Outcome,
    /// Extractor attempts made by this item. Zero for cache hits, joins
    /// and items cancelled before start.
    pub attempts: u32,
    pub source: Option<CacheSource>,
    /// Time from start to completion; `None` if the item never started.
    pub elapsed: Option<Duration>,
}

impl ItemOutcome {
    pub fn cancelled() -> Self {
        Self { outcome: Outcome::Cancelled, attempts: 0, source: None, elapsed: None }
    }

    /// Failure recorded without the item ever running.
    pub fn aborted(error: ExtractError) -> Self {
        Self { outcome: Outcome::Failed(error), attempts: 0, source: None, elapsed: None }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ItemRecord {
    pub id: ItemId,
    pub index: usize,
    pub request: ExtractRequest,
    pub priority: Priority,
    pub state: ItemState,
    pub attempts: u32,
    pub result: Option<Arc<Extracted>>,
    pub error: Option<ExtractError>,
    pub source: Option<CacheSource>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed: Option<Duration>,
}

impl ItemRecord {
    pub fn new(id: ItemId, index: usize, request: ExtractRequest, priority: Priority, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            index,
            request,
            priority,
            state: ItemState::Queued,
            attempts: 0,
            result: None,
            error: None,
            source: None,
            submitted_at,
            started_at: None,
            finished_at: None,
            elapsed: None,
        }
    }

    /// Apply a terminal outcome. Returns `false` if already terminal.
    pub fn finish(&mut self, outcome: ItemOutcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = outcome.outcome.state();
        self.attempts = outcome.attempts;
        self.source = outcome.source;
        self.elapsed = outcome.elapsed;
        self.finished_at = Some(Utc::now());
        match outcome.outcome {
            Outcome::Succeeded(value) => self.result = Some(value),
            Outcome::Failed(error) => self.error = Some(error),
            Outcome::Cancelled => {}
        }
        true
    }

    pub fn to_result(&self) -> ItemResult {
        ItemResult {
            item_id: self.id,
            index: self.index,
            request: self.request.clone(),
            priority: self.priority,
            state: self.state,
            attempts: self.attempts,
            source: self.source,
            result: self.result.clone(),
            error: self.error.clone(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            latency_ms: self.elapsed.map(|d| d.as_millis() as u64),
        }
    }
}
