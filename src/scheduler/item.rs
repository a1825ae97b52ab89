//! Schedulable unit of extraction work.

use chrono::{DateTime, Utc};

use super::priority::Priority;
use crate::batch::BatchId;
use crate::extractor::ExtractRequest;

/// Process-unique work item identifier.
pub type ItemId = u64;

/// A work item as it travels through the scheduler.
///
/// State, attempts and outcome are owned by the batch tracker; this is
/// only what a worker needs to execute the item.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: ItemId,
    pub batch_id: BatchId,
    pub request: ExtractRequest,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    /// Queue sequence, assigned on first enqueue and kept on re-queue.
    pub(crate) sequence: Option<u64>,
}

impl WorkItem {
    pub fn new(id: ItemId, batch_id: BatchId, request: ExtractRequest, priority: Priority) -> Self {
        Self {
            id,
            batch_id,
            request,
            priority,
            submitted_at: Utc::now(),
            sequence: None,
        }
    }

    /// Sequence assigned when the item first entered the queue.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }
}
