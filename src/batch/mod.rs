//! Batch lifecycle: records, progress accounting and final summaries.

mod record;
mod status;
mod summary;
mod tracker;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extractor::ExtractRequest;
use crate::scheduler::Priority;

pub use record::{ItemOutcome, Outcome};
pub use status::{BatchStatus, ItemState};
pub use summary::{BatchResults, BatchSummary, ItemResult, StatusSnapshot, TimingStats};
pub use tracker::{BatchHandle, BatchTracker, RunningGuard};
pub(crate) use tracker::Admission;

/// Batch identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// One item of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub request: ExtractRequest,
    /// Overrides the batch priority for this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl ItemSpec {
    pub fn new(request: ExtractRequest) -> Self {
        Self { request, priority: None }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl From<ExtractRequest> for ItemSpec {
    fn from(request: ExtractRequest) -> Self {
        Self::new(request)
    }
}
