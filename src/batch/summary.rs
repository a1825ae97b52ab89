//! Status snapshots, per-item results and aggregate summaries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{BatchStatus, ItemState};
use super::BatchId;
use crate::extractor::{ExtractError, ExtractRequest, Extracted};
use crate::scheduler::{CacheSource, ItemId, Priority};

/// Live progress of a batch. Counts are best-effort while running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    /// Items that succeeded.
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
    pub remaining: usize,
    /// Share of items in a terminal state, `0.0..=100.0`.
    pub percentage: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

/// Final detail for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: ItemId,
    /// Position in the submitted batch.
    pub index: usize,
    pub request: ExtractRequest,
    pub priority: Priority,
    pub state: ItemState,
    pub attempts: u32,
    pub source: Option<CacheSource>,
    pub result: Option<Arc<Extracted>>,
    pub error: Option<ExtractError>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
}

/// Latency distribution over items that actually ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub samples: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    /// From the first item starting to the batch reaching a terminal state.
    pub wall_clock_ms: Option<u64>,
}

impl TimingStats {
    pub fn from_latencies(latencies: &[Duration], wall_clock: Option<Duration>) -> Self {
        let wall_clock_ms = wall_clock.map(|d| d.as_millis() as u64);
        if latencies.is_empty() {
            return Self { wall_clock_ms, ..Self::default() };
        }
        let mut ms: Vec<u64> = latencies.iter().map(|d| d.as_millis() as u64).collect();
        ms.sort_unstable();
        let sum: u64 = ms.iter().sum();
        Self {
            samples: ms.len(),
            min_ms: ms[0],
            max_ms: ms[ms.len() - 1],
            mean_ms: sum as f64 / ms.len() as f64,
            p50_ms: nearest_rank(&ms, 50.0),
            p95_ms: nearest_rank(&ms, 95.0),
            wall_clock_ms,
        }
    }
}

/// Nearest-rank percentile over sorted, non-empty samples.
fn nearest_rank(sorted: &[u64], pct: f64) -> u64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Aggregate statistics for a terminal batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Ids of failed items in submission order.
    pub failed_items: Vec<ItemId>,
    pub cache_hits: usize,
    pub cache_joins: usize,
    pub total_attempts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    pub timing: TimingStats,
}

impl BatchSummary {
    /// `items` must be in submission order.
    pub fn from_items(items: &[ItemResult], fault: Option<String>, wall_clock: Option<Duration>) -> Self {
        let count = |state: ItemState| items.iter().filter(|i| i.state == state).count();
        let latencies: Vec<Duration> = items
            .iter()
            .filter_map(|i| i.latency_ms.map(Duration::from_millis))
            .collect();
        Self {
            total: items.len(),
            succeeded: count(ItemState::Succeeded),
            failed: count(ItemState::Failed),
            cancelled: count(ItemState::Cancelled),
            failed_items: items
                .iter()
                .filter(|i| i.state == ItemState::Failed)
                .map(|i| i.item_id)
                .collect(),
            cache_hits: items.iter().filter(|i| i.source == Some(CacheSource::Hit)).count(),
            cache_joins: items.iter().filter(|i| i.source == Some(CacheSource::Joined)).count(),
            total_attempts: items.iter().map(|i| u64::from(i.attempts)).sum(),
            fault,
            timing: TimingStats::from_latencies(&latencies, wall_clock),
        }
    }
}

/// Per-item outcomes plus the aggregate summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResults {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub items: Vec<ItemResult>,
    pub summary: BatchSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn nearest_rank_percentiles() {
        let stats = TimingStats::from_latencies(&ms(&[50, 10, 40, 20, 30]), Some(Duration::from_millis(75)));
        assert_eq!(stats.samples, 5);
        assert_eq!(stats.min_ms, 10);
        assert_eq!(stats.max_ms, 50);
        assert_eq!(stats.mean_ms, 30.0);
        assert_eq!(stats.p50_ms, 30);
        assert_eq!(stats.p95_ms, 50);
        assert_eq!(stats.wall_clock_ms, Some(75));
    }

    #[test]
    fn empty_latencies_are_zeroed() {
        let stats = TimingStats::from_latencies(&[], None);
        assert_eq!(stats, TimingStats::default());
    }

    #[test]
    fn single_sample() {
        let stats = TimingStats::from_latencies(&ms(&[7]), None);
        assert_eq!((stats.p50_ms, stats.p95_ms), (7, 7));
    }
}
