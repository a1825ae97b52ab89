//! Shared work queue feeding the worker pool.

use tokio::sync::{Mutex, Notify};

use super::item::{ItemId, WorkItem};
use super::priority::PriorityQueue;
use crate::batch::BatchId;
use crate::telemetry;

/// Configuration for the work queue.
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Maximum items waiting in the queue across all batches.
    pub max_pending: usize,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self { max_pending: 10_000 }
    }
}

/// Thread-safe priority scheduler shared by every batch.
///
/// Cross-tier ordering favours the higher tier even across batches;
/// inside a tier items leave in submission order.
pub struct WorkScheduler {
    queue: Mutex<PriorityQueue<WorkItem>>,
    config: WorkQueueConfig,
    /// Notifies the dispatcher when new items are enqueued.
    notify: Notify,
}

impl WorkScheduler {
    pub fn new(config: WorkQueueConfig) -> Self {
        Self {
            queue: Mutex::new(PriorityQueue::new()),
            config,
            notify: Notify::new(),
        }
    }

    /// Enqueue a single item. Returns its queue position.
    pub async fn enqueue(&self, item: WorkItem) -> Result<usize, QueueError> {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.config.max_pending {
            return Err(QueueError::Full { pending: queue.len(), capacity: self.config.max_pending });
        }
        let position = queue.len();
        push_new(&mut queue, item);
        let depth = queue.len();
        drop(queue);

        telemetry::record_queue_depth(depth);
        self.notify.notify_one();
        Ok(position)
    }

    /// Enqueue all items of a batch under one lock, or none of them.
    pub async fn enqueue_all(&self, items: Vec<WorkItem>) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut queue = self.queue.lock().await;
        if queue.len() + items.len() > self.config.max_pending {
            return Err(QueueError::Full { pending: queue.len(), capacity: self.config.max_pending });
        }
        for item in items {
            push_new(&mut queue, item);
        }
        let depth = queue.len();
        drop(queue);

        telemetry::record_queue_depth(depth);
        self.notify.notify_one();
        Ok(())
    }

    /// Put back an item that was dequeued but not started.
    ///
    /// Bypasses the capacity check: the item was already admitted once.
    pub async fn requeue(&self, item: WorkItem) {
        let mut queue = self.queue.lock().await;
        match item.sequence {
            Some(sequence) => {
                let priority = item.priority;
                queue.push_with_sequence(item, priority, sequence);
            }
            None => push_new(&mut queue, item),
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Re-queue several items, preserving their original order.
    pub async fn requeue_all(&self, items: Vec<WorkItem>) {
        for item in items {
            self.requeue(item).await;
        }
    }

    /// Dequeue the oldest item of the highest non-empty tier.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        let mut queue = self.queue.lock().await;
        let entry = queue.pop_entry()?;
        let depth = queue.len();
        drop(queue);

        telemetry::record_queue_depth(depth);
        let mut item = entry.item;
        item.sequence = Some(entry.sequence);
        Some(item)
    }

    /// Wait for a notification then dequeue.
    pub async fn wait_and_dequeue(&self) -> WorkItem {
        loop {
            if let Some(item) = self.dequeue().await {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Remove a queued item. Returns `None` if it was already dequeued.
    pub async fn cancel(&self, item_id: ItemId) -> Option<WorkItem> {
        let mut queue = self.queue.lock().await;
        let removed = queue.remove_where(|item| item.id == item_id);
        removed.into_iter().next().map(|entry| with_sequence(entry.item, entry.sequence))
    }

    /// Remove every queued item of a batch, in dequeue order.
    pub async fn drain_batch(&self, batch_id: &BatchId) -> Vec<WorkItem> {
        let mut queue = self.queue.lock().await;
        queue
            .remove_where(|item| item.batch_id == *batch_id)
            .into_iter()
            .map(|entry| with_sequence(entry.item, entry.sequence))
            .collect()
    }

    /// Remove everything still queued (used on shutdown).
    pub async fn drain_all(&self) -> Vec<WorkItem> {
        let mut queue = self.queue.lock().await;
        queue
            .remove_where(|_| true)
            .into_iter()
            .map(|entry| with_sequence(entry.item, entry.sequence))
            .collect()
    }

    /// Number of queued items belonging to a batch.
    pub async fn queued_for(&self, batch_id: &BatchId) -> usize {
        self.queue.lock().await.iter().filter(|item| item.batch_id == *batch_id).count()
    }

    /// Wake the dispatcher (used during shutdown).
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

fn push_new(queue: &mut PriorityQueue<WorkItem>, item: WorkItem) {
    let priority = item.priority;
    queue.push(item, priority);
}

fn with_sequence(mut item: WorkItem, sequence: u64) -> WorkItem {
    item.sequence = Some(sequence);
    item
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    Full { pending: usize, capacity: usize },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full { pending, capacity } => {
                write!(f, "work queue is full ({pending} pending, capacity {capacity})")
            }
        }
    }
}

impl std::error::Error for QueueError {}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
