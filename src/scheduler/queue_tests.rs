//! Tests for the shared work queue.

use std::sync::Arc;

use super::*;
use crate::extractor::ExtractRequest;
use crate::scheduler::Priority;

fn small_queue() -> WorkScheduler {
    WorkScheduler::new(WorkQueueConfig { max_pending: 3 })
}

fn item(id: ItemId, batch: BatchId, priority: Priority) -> WorkItem {
    WorkItem::new(id, batch, ExtractRequest::search(format!("q{id}"), "en-us", 1), priority)
}

#[tokio::test]
async fn enqueue_returns_position() {
    let q = small_queue();
    let batch = BatchId::new();
    assert_eq!(q.enqueue(item(1, batch, Priority::Normal)).await.unwrap(), 0);
    assert_eq!(q.enqueue(item(2, batch, Priority::Normal)).await.unwrap(), 1);
    assert_eq!(q.len().await, 2);
}

#[tokio::test]
async fn queue_full_rejects_enqueue() {
    let q = small_queue();
    let batch = BatchId::new();
    for id in 0..3 {
        q.enqueue(item(id, batch, Priority::Normal)).await.unwrap();
    }
    let err = q.enqueue(item(9, batch, Priority::Normal)).await.unwrap_err();
    assert_eq!(err, QueueError::Full { pending: 3, capacity: 3 });
}

#[tokio::test]
async fn enqueue_all_is_all_or_nothing() {
    let q = small_queue();
    let batch = BatchId::new();
    q.enqueue(item(0, batch, Priority::Normal)).await.unwrap();

    let too_many = (1..4).map(|id| item(id, batch, Priority::Normal)).collect();
    assert!(q.enqueue_all(too_many).await.is_err());
    assert_eq!(q.len().await, 1);

    let fits = (1..3).map(|id| item(id, batch, Priority::Normal)).collect();
    q.enqueue_all(fits).await.unwrap();
    assert_eq!(q.len().await, 3);
}

#[tokio::test]
async fn dequeue_prefers_higher_tier_then_fifo() {
    let q = WorkScheduler::new(WorkQueueConfig::default());
    let batch = BatchId::new();
    q.enqueue(item(1, batch, Priority::Low)).await.unwrap();
    q.enqueue(item(2, batch, Priority::High)).await.unwrap();
    q.enqueue(item(3, batch, Priority::Normal)).await.unwrap();
    q.enqueue(item(4, batch, Priority::High)).await.unwrap();

    let mut order = Vec::new();
    while let Some(next) = q.dequeue().await {
        order.push(next.id);
    }
    assert_eq!(order, vec![2, 4, 3, 1]);
}

#[tokio::test]
async fn cancel_only_removes_queued_items() {
    let q = small_queue();
    let batch = BatchId::new();
    q.enqueue(item(1, batch, Priority::Normal)).await.unwrap();
    q.enqueue(item(2, batch, Priority::Normal)).await.unwrap();

    let taken = q.dequeue().await.unwrap();
    assert_eq!(taken.id, 1);
    assert!(q.cancel(1).await.is_none());
    assert_eq!(q.cancel(2).await.map(|i| i.id), Some(2));
    assert!(q.is_empty().await);
}

#[tokio::test]
async fn drain_batch_leaves_other_batches() {
    let q = WorkScheduler::new(WorkQueueConfig::default());
    let a = BatchId::new();
    let b = BatchId::new();
    q.enqueue(item(1, a, Priority::Normal)).await.unwrap();
    q.enqueue(item(2, b, Priority::Normal)).await.unwrap();
    q.enqueue(item(3, a, Priority::High)).await.unwrap();

    let drained: Vec<_> = q.drain_batch(&a).await.into_iter().map(|i| i.id).collect();
    assert_eq!(drained, vec![3, 1]);
    assert_eq!(q.queued_for(&b).await, 1);
    assert_eq!(q.queued_for(&a).await, 0);
}

#[tokio::test]
async fn requeued_item_keeps_original_position() {
    let q = WorkScheduler::new(WorkQueueConfig { max_pending: 2 });
    let batch = BatchId::new();
    q.enqueue(item(1, batch, Priority::Normal)).await.unwrap();
    q.enqueue(item(2, batch, Priority::Normal)).await.unwrap();

    let first = q.dequeue().await.unwrap();
    assert!(first.sequence().is_some());
    q.enqueue(item(3, batch, Priority::Normal)).await.unwrap();
    // Queue is at capacity, requeue still succeeds.
    q.requeue(first).await;
    assert_eq!(q.len().await, 3);

    let order: Vec<_> = [q.dequeue().await, q.dequeue().await, q.dequeue().await]
        .into_iter()
        .flatten()
        .map(|i| i.id)
        .collect();
    assert_eq!(order, vec![1, 2, 3]);
}

#[tokio::test]
async fn wait_and_dequeue_wakes_on_enqueue() {
    let q = Arc::new(WorkScheduler::new(WorkQueueConfig::default()));
    let waiter = {
        let q = Arc::clone(&q);
        tokio::spawn(async move { q.wait_and_dequeue().await.id })
    };
    tokio::task::yield_now().await;
    q.enqueue(item(7, BatchId::new(), Priority::Low)).await.unwrap();
    assert_eq!(waiter.await.unwrap(), 7);
}

#[tokio::test]
async fn concurrent_producers_lose_nothing() {
    let q = Arc::new(WorkScheduler::new(WorkQueueConfig::default()));
    let batch = BatchId::new();
    let mut producers = Vec::new();
    for p in 0..8u64 {
        let q = Arc::clone(&q);
        producers.push(tokio::spawn(async move {
            for n in 0..50u64 {
                q.enqueue(item(p * 1000 + n, batch, Priority::from((n % 4) as u8))).await.unwrap();
            }
        }));
    }
    for handle in producers {
        handle.await.unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    while let Some(next) = q.dequeue().await {
        assert!(seen.insert(next.id), "duplicate item {}", next.id);
    }
    assert_eq!(seen.len(), 400);
}
