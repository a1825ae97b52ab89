//! Tests for the shared work queue and retry policy.

use std::time::Duration;

use extract_core::batch::BatchId;
use extract_core::extractor::{ExtractError, ExtractRequest, ExtractionMode};
use extract_core::scheduler::{Priority, PriorityQueue, QueueError, RetryPolicy, WorkItem, WorkQueueConfig, WorkScheduler};

fn item(id: u64, batch_id: BatchId, priority: Priority) -> WorkItem {
    WorkItem::new(id, batch_id, ExtractRequest::company(format!("c{id}"), ExtractionMode::Basic), priority)
}

#[test]
fn priority_queue_orders_by_priority() {
    let mut queue: PriorityQueue<&str> = PriorityQueue::new();

    queue.push("low", Priority::Low);
    queue.push("urgent", Priority::Urgent);
    queue.push("normal", Priority::Normal);

    assert_eq!(queue.pop(), Some("urgent"));
    assert_eq!(queue.pop(), Some("normal"));
    assert_eq!(queue.pop(), Some("low"));
}

#[test]
fn priority_queue_fifo_within_same_priority() {
    let mut queue: PriorityQueue<&str> = PriorityQueue::new();

    queue.push("first", Priority::Normal);
    queue.push("second", Priority::Normal);
    queue.push("third", Priority::Normal);

    assert_eq!(queue.pop(), Some("first"));
    assert_eq!(queue.pop(), Some("second"));
    assert_eq!(queue.pop(), Some("third"));
}

#[test]
fn priority_parses_from_names_and_numbers() {
    assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
    assert_eq!(Priority::from(0u8), Priority::Low);
    assert!("sometime".parse::<Priority>().is_err());
}

#[tokio::test]
async fn scheduler_interleaves_batches_by_tier() {
    let scheduler = WorkScheduler::new(WorkQueueConfig::default());
    let a = BatchId::new();
    let b = BatchId::new();

    scheduler.enqueue_all(vec![item(1, a, Priority::Normal), item(2, a, Priority::Normal)]).await.unwrap();
    scheduler.enqueue_all(vec![item(3, b, Priority::High), item(4, b, Priority::Low)]).await.unwrap();

    let mut order = Vec::new();
    while let Some(next) = scheduler.dequeue().await {
        order.push(next.id);
    }
    assert_eq!(order, vec![3, 1, 2, 4]);
}

#[tokio::test]
async fn scheduler_rejects_overflow_without_partial_enqueue() {
    let scheduler = WorkScheduler::new(WorkQueueConfig { max_pending: 3 });
    let batch = BatchId::new();
    scheduler.enqueue(item(1, batch, Priority::Normal)).await.unwrap();

    let err = scheduler
        .enqueue_all((2..=4).map(|id| item(id, batch, Priority::Normal)).collect())
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::Full { pending: 1, capacity: 3 });
    assert_eq!(scheduler.len().await, 1);
}

#[tokio::test]
async fn drained_batch_leaves_other_batches_queued() {
    let scheduler = WorkScheduler::new(WorkQueueConfig::default());
    let keep = BatchId::new();
    let drop = BatchId::new();
    scheduler
        .enqueue_all(vec![item(1, keep, Priority::Normal), item(2, drop, Priority::Normal), item(3, drop, Priority::High)])
        .await
        .unwrap();

    let drained = scheduler.drain_batch(&drop).await;
    assert_eq!(drained.iter().map(|i| i.id).collect::<Vec<_>>(), vec![3, 2]);
    assert_eq!(scheduler.queued_for(&keep).await, 1);
    assert_eq!(scheduler.queued_for(&drop).await, 0);
}

#[test]
fn retry_policy_backs_off_exponentially_up_to_cap() {
    let policy = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_delay: Duration::from_millis(350),
        jitter: 0.0,
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    assert_eq!(policy.delay_for(10), Duration::from_millis(350));
}

#[test]
fn retry_policy_only_retries_transient_errors() {
    let policy = RetryPolicy::default();
    assert!(policy.should_retry(1, &ExtractError::timeout("slow")));
    assert!(policy.should_retry(2, &ExtractError::network("reset")));
    assert!(!policy.should_retry(3, &ExtractError::network("reset")));
    assert!(!policy.should_retry(1, &ExtractError::permanent("not found")));
    assert!(!policy.should_retry(1, &ExtractError::validation("empty")));
    assert!(!policy.should_retry(1, &ExtractError::infrastructure("panic")));
}
