//! Work scheduling for extraction batches.
//!
//! Holds the shared priority queue, token-bucket rate limiting, retry
//! policy, the single-flight result cache and the worker pool that ties
//! them together.

mod dedup;
mod item;
mod priority;
mod queue;
mod rate_limit;
mod retry;
pub mod worker;

pub use dedup::{CacheConfig, CacheSource, CacheStore, Computation};
pub use item::{ItemId, WorkItem};
pub use priority::{PrioritizedItem, Priority, PriorityQueue};
pub use queue::{QueueError, WorkQueueConfig, WorkScheduler};
pub use rate_limit::{RateLimitConfig, RateLimitState, RateLimitTimeout, RateLimiter};
pub use retry::RetryPolicy;
pub use worker::{spawn_pool, WorkerContext, WorkerPoolConfig};
