//! Graceful drain of in-flight work items.
//!
//! Every spawned item holds a [`DrainGuard`]. Shutdown stops admission and
//! waits for the guards to drop, up to a deadline.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Drain state machine: `accepting -> draining -> stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Accepting,
    Draining,
    Stopped,
}

impl DrainState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accepting,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Result of a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    /// Items still executing when the deadline passed.
    Timeout { remaining: u32 },
}

/// Tracks in-flight items and coordinates their drain.
pub struct DrainCoordinator {
    state: AtomicU8,
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(DrainState::Accepting as u8),
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> DrainState {
        DrainState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == DrainState::Accepting
    }

    /// Track an in-flight item. Returns `None` once draining has begun.
    pub fn track(&self) -> Option<DrainGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(DrainGuard {
            counter: Arc::clone(&self.in_flight),
            notify: Arc::clone(&self.notify),
        })
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop admitting and wait up to `timeout` for in-flight items.
    pub async fn initiate(&self, timeout: Duration) -> ShutdownResult {
        self.state.store(DrainState::Draining as u8, Ordering::SeqCst);
        let result = self.wait_for_drain(timeout).await;
        self.state.store(DrainState::Stopped as u8, Ordering::SeqCst);
        result
    }

    async fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let count = self.in_flight();
            if count == 0 {
                return ShutdownResult::Complete;
            }

            let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining_time.is_zero() {
                return ShutdownResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(remaining_time) => {
                    let final_count = self.in_flight();
                    if final_count == 0 {
                        return ShutdownResult::Complete;
                    }
                    return ShutdownResult::Timeout { remaining: final_count };
                }
            }
        }
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight item.
pub struct DrainGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}
