//! Scripted extractor for tests and `extract-core simulate`.
//!
//! Requests are matched by their subject (name, query or URL). Every call
//! is counted, start order is recorded, and the concurrency high-water
//! mark is tracked so tests can assert admission-control invariants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::error::ExtractError;
use super::request::{ExtractRequest, Extracted};
use super::Extractor;

struct FailureRule {
    error: ExtractError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

/// Test double with scripted failures, delays and an optional start gate.
pub struct ScriptedExtractor {
    delay: Duration,
    rules: Mutex<HashMap<String, FailureRule>>,
    calls: AtomicUsize,
    calls_by_subject: Mutex<HashMap<String, usize>>,
    start_order: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl Default for ScriptedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            rules: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            calls_by_subject: Mutex::new(HashMap::new()),
            start_order: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls block after being counted until [`release`](Self::release) hands out permits.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Every call for `subject` fails with a permanent error.
    pub fn fail_permanently(self, subject: &str) -> Self {
        self.fail_with(subject, ExtractError::permanent(format!("{subject} not found")), None)
    }

    /// The first `times` calls for `subject` fail with a transient network error.
    pub fn fail_transiently(self, subject: &str, times: u32) -> Self {
        self.fail_with(subject, ExtractError::network(format!("{subject} connection reset")), Some(times))
    }

    pub fn fail_with(self, subject: &str, error: ExtractError, times: Option<u32>) -> Self {
        self.rules
            .lock()
            .insert(subject.to_string(), FailureRule { error, remaining: times });
        self
    }

    /// Let `n` gated calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Total extractor invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, subject: &str) -> usize {
        self.calls_by_subject.lock().get(subject).copied().unwrap_or(0)
    }

    /// Subjects in the order calls started.
    pub fn start_order(&self) -> Vec<String> {
        self.start_order.lock().clone()
    }

    /// Highest number of calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Calls currently in progress.
    pub fn in_progress(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, subject: &str) -> Option<ExtractError> {
        let mut rules = self.rules.lock();
        let rule = rules.get_mut(subject)?;
        match &mut rule.remaining {
            None => Some(rule.error.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(rule.error.clone())
            }
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn run(&self, request: &ExtractRequest) -> Result<Extracted, ExtractError> {
        let subject = request.subject().to_string();
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.calls_by_subject.lock().entry(subject.clone()).or_insert(0) += 1;
        self.start_order.lock().push(subject.clone());

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = RunningGuard(&self.running);
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(err) = self.scripted_failure(&subject) {
            return Err(err);
        }
        Ok(Extracted::new(serde_json::json!({
            "kind": request.kind(),
            "subject": subject,
            "call": call,
        })))
    }
}
