//! Result cache with single-flight deduplication.
//!
//! Successful extractions are cached per request fingerprint for a TTL.
//! While a computation for a fingerprint is running, every other caller
//! for that fingerprint awaits the same future instead of issuing its own
//! extractor call.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::extractor::{ExtractError, Extracted, Fingerprint};
use crate::persist::{self, StateStore};
use crate::telemetry;

/// Work handed to [`CacheStore::get_or_compute`] on a miss.
pub type Computation = BoxFuture<'static, Result<Extracted, ExtractError>>;

type SharedComputation = Shared<BoxFuture<'static, Result<Arc<Extracted>, ExtractError>>>;

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Served from a live cache entry.
    Hit,
    /// This caller ran the computation.
    Computed,
    /// Awaited a computation started by another caller.
    Joined,
}

impl CacheSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Computed => "computed",
            Self::Joined => "joined",
        }
    }
}

/// Configuration for the result cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

struct CacheEntry {
    value: Arc<Extracted>,
    cached_at: Instant,
    expires_at: Instant,
}

struct Inner {
    entries: DashMap<Fingerprint, CacheEntry>,
    in_flight: Mutex<HashMap<Fingerprint, SharedComputation>>,
    config: CacheConfig,
    store: Option<Arc<dyn StateStore>>,
}

/// Shared handle to the result cache. Clones refer to the same cache.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Cache that reads through and writes through to `store`.
    pub fn with_store(config: CacheConfig, store: Arc<dyn StateStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: CacheConfig, store: Option<Arc<dyn StateStore>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::with_capacity(config.max_entries.min(1024)),
                in_flight: Mutex::new(HashMap::new()),
                config,
                store,
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.config.default_ttl
    }

    /// Live value for `key`, if any. Never returns an expired entry.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<Extracted>> {
        if let Some(value) = self.lookup_local(key) {
            return Some(value);
        }
        self.read_through(key)
    }

    /// Store a value for `ttl`. A zero TTL stores nothing.
    pub fn set(&self, key: Fingerprint, value: Arc<Extracted>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if let Some(store) = &self.inner.store {
            if let Err(e) = persist::put_json(store.as_ref(), &persist::keys::cache(&key), value.as_ref(), Some(ttl)) {
                tracing::warn!(fingerprint = %key, error = %e, "cache write-through failed");
            }
        }
        self.insert_local(key, value, ttl);
    }

    /// Serve from cache, join an in-flight computation, or start one.
    ///
    /// `compute` is only called when this caller becomes the owner. The
    /// result is cached only on success, and published to the cache
    /// before any waiter observes it.
    pub async fn get_or_compute<F>(
        &self,
        key: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> (CacheSource, Result<Arc<Extracted>, ExtractError>)
    where
        F: FnOnce() -> Computation,
    {
        if let Some(value) = self.get(key) {
            telemetry::record_cache_lookup(CacheSource::Hit);
            return (CacheSource::Hit, Ok(value));
        }

        let (source, shared) = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(existing) = in_flight.get(key) {
                (CacheSource::Joined, existing.clone())
            } else {
                // The previous owner publishes before leaving the map.
                if let Some(value) = self.lookup_local(key) {
                    drop(in_flight);
                    telemetry::record_cache_lookup(CacheSource::Hit);
                    return (CacheSource::Hit, Ok(value));
                }
                let shared = self.owned_computation(key.clone(), ttl, compute());
                in_flight.insert(key.clone(), shared.clone());
                (CacheSource::Computed, shared)
            }
        };

        telemetry::record_cache_lookup(source);
        (source, shared.await)
    }

    fn owned_computation(&self, key: Fingerprint, ttl: Duration, work: Computation) -> SharedComputation {
        let cache = self.clone();
        async move {
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result.map(Arc::new),
                Err(_) => Err(ExtractError::infrastructure("extractor panicked")),
            };
            if let Ok(value) = &result {
                cache.set(key.clone(), Arc::clone(value), ttl);
            }
            cache.inner.in_flight.lock().remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// Drop a key locally and from the backing store.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        let removed = self.inner.entries.remove(key).is_some();
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.delete(&persist::keys::cache(key)) {
                tracing::warn!(fingerprint = %key, error = %e, "cache invalidate failed");
            }
        }
        removed
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.inner.entries.len())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Computations currently running.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    fn lookup_local(&self, key: &Fingerprint) -> Option<Arc<Extracted>> {
        let now = Instant::now();
        match self.inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(Arc::clone(&entry.value)),
            Some(_) => {}
            None => return None,
        }
        self.inner.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    fn read_through(&self, key: &Fingerprint) -> Option<Arc<Extracted>> {
        let store = self.inner.store.as_ref()?;
        match persist::get_json::<Extracted>(store.as_ref(), &persist::keys::cache(key)) {
            Ok(Some((value, Some(remaining)))) if !remaining.is_zero() => {
                let value = Arc::new(value);
                self.insert_local(key.clone(), Arc::clone(&value), remaining);
                Some(value)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(fingerprint = %key, error = %e, "cache read-through failed");
                None
            }
        }
    }

    fn insert_local(&self, key: Fingerprint, value: Arc<Extracted>, ttl: Duration) {
        if !self.inner.entries.contains_key(&key) && self.inner.entries.len() >= self.inner.config.max_entries {
            self.evict();
        }
        let now = Instant::now();
        self.inner.entries.insert(key, CacheEntry { value, cached_at: now, expires_at: now + ttl });
    }

    /// Expired entries go first, then the oldest live one.
    fn evict(&self) {
        if self.cleanup() > 0 {
            return;
        }
        let oldest = self
            .inner
            .entries
            .iter()
            .min_by_key(|entry| entry.value().cached_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.inner.entries.remove(&key);
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("in_flight", &self.in_flight_count())
            .field("persistent", &self.inner.store.is_some())
            .finish()
    }
}
