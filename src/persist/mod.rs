//! Best-effort key/value persistence for batch and cache state.
//!
//! The engine never depends on a store for correctness: writes that fail
//! are logged and dropped, reads that fail are treated as misses.

mod memory;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryStateStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Bytes read back from a store with their remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub bytes: Vec<u8>,
    /// `None` for keys stored without a TTL.
    pub expires_in: Option<Duration>,
}

/// Minimal key/value contract. Expired keys must read as absent.
pub trait StateStore: Send + Sync {
    fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub fn put_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes, ttl)
}

/// Decoded value plus remaining TTL.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<(T, Option<Duration>)>, StoreError> {
    match store.get(key)? {
        Some(stored) => Ok(Some((serde_json::from_slice(&stored.bytes)?, stored.expires_in))),
        None => Ok(None),
    }
}

/// Persisted key layout.
pub mod keys {
    use crate::batch::BatchId;
    use crate::extractor::Fingerprint;
    use crate::scheduler::ItemId;

    pub const BATCH_PREFIX: &str = "batch:";
    pub const ITEM_PREFIX: &str = "item:";
    pub const CACHE_PREFIX: &str = "cache:";

    pub fn batch(id: &BatchId) -> String {
        format!("{BATCH_PREFIX}{id}")
    }

    pub fn item(batch: &BatchId, item: ItemId) -> String {
        format!("{ITEM_PREFIX}{batch}:{item}")
    }

    /// Prefix matching every item of one batch.
    pub fn items_of(batch: &BatchId) -> String {
        format!("{ITEM_PREFIX}{batch}:")
    }

    pub fn cache(fingerprint: &Fingerprint) -> String {
        format!("{CACHE_PREFIX}{fingerprint}")
    }
}
