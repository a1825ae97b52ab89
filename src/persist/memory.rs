//! In-process store backed by DashMap.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::{StateStore, StoreError, StoredValue};

struct Slot {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Volatile [`StateStore`]; the default when no external store is wired.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), Slot { bytes: value, expires_at });
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(slot) if slot.is_live(now) => {
                return Ok(Some(StoredValue {
                    bytes: slot.bytes.clone(),
                    expires_in: slot.expires_at.map(|at| at - now),
                }));
            }
            Some(_) => {}
            None => return Ok(None),
        }
        // Expired; the read guard is gone by now.
        self.entries.remove_if(key, |_, slot| !slot.is_live(now));
        Ok(None)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
