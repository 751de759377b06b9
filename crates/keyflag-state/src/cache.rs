//! Value cache: fast key → serving record lookup.
//!
//! The cache mirrors the canonical serving record of each key (an active
//! value or a tombstone). It is a read accelerator only: the key store
//! stays authoritative and a miss is a normal outcome.

use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::debug;

use keyflag_core::KeyRecord;

use crate::error::CacheError;

/// Cache collaborator consulted by the lifecycle engine.
pub trait ValueCache: Send + Sync {
    /// Store `record` as the serving value of `record.key`.
    ///
    /// Entries only move forward by record id: a record older than the one
    /// already cached for the key is dropped.
    fn set(&self, record: &KeyRecord) -> Result<(), CacheError>;

    /// Serving record of `key`; `Ok(None)` on a miss.
    fn get(&self, key: &str) -> Result<Option<KeyRecord>, CacheError>;

    /// Every cached record whose key starts with `prefix`.
    fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyRecord>, CacheError>;

    /// Remove `key`'s entry. Removing an absent key is not an error.
    fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process cache over an ordered map, so prefix reads are range scans.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, KeyRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ValueCache for MemoryCache {
    fn set(&self, record: &KeyRecord) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        if let Some(cached) = entries.get(&record.key).filter(|c| c.id > record.id) {
            debug!(
                key = %record.key,
                record_id = record.id,
                cached_id = cached.id,
                "stale cache write dropped"
            );
            return Ok(());
        }
        entries.insert(record.key.clone(), record.clone());
        debug!(key = %record.key, record_id = record.id, "cache set");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<KeyRecord>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyRecord>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        if entries.remove(key).is_some() {
            debug!(%key, "cache invalidated");
        }
        Ok(())
    }
}
