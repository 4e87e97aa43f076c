//! In-memory cache store

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheEntry, CacheStore};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::types::Tier;

type Entries = HashMap<Fingerprint, Arc<CacheEntry>>;

/// Bounded map of entries.
///
/// When full, expired entries go first, then the entry with the fewest hits,
/// oldest first among equals.
#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: RwLock<Entries>,
    max_entries: usize,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn make_room(entries: &mut Entries, max_entries: usize) {
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));

        while entries.len() >= max_entries {
            let victim = entries
                .values()
                .min_by(|a, b| {
                    a.hit_count()
                        .cmp(&b.hit_count())
                        .then_with(|| a.created_at.cmp(&b.created_at))
                })
                .map(|entry| entry.fingerprint.clone());

            match victim {
                Some(fingerprint) => {
                    entries.remove(&fingerprint);
                }
                None => break,
            }
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(5_000)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        let now = Instant::now();
        Ok(self
            .read()
            .get(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .cloned())
    }

    async fn candidates(&self, min_tier: Tier) -> Result<Vec<Arc<CacheEntry>>, CacheError> {
        let now = Instant::now();
        Ok(self
            .read()
            .values()
            .filter(|entry| entry.tier >= min_tier && !entry.is_expired(now))
            .cloned()
            .collect())
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.write();
        if !entries.contains_key(&entry.fingerprint) && entries.len() >= self.max_entries {
            Self::make_room(&mut entries, self.max_entries);
        }
        entries.insert(entry.fingerprint.clone(), Arc::new(entry));
        Ok(())
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        Ok(self.write().remove(fingerprint).is_some())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.read().len())
    }
}
