//! L1: bounded in-process LRU.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::{CacheEntry, CacheResult, CacheTier};

#[derive(Default)]
struct Lru {
    entries: HashMap<String, (CacheEntry, u64)>,
    /// Access tick -> key, oldest first.
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl Lru {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, last)) = self.entries.get_mut(key) {
            self.order.remove(last);
            *last = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, tick)) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }
}

pub struct MemoryTier {
    name: String,
    capacity: usize,
    inner: Mutex<Lru>,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self::named("memory", capacity)
    }

    pub fn named(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(Lru::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lru> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let mut lru = self.lock();
        lru.touch(key);
        Ok(lru.entries.get(key).map(|(entry, _)| entry.clone()))
    }

    async fn put(&self, entry: &CacheEntry) -> CacheResult<()> {
        let mut lru = self.lock();
        lru.remove(&entry.key);
        while lru.entries.len() >= self.capacity {
            let Some((_, oldest)) = lru.order.pop_first() else {
                break;
            };
            lru.entries.remove(&oldest);
        }
        lru.tick += 1;
        let tick = lru.tick;
        lru.order.insert(tick, entry.key.clone());
        lru.entries.insert(entry.key.clone(), (entry.clone(), tick));
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        Ok(self.lock().remove(key))
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.lock().entries.keys().cloned().collect())
    }

    async fn purge_expired(&self) -> CacheResult<usize> {
        let now = Utc::now().timestamp_millis();
        let mut lru = self.lock();
        let expired: Vec<String> = lru
            .entries
            .iter()
            .filter(|(_, (entry, _))| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            lru.remove(key);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::response::ExecutionResponse;

    fn entry(key: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(key, ExecutionResponse::new(), ttl)
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let tier = MemoryTier::new(2);
        tier.put(&entry("a", Duration::from_secs(60))).await.unwrap();
        tier.put(&entry("b", Duration::from_secs(60))).await.unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(tier.get("a").await.unwrap().is_some());
        tier.put(&entry("c", Duration::from_secs(60))).await.unwrap();

        assert_eq!(tier.len(), 2);
        assert!(tier.get("b").await.unwrap().is_none());
        assert!(tier.get("a").await.unwrap().is_some());
        assert!(tier.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let tier = MemoryTier::new(2);
        tier.put(&entry("a", Duration::from_secs(60))).await.unwrap();
        tier.put(&entry("b", Duration::from_secs(60))).await.unwrap();
        tier.put(&entry("a", Duration::from_secs(60))).await.unwrap();
        assert_eq!(tier.len(), 2);
        assert!(tier.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let tier = MemoryTier::new(4);
        tier.put(&entry("old", Duration::ZERO)).await.unwrap();
        tier.put(&entry("new", Duration::from_secs(60))).await.unwrap();
        assert_eq!(tier.purge_expired().await.unwrap(), 1);
        let keys = tier.keys().await.unwrap();
        assert_eq!(keys, vec!["new".to_string()]);
        assert!(tier.remove("new").await.unwrap());
        assert!(tier.is_empty());
    }
}
