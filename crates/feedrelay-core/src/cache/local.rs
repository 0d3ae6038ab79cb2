//! In-process cache: bounded LRU with per-entry TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CacheBackend, CacheEntry};
use crate::clock::epoch_ms;
use crate::EngineError;

struct StoredEntry {
    entry: CacheEntry,
    expires_at: u64,
    last_access: u64,
}

struct LocalInner {
    entries: HashMap<String, StoredEntry>,
    access_counter: u64,
}

impl LocalInner {
    fn touch(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, stored)| stored.last_access)
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

/// Bounded LRU cache with TTL semantics.
///
/// A `get` that finds an expired entry deletes it and reports a miss; a
/// `set` at capacity evicts the least recently used entry first.
pub struct LocalCache {
    inner: Mutex<LocalInner>,
    capacity: usize,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LocalInner {
                entries: HashMap::with_capacity(capacity.min(1_024)),
                access_counter: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
        let mut inner = self.inner.lock().await;
        let now = epoch_ms();

        match inner.entries.get(key).map(|stored| now >= stored.expires_at) {
            None => Ok(None),
            Some(true) => {
                inner.entries.remove(key);
                Ok(None)
            }
            Some(false) => {
                let counter = inner.touch();
                let stored = match inner.entries.get_mut(key) {
                    Some(stored) => stored,
                    None => return Ok(None),
                };
                stored.last_access = counter;
                Ok(Some(stored.entry.clone()))
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let counter = inner.touch();
        let expires_at = epoch_ms().saturating_add(ttl.as_millis().min(u128::from(u64::MAX)) as u64);

        if !inner.entries.contains_key(key) {
            while inner.entries.len() >= self.capacity {
                inner.evict_lru();
            }
        }

        inner.entries.insert(
            key.to_owned(),
            StoredEntry {
                entry,
                expires_at,
                last_access: counter,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.inner.lock().await.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(result: i64) -> CacheEntry {
        CacheEntry {
            result: json!(result),
            data: json!({ "value": result }),
            status_code: 200,
            written_at: epoch_ms(),
            max_age_ms: 60_000,
            provider_data_received: epoch_ms(),
            provider_data_stream_established: None,
            provider_indicated_time: None,
        }
    }

    #[tokio::test]
    async fn read_your_write() {
        let cache = LocalCache::new(8);
        cache
            .set("fp", entry(42), Duration::from_secs(60))
            .await
            .expect("set must succeed");

        let hit = cache.get("fp").await.expect("get must succeed");
        assert_eq!(hit.expect("must hit").result, json!(42));
    }

    #[tokio::test]
    async fn expired_get_misses_and_deletes() {
        let cache = LocalCache::new(8);
        cache
            .set("fp", entry(1), Duration::from_millis(30))
            .await
            .expect("set must succeed");

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.get("fp").await.expect("get must succeed").is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let cache = LocalCache::new(3);
        for index in 0..10 {
            cache
                .set(&format!("fp-{index}"), entry(index), Duration::from_secs(60))
                .await
                .expect("set must succeed");
            assert!(cache.len().await <= 3);
        }
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted_first() {
        let cache = LocalCache::new(2);
        cache
            .set("a", entry(1), Duration::from_secs(60))
            .await
            .expect("set must succeed");
        cache
            .set("b", entry(2), Duration::from_secs(60))
            .await
            .expect("set must succeed");

        // Touch "a" so "b" becomes the eviction candidate.
        let _ = cache.get("a").await.expect("get must succeed");

        cache
            .set("c", entry(3), Duration::from_secs(60))
            .await
            .expect("set must succeed");

        assert!(cache.get("a").await.expect("get").is_some());
        assert!(cache.get("b").await.expect("get").is_none());
        assert!(cache.get("c").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn overwriting_a_key_does_not_evict_others() {
        let cache = LocalCache::new(2);
        cache
            .set("a", entry(1), Duration::from_secs(60))
            .await
            .expect("set must succeed");
        cache
            .set("b", entry(2), Duration::from_secs(60))
            .await
            .expect("set must succeed");
        cache
            .set("a", entry(10), Duration::from_secs(60))
            .await
            .expect("set must succeed");

        assert_eq!(cache.len().await, 2);
        let hit = cache.get("a").await.expect("get").expect("must hit");
        assert_eq!(hit.result, json!(10));
    }
}
