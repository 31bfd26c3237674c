use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use super::KeyValueCache;
use crate::errors::AppError;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// LRU cache with per-entry TTL. Expired entries are dropped lazily on read.
pub struct InMemoryCache {
    store: Mutex<LruCache<String, CacheEntry>>,
}

impl InMemoryCache {
    const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
        Some(n) => n,
        None => unreachable!(),
    };

    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(Self::DEFAULT_CAPACITY);
        Self { store: Mutex::new(LruCache::new(capacity)) }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY.get())
    }
}

#[async_trait]
impl KeyValueCache for InMemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let entry = CacheEntry { value: value.to_string(), expires_at: Instant::now() + ttl };
        self.store.lock().await.put(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut store = self.store.lock().await;
        let expired = match store.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            store.pop(key);
        }
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<(), AppError> {
        self.store.lock().await.pop(key);
        Ok(())
    }
}
