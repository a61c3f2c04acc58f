//! Bounded query result cache.
//!
//! Entries are keyed by the literal query text and never expire: the store is opened
//! read-only, so a result only leaves the cache under capacity pressure or an explicit
//! [`QueryCache::clear`]. Concurrent misses on the same key are coalesced so the loader
//! runs once per key.

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default number of cached results.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Where a cached lookup was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

/// LRU cache with single-flight loading.
pub struct QueryCache<V> {
    entries: Mutex<LruCache<String, Arc<V>>>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> QueryCache<V> {
    /// Create a cache holding at most `capacity` entries (zero falls back to the default).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a cached value, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Arc<V>) {
        let key = key.into();
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), value) {
            if evicted != key {
                debug!("Evicted least recently used cache entry");
            }
        }
    }

    /// Return the cached value for `key`, or run `load` once and cache its `Ok` value.
    ///
    /// Callers racing on the same key wait for the first loader and then read its result.
    /// Errors are returned to the caller that ran the loader and are not cached.
    pub async fn get_or_try_load<F, Fut, E>(
        &self,
        key: &str,
        load: F,
    ) -> Result<(Arc<V>, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Query cache hit");
            return Ok((value, CacheOutcome::Hit));
        }

        let slot = InFlight::enter(&self.in_flight, key);
        let _guard = slot.lock().await;

        if let Some(value) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Query cache hit after waiting for loader");
            return Ok((value, CacheOutcome::Hit));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Query cache miss");
        let value = Arc::new(load().await?);
        self.insert(key, Arc::clone(&value));
        Ok((value, CacheOutcome::Miss))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        debug!("Clearing query cache");
        self.entries.lock().clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: entries.len(),
            capacity: entries.cap().get(),
        }
    }
}

type Gate = Arc<tokio::sync::Mutex<()>>;

/// A caller's claim on a key's load gate. Dropping it, including when the caller's future is
/// cancelled mid-load, removes the gate once nobody else holds it.
struct InFlight<'a> {
    map: &'a DashMap<String, Gate>,
    key: &'a str,
    gate: Option<Gate>,
}

impl<'a> InFlight<'a> {
    fn enter(map: &'a DashMap<String, Gate>, key: &'a str) -> Self {
        let gate = map
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        Self {
            map,
            key,
            gate: Some(gate),
        }
    }

    async fn lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        drop(self.gate.take());
        self.map
            .remove_if(self.key, |_, gate| Arc::strong_count(gate) == 1);
    }
}

impl<V> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}
