//! Bounded Cache - TTL and size-bounded key/value store
//!
//! Entries expire after a per-entry TTL that slides forward on every hit.
//! The size bound is enforced at insertion time by evicting the least
//! recently used entry. Recency and expiry share one lock, so concurrent
//! callers never observe the two out of step.
//!
//! Process-wide test switches live in [`CacheSettings`], an explicit handle
//! shared by every cache built from it.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use lru::LruCache;
use tracing::trace;

/// Millisecond time source used for expiry computation
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic expiry tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Switches shared by all caches created with the same handle
#[derive(Debug, Default)]
pub struct CacheSettings {
    disabled: AtomicBool,
    max_size_override: Mutex<Option<usize>>,
}

impl CacheSettings {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Turn every cache into a no-op store
    pub fn disable_all(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn enable_all(&self) {
        self.disabled.store(false, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Apply a maximum size to every cache, replacing their own bounds
    pub fn set_max_size_override(&self, max_size: Option<usize>) {
        *lock(&self.max_size_override) = max_size;
    }

    pub fn max_size_override(&self) -> Option<usize> {
        *lock(&self.max_size_override)
    }

    /// Restore defaults (enabled, no override)
    pub fn reset(&self) {
        self.enable_all();
        self.set_max_size_override(None);
    }
}

struct CacheEntry<V> {
    value: V,
    ttl_millis: u64,
    expiry_at_millis: u64,
}

/// TTL/LRU-bounded cache
pub struct BoundedCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    max_size: usize,
    settings: Arc<CacheSettings>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache on the wall clock with private settings
    pub fn new(max_size: usize) -> Self {
        Self::with_settings(max_size, CacheSettings::new(), Arc::new(SystemClock))
    }

    pub fn with_settings(
        max_size: usize,
        settings: Arc<CacheSettings>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Capacity is enforced on insert so the settings override can change it
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            max_size,
            settings,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn effective_max_size(&self) -> usize {
        self.settings.max_size_override().unwrap_or(self.max_size)
    }

    /// Insert or replace `key`, evicting least recently used entries when full
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        if self.settings.is_disabled() {
            return;
        }

        let max_size = self.effective_max_size();
        let mut entries = lock(&self.entries);
        if max_size == 0 {
            entries.pop(&key);
            return;
        }

        if !entries.contains(&key) {
            while entries.len() >= max_size {
                if entries.pop_lru().is_none() {
                    break;
                }
                trace!(len = entries.len(), "Evicted least recently used cache entry");
            }
        }

        let ttl_millis = ttl.as_millis() as u64;
        let now = self.clock.now_millis();
        entries.push(
            key,
            CacheEntry {
                value,
                ttl_millis,
                expiry_at_millis: now.saturating_add(ttl_millis),
            },
        );
    }

    /// Look up `key`, refreshing its expiry and recency on a live hit
    pub fn get(&self, key: &K) -> Option<V> {
        if self.settings.is_disabled() {
            return None;
        }

        let now = self.clock.now_millis();
        let mut entries = lock(&self.entries);
        let found = match entries.get_mut(key) {
            Some(entry) if entry.expiry_at_millis > now => {
                entry.expiry_at_millis = now.saturating_add(entry.ttl_millis);
                Ok(entry.value.clone())
            }
            Some(_) => Err(true),
            None => Err(false),
        };
        if matches!(found, Err(true)) {
            entries.pop(key);
        }
        let found = found.ok();

        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return the cached value or compute, store and return a new one
    pub fn get_or_insert_with<F>(&self, key: K, ttl: Duration, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = f();
        self.put(key, value.clone(), ttl);
        value
    }

    pub fn delete(&self, key: &K) {
        if self.settings.is_disabled() {
            return;
        }
        lock(&self.entries).pop(key);
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl<K: Hash + Eq, V> fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCache")
            .field("max_size", &self.max_size)
            .field("len", &lock(&self.entries).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
