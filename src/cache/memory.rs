//! The bounded in-process cache.
//!
//! Policies:
//! - Approximate LRU eviction once the entry count exceeds the configured
//!   maximum
//! - Idle expiry: every access pushes a sliding entry's expiry forward
//! - Refresh-ahead: entries loaded through [`MemoryCache::get_or_load`] carry
//!   a refresh deadline; a read past it schedules the entry's loader exactly
//!   once and keeps serving the current value in the meantime
//! - Negative caching: a confirmed-absent marker stored under a shorter TTL
//!
//! Single-key operations are linearisable with respect to each other; across
//! keys no ordering is provided.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Cache, CacheError, CacheKey, CacheLoader, CacheResult, CachedValue};

/// Tuning knobs for [`MemoryCache`].
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries before LRU eviction kicks in.
    pub max_entries: usize,

    /// Sliding TTL applied to plain values; every access resets it.
    pub idle_ttl: Duration,

    /// TTL for negative entries; deliberately shorter than `idle_ttl`.
    pub negative_ttl: Duration,

    /// How long after a load an entry becomes due for refresh-ahead.
    pub refresh_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            idle_ttl: Duration::from_secs(30 * 60),
            negative_ttl: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Decision returned by a [`MemoryCache::compute`] closure.
pub enum Compute {
    /// Leave the entry as it is.
    Keep,
    /// Store a new value; `Some(ttl)` pins an absolute TTL, `None` keeps the
    /// entry's existing deadline (or the idle TTL for a fresh entry).
    Put(CachedValue, Option<Duration>),
    /// Remove the entry.
    Remove,
}

struct Entry {
    value: CachedValue,
    expires_at: Instant,
    ttl: Duration,
    sliding: bool,
    refresh_at: Option<Instant>,
    refresh_scheduled: bool,
    loader: Option<Arc<dyn CacheLoader>>,
}

struct Inner {
    entries: DashMap<CacheKey, Entry>,
    /// LRU order, coldest first. Never lock this while holding a map guard.
    order: Mutex<Vec<CacheKey>>,
    config: MemoryCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
}

impl Inner {
    fn touch(&self, key: &CacheKey) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push(key.clone());
    }

    fn remove_order(&self, key: &CacheKey) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
    }

    fn evict_if_needed(&self) {
        while self.entries.len() > self.config.max_entries {
            let victim = {
                let mut order = self.order.lock();
                if order.is_empty() {
                    return;
                }
                order.remove(0)
            };
            self.entries.remove(&victim);
        }
    }

    fn insert(&self, key: &CacheKey, entry: Entry) {
        self.entries.insert(key.clone(), entry);
        self.touch(key);
        self.evict_if_needed();
    }

    /// Store a freshly loaded value, arming the refresh deadline.
    fn set_loaded(&self, key: &CacheKey, value: CachedValue, loader: Option<Arc<dyn CacheLoader>>) {
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: now + self.config.idle_ttl,
            ttl: self.config.idle_ttl,
            sliding: true,
            refresh_at: loader.as_ref().map(|_| now + self.config.refresh_interval),
            refresh_scheduled: false,
            loader,
        };
        self.insert(key, entry);
    }

    fn set_missing(&self, key: &CacheKey) {
        let now = Instant::now();
        let entry = Entry {
            value: CachedValue::Missing,
            expires_at: now + self.config.negative_ttl,
            ttl: self.config.negative_ttl,
            sliding: false,
            refresh_at: None,
            refresh_scheduled: false,
            loader: None,
        };
        self.insert(key, entry);
    }

    /// A refresh attempt failed: keep the value, push the deadline forward.
    fn refresh_failed(&self, key: &CacheKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.refresh_scheduled = false;
            entry.refresh_at = Some(Instant::now() + self.config.refresh_interval);
        }
    }
}

/// The shared in-process cache. Cloning is cheap and clones observe the same
/// entries.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    /// Create a cache with the given configuration.
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                order: Mutex::new(Vec::new()),
                config,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                loads: AtomicU64::new(0),
            }),
        }
    }

    /// Number of live entries, expired ones included until they are touched.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Number of loader invocations so far.
    pub fn loads(&self) -> u64 {
        self.inner.loads.load(Ordering::Relaxed)
    }

    /// Atomically transform the value under a key.
    ///
    /// The closure sees the current unexpired value (or `None`) and decides
    /// what happens next; it runs under the key's map lock and must not touch
    /// the cache itself. Returns the value left in place.
    pub fn compute<F>(&self, key: &CacheKey, f: F) -> Option<CachedValue>
    where
        F: FnOnce(Option<&CachedValue>) -> Compute,
    {
        let now = Instant::now();
        let mut removed = false;
        let mut inserted = false;
        let result = match self.inner.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let expired = occupied.get().expires_at <= now;
                let decision = {
                    let current = if expired { None } else { Some(&occupied.get().value) };
                    f(current)
                };
                match decision {
                    Compute::Keep => {
                        if expired {
                            occupied.remove();
                            removed = true;
                            None
                        } else {
                            Some(occupied.get().value.clone())
                        }
                    }
                    Compute::Put(value, ttl) => {
                        let entry = occupied.get_mut();
                        entry.value = value.clone();
                        if expired || ttl.is_some() {
                            let ttl = ttl.unwrap_or(self.inner.config.idle_ttl);
                            entry.ttl = ttl;
                            entry.sliding = false;
                            entry.expires_at = now + ttl;
                        }
                        Some(value)
                    }
                    Compute::Remove => {
                        occupied.remove();
                        removed = true;
                        None
                    }
                }
            }
            MapEntry::Vacant(vacant) => match f(None) {
                Compute::Keep | Compute::Remove => None,
                Compute::Put(value, ttl) => {
                    let ttl = ttl.unwrap_or(self.inner.config.idle_ttl);
                    vacant.insert(Entry {
                        value: value.clone(),
                        expires_at: now + ttl,
                        ttl,
                        sliding: false,
                        refresh_at: None,
                        refresh_scheduled: false,
                        loader: None,
                    });
                    inserted = true;
                    Some(value)
                }
            },
        };
        if removed {
            self.inner.remove_order(key);
        }
        if inserted {
            self.inner.touch(key);
            self.inner.evict_if_needed();
        }
        result
    }

    /// [`MemoryCache::compute`] over several keys in one call.
    pub fn compute_batch<F>(&self, keys: &[CacheKey], mut f: F) -> Vec<Option<CachedValue>>
    where
        F: FnMut(&CacheKey, Option<&CachedValue>) -> Compute,
    {
        keys.iter()
            .map(|key| self.compute(key, |current| f(key, current)))
            .collect()
    }

    fn spawn_refresh(&self, key: CacheKey, loader: Arc<dyn CacheLoader>, current: CachedValue) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match loader.reload(&key, current).await {
                Ok(CachedValue::Missing) => inner.set_missing(&key),
                Ok(value) => inner.set_loaded(&key, value, Some(loader)),
                Err(e) => {
                    log::debug!("refresh-ahead for {} failed: {}", key, e);
                    inner.refresh_failed(&key);
                }
            }
        });
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn get(&self, key: &CacheKey) -> CacheResult<CachedValue> {
        let now = Instant::now();
        let mut due_refresh = None;
        let outcome = match self.inner.entries.get_mut(key) {
            None => None,
            Some(mut entry) => {
                if entry.expires_at <= now {
                    drop(entry);
                    self.inner.entries.remove(key);
                    self.inner.remove_order(key);
                    None
                } else {
                    if entry.sliding {
                        entry.expires_at = now + entry.ttl;
                    }
                    if let Some(refresh_at) = entry.refresh_at {
                        if refresh_at <= now && !entry.refresh_scheduled {
                            if let Some(loader) = entry.loader.clone() {
                                entry.refresh_scheduled = true;
                                due_refresh = Some((loader, entry.value.clone()));
                            }
                        }
                    }
                    Some(entry.value.clone())
                }
            }
        };

        if let Some((loader, current)) = due_refresh {
            self.spawn_refresh(key.clone(), loader, current);
        }

        match outcome {
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Miss)
            }
            Some(value) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                self.inner.touch(key);
                if value.is_missing() {
                    Err(CacheError::NegativeHit)
                } else {
                    Ok(value)
                }
            }
        }
    }

    async fn get_or_load(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn CacheLoader>,
    ) -> anyhow::Result<CachedValue> {
        match self.get(key) {
            Ok(value) => return Ok(value),
            Err(CacheError::NegativeHit) => return Ok(CachedValue::Missing),
            Err(_) => {}
        }

        self.inner.loads.fetch_add(1, Ordering::Relaxed);
        let value = loader.load(key).await?;
        match value {
            CachedValue::Missing => {
                self.inner.set_missing(key);
                Ok(CachedValue::Missing)
            }
            value => {
                self.inner.set_loaded(key, value.clone(), Some(loader.clone()));
                Ok(value)
            }
        }
    }

    fn set(&self, key: &CacheKey, value: CachedValue) -> CacheResult<()> {
        if value.is_missing() {
            return Err(CacheError::CannotSetMissing);
        }
        let now = Instant::now();
        match self.inner.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                // Keep the entry's loader so refresh-ahead survives overwrites.
                let entry = occupied.get_mut();
                entry.value = value;
                entry.ttl = self.inner.config.idle_ttl;
                entry.sliding = true;
                entry.expires_at = now + entry.ttl;
                if entry.loader.is_some() {
                    entry.refresh_at = Some(now + self.inner.config.refresh_interval);
                    entry.refresh_scheduled = false;
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value,
                    expires_at: now + self.inner.config.idle_ttl,
                    ttl: self.inner.config.idle_ttl,
                    sliding: true,
                    refresh_at: None,
                    refresh_scheduled: false,
                    loader: None,
                });
            }
        }
        self.inner.touch(key);
        self.inner.evict_if_needed();
        Ok(())
    }

    fn set_with_ttl(&self, key: &CacheKey, value: CachedValue, ttl: Duration) -> CacheResult<()> {
        if value.is_missing() {
            return Err(CacheError::CannotSetMissing);
        }
        let now = Instant::now();
        self.inner.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                ttl,
                sliding: false,
                refresh_at: None,
                refresh_scheduled: false,
                loader: None,
            },
        );
        Ok(())
    }

    fn set_missing(&self, key: &CacheKey) {
        self.inner.set_missing(key);
    }

    fn set_ttl(&self, key: &CacheKey, ttl: Duration) {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.ttl = ttl;
            entry.sliding = false;
            entry.expires_at = Instant::now() + ttl;
        }
    }

    fn delete(&self, key: &CacheKey) {
        self.inner.entries.remove(key);
        self.inner.remove_order(key);
    }

    fn hit_ratio(&self) -> f64 {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Prefix;
    use std::sync::atomic::AtomicUsize;

    fn key(id: i64) -> CacheKey {
        CacheKey::num(Prefix::User, id)
    }

    fn small_cache() -> MemoryCache {
        MemoryCache::new(MemoryCacheConfig {
            max_entries: 3,
            idle_ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_millis(50),
            refresh_interval: Duration::from_millis(20),
        })
    }

    struct FixedLoader {
        value: i64,
        calls: AtomicUsize,
    }

    impl FixedLoader {
        fn new(value: i64) -> Arc<Self> {
            Arc::new(Self {
                value,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CacheLoader for FixedLoader {
        async fn load(&self, _key: &CacheKey) -> anyhow::Result<CachedValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CachedValue::of(self.value))
        }
    }

    struct MissingLoader;

    #[async_trait]
    impl CacheLoader for MissingLoader {
        async fn load(&self, _key: &CacheKey) -> anyhow::Result<CachedValue> {
            Ok(CachedValue::Missing)
        }
    }

    #[test]
    fn test_set_then_get() {
        let cache = small_cache();
        cache.set(&key(1), CachedValue::of(42i64)).unwrap();
        let got = cache.get(&key(1)).unwrap();
        assert_eq!(*got.downcast::<i64>().unwrap(), 42);
    }

    #[test]
    fn test_get_reports_miss_and_negative() {
        let cache = small_cache();
        assert_eq!(cache.get(&key(1)).unwrap_err(), CacheError::Miss);
        cache.set_missing(&key(1));
        assert_eq!(cache.get(&key(1)).unwrap_err(), CacheError::NegativeHit);
    }

    #[test]
    fn test_negative_ttl_elapses() {
        let cache = small_cache();
        cache.set_missing(&key(1));
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(cache.get(&key(1)).unwrap_err(), CacheError::Miss);
    }

    #[test]
    fn test_set_rejects_missing_marker() {
        let cache = small_cache();
        assert_eq!(
            cache.set(&key(1), CachedValue::Missing).unwrap_err(),
            CacheError::CannotSetMissing
        );
    }

    #[test]
    fn test_invalid_type() {
        let cache = small_cache();
        cache.set(&key(1), CachedValue::of("text")).unwrap();
        let got = cache.get(&key(1)).unwrap();
        assert_eq!(got.downcast::<i64>().unwrap_err(), CacheError::InvalidType);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = small_cache();
        for id in 1..=3 {
            cache.set(&key(id), CachedValue::of(id)).unwrap();
        }
        // Touch 1 so 2 becomes the coldest.
        cache.get(&key(1)).unwrap();
        cache.set(&key(4), CachedValue::of(4i64)).unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&key(2)).unwrap_err(), CacheError::Miss);
        assert!(cache.get(&key(1)).is_ok());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let cache = small_cache();
        cache.set(&key(1), CachedValue::of(1i64)).unwrap();
        cache.delete(&key(1));
        cache.delete(&key(1));
        assert_eq!(cache.get(&key(1)).unwrap_err(), CacheError::Miss);
    }

    #[test]
    fn test_hit_ratio() {
        let cache = small_cache();
        cache.set(&key(1), CachedValue::of(1i64)).unwrap();
        cache.get(&key(1)).unwrap();
        let _ = cache.get(&key(2));
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_get_or_load_caches_value() {
        let cache = small_cache();
        let loader = FixedLoader::new(7);
        let dyn_loader: Arc<dyn CacheLoader> = loader.clone();

        let v = cache.get_or_load(&key(1), &dyn_loader).await.unwrap();
        assert_eq!(*v.downcast::<i64>().unwrap(), 7);
        let v = cache.get_or_load(&key(1), &dyn_loader).await.unwrap();
        assert_eq!(*v.downcast::<i64>().unwrap(), 7);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.loads(), 1);
    }

    #[tokio::test]
    async fn test_get_or_load_negative() {
        let cache = small_cache();
        let loader: Arc<dyn CacheLoader> = Arc::new(MissingLoader);

        let v = cache.get_or_load(&key(1), &loader).await.unwrap();
        assert!(v.is_missing());
        assert_eq!(cache.get(&key(1)).unwrap_err(), CacheError::NegativeHit);
    }

    #[tokio::test]
    async fn test_refresh_ahead_fires_once() {
        let cache = small_cache();
        let loader = FixedLoader::new(9);
        let dyn_loader: Arc<dyn CacheLoader> = loader.clone();
        cache.get_or_load(&key(1), &dyn_loader).await.unwrap();

        // Cross the refresh deadline; the stale value keeps serving.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let v = cache.get(&key(1)).unwrap();
        assert_eq!(*v.downcast::<i64>().unwrap(), 9);
        let _ = cache.get(&key(1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        // One reload beyond the initial load, despite two reads past the deadline.
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_compute_counter() {
        let cache = small_cache();
        let k = key(1);
        for expected in 1u32..=3 {
            let v = cache
                .compute(&k, |current| {
                    let next = match current.and_then(|v| v.downcast::<u32>().ok()) {
                        Some(n) => *n + 1,
                        None => 1,
                    };
                    let ttl = (next == 1).then_some(Duration::from_secs(60));
                    Compute::Put(CachedValue::of(next), ttl)
                })
                .unwrap();
            assert_eq!(*v.downcast::<u32>().unwrap(), expected);
        }
    }

    #[test]
    fn test_compute_batch() {
        let cache = MemoryCache::default();
        let keys: Vec<CacheKey> = (1..=3).map(key).collect();
        cache.set(&keys[0], CachedValue::of(10u32)).unwrap();

        let results = cache.compute_batch(&keys, |_, current| {
            let next = current
                .and_then(|v| v.downcast::<u32>().ok())
                .map(|v| *v + 1)
                .unwrap_or(1);
            Compute::Put(CachedValue::of(next), None)
        });

        let counts: Vec<u32> = results
            .into_iter()
            .map(|v| *v.unwrap().downcast::<u32>().unwrap())
            .collect();
        assert_eq!(counts, vec![11, 1, 1]);
    }

    #[test]
    fn test_compute_keep_and_remove() {
        let cache = small_cache();
        let k = key(1);
        assert!(cache.compute(&k, |_| Compute::Keep).is_none());
        cache.set(&k, CachedValue::of(5i64)).unwrap();
        assert!(cache.compute(&k, |_| Compute::Remove).is_none());
        assert_eq!(cache.get(&k).unwrap_err(), CacheError::Miss);
    }
}
