//! Transaction-scoped cache staging.
//!
//! While a store transaction is open the surrounding code must not publish
//! its not-yet-committed view into the shared cache, so the staged cache
//! records every mutation and replays it against the live cache only after
//! the transaction commits. Reads are deliberately unsupported: `get` fails
//! and `get_or_load` bypasses caching and asks the loader directly, which
//! inside a transaction reads through the transaction's own connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Cache, CacheError, CacheKey, CacheLoader, CacheResult, CachedValue};

#[derive(Default)]
struct Staged {
    sets: HashMap<CacheKey, (CachedValue, Option<Duration>)>,
    missing: HashSet<CacheKey>,
    deletes: HashSet<CacheKey>,
}

/// Cache mutations captured during a store transaction.
#[derive(Default)]
pub struct StagedCache {
    staged: Mutex<Staged>,
}

impl StagedCache {
    /// An empty staging area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged mutations, across all three sets.
    pub fn len(&self) -> usize {
        let staged = self.staged.lock();
        staged.sets.len() + staged.missing.len() + staged.deletes.len()
    }

    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay the staged mutations against the live cache: deletes first,
    /// then negative sets, then value sets. Called once, after the store
    /// transaction committed; on rollback the staged set is simply dropped.
    pub fn commit(&self, live: &dyn Cache) {
        let staged = {
            let mut guard = self.staged.lock();
            std::mem::take(&mut *guard)
        };
        for key in &staged.deletes {
            live.delete(key);
        }
        for key in &staged.missing {
            live.set_missing(key);
        }
        for (key, (value, ttl)) in staged.sets {
            let result = match ttl {
                Some(ttl) => live.set_with_ttl(&key, value, ttl),
                None => live.set(&key, value),
            };
            if let Err(e) = result {
                log::warn!("staged cache set for {} failed: {}", key, e);
            }
        }
    }
}

#[async_trait]
impl Cache for StagedCache {
    fn get(&self, _key: &CacheKey) -> CacheResult<CachedValue> {
        Err(CacheError::TxUnsupported)
    }

    async fn get_or_load(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn CacheLoader>,
    ) -> anyhow::Result<CachedValue> {
        loader.load(key).await
    }

    fn set(&self, key: &CacheKey, value: CachedValue) -> CacheResult<()> {
        if value.is_missing() {
            return Err(CacheError::CannotSetMissing);
        }
        let mut staged = self.staged.lock();
        staged.deletes.remove(key);
        staged.missing.remove(key);
        staged.sets.insert(key.clone(), (value, None));
        Ok(())
    }

    fn set_with_ttl(&self, key: &CacheKey, value: CachedValue, ttl: Duration) -> CacheResult<()> {
        if value.is_missing() {
            return Err(CacheError::CannotSetMissing);
        }
        let mut staged = self.staged.lock();
        staged.deletes.remove(key);
        staged.missing.remove(key);
        staged.sets.insert(key.clone(), (value, Some(ttl)));
        Ok(())
    }

    fn set_missing(&self, key: &CacheKey) {
        let mut staged = self.staged.lock();
        staged.deletes.remove(key);
        staged.sets.remove(key);
        staged.missing.insert(key.clone());
    }

    fn set_ttl(&self, key: &CacheKey, ttl: Duration) {
        let mut staged = self.staged.lock();
        if let Some((_, staged_ttl)) = staged.sets.get_mut(key) {
            *staged_ttl = Some(ttl);
        }
    }

    fn delete(&self, key: &CacheKey) {
        let mut staged = self.staged.lock();
        staged.sets.remove(key);
        staged.missing.remove(key);
        staged.deletes.insert(key.clone());
    }

    fn hit_ratio(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, Prefix};

    fn key(id: i64) -> CacheKey {
        CacheKey::num(Prefix::Org, id)
    }

    #[test]
    fn test_get_is_unsupported() {
        let staged = StagedCache::new();
        assert_eq!(staged.get(&key(1)).unwrap_err(), CacheError::TxUnsupported);
    }

    #[test]
    fn test_commit_applies_in_order() {
        let live = MemoryCache::default();
        live.set(&key(1), CachedValue::of(1i64)).unwrap();
        live.set(&key(2), CachedValue::of(2i64)).unwrap();

        let staged = StagedCache::new();
        staged.delete(&key(1));
        staged.set_missing(&key(2));
        staged.set(&key(3), CachedValue::of(3i64)).unwrap();

        staged.commit(&live);

        assert_eq!(live.get(&key(1)).unwrap_err(), CacheError::Miss);
        assert_eq!(live.get(&key(2)).unwrap_err(), CacheError::NegativeHit);
        assert_eq!(*live.get(&key(3)).unwrap().downcast::<i64>().unwrap(), 3);
    }

    #[test]
    fn test_last_write_wins_within_tx() {
        let live = MemoryCache::default();
        let staged = StagedCache::new();

        staged.set(&key(1), CachedValue::of(1i64)).unwrap();
        staged.delete(&key(1));
        staged.commit(&live);
        assert_eq!(live.get(&key(1)).unwrap_err(), CacheError::Miss);

        let staged = StagedCache::new();
        staged.delete(&key(2));
        staged.set(&key(2), CachedValue::of(2i64)).unwrap();
        staged.commit(&live);
        assert_eq!(*live.get(&key(2)).unwrap().downcast::<i64>().unwrap(), 2);
    }

    #[test]
    fn test_dropped_without_commit_changes_nothing() {
        let live = MemoryCache::default();
        live.set(&key(1), CachedValue::of(1i64)).unwrap();
        {
            let staged = StagedCache::new();
            staged.delete(&key(1));
            // No commit; the transaction rolled back.
        }
        assert!(live.get(&key(1)).is_ok());
    }

    #[tokio::test]
    async fn test_get_or_load_bypasses_staging() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingLoader(AtomicUsize);

        #[async_trait]
        impl CacheLoader for CountingLoader {
            async fn load(&self, _key: &CacheKey) -> anyhow::Result<CachedValue> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(CachedValue::of(5i64))
            }
        }

        let staged = StagedCache::new();
        let loader = Arc::new(CountingLoader(AtomicUsize::new(0)));
        let dyn_loader: Arc<dyn CacheLoader> = loader.clone();

        staged.get_or_load(&key(1), &dyn_loader).await.unwrap();
        staged.get_or_load(&key(1), &dyn_loader).await.unwrap();

        // Every call goes to the loader; nothing is cached or staged.
        assert_eq!(loader.0.load(Ordering::SeqCst), 2);
        assert!(staged.is_empty());
    }
}
