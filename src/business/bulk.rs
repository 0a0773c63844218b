//! Cache-aware multi-key reads with threshold-based negative caching.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cache::{Cache, CacheError, CacheKey, CachedValue};
use crate::db::StoreResult;

/// One bulk-lookup input with its request multiplicity.
///
/// Multiplicity is how many times the caller saw this key in the incoming
/// request batch; it drives the negative-caching threshold below.
#[derive(Debug, Clone)]
pub struct BulkInput {
    /// The cache key to resolve.
    pub key: CacheKey,
    /// How many times this key occurred in the request batch.
    pub multiplicity: u32,
}

/// Result of a bulk read, split so callers can observe which keys were hot.
#[derive(Debug)]
pub struct BulkOutcome<V> {
    /// Values answered by the cache.
    pub cached: Vec<Arc<V>>,
    /// Values fetched from the store in the single multi-key query.
    pub fetched: Vec<Arc<V>>,
}

/// Resolve a set of keys against the cache, fetch the remainder with one
/// store query, and negatively cache unresolved keys seen at least
/// `negative_threshold` times.
///
/// Entries the cache marks missing are dropped from the result entirely.
pub(crate) async fn bulk_read<V, F>(
    cache: &Arc<dyn Cache>,
    inputs: Vec<BulkInput>,
    negative_threshold: u32,
    fetch: F,
) -> StoreResult<BulkOutcome<V>>
where
    V: Send + Sync + 'static,
    F: FnOnce(Vec<CacheKey>) -> BoxFuture<'static, StoreResult<Vec<(CacheKey, V)>>>,
{
    let mut cached = Vec::new();
    let mut pending: Vec<BulkInput> = Vec::new();

    for input in inputs {
        match cache.get(&input.key) {
            Ok(value) => match value.downcast::<V>() {
                Ok(value) => cached.push(value),
                Err(e) => {
                    log::warn!("bulk read: dropping {}: {}", input.key, e);
                }
            },
            // Confirmed absent; the caller never sees these.
            Err(CacheError::NegativeHit) => {}
            Err(_) => pending.push(input),
        }
    }

    if pending.is_empty() {
        return Ok(BulkOutcome {
            cached,
            fetched: Vec::new(),
        });
    }

    let keys: Vec<CacheKey> = pending.iter().map(|input| input.key.clone()).collect();
    let rows = fetch(keys).await?;

    let mut fetched = Vec::new();
    for (key, value) in rows {
        if let Some(position) = pending.iter().position(|input| input.key == key) {
            pending.remove(position);
        }
        let shared = Arc::new(value);
        if let Err(e) = cache.set(&key, CachedValue::shared(shared.clone())) {
            log::warn!("bulk read: failed to cache {}: {}", key, e);
        }
        fetched.push(shared);
    }

    // Keys the store did not return get a negative entry once their request
    // multiplicity reaches the threshold. This dampens miss loops from
    // attackers probing large unknown key spaces while keeping genuine
    // first-time lookups fast.
    // TODO: a probabilistic filter (Bloom/cuckoo with expiry) would resist
    // one-shot probing floods better than per-key negative entries.
    for input in pending {
        if input.multiplicity >= negative_threshold {
            cache.set_missing(&input.key);
        }
    }

    Ok(BulkOutcome { cached, fetched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, Prefix};
    use futures::FutureExt;

    fn key(id: i64) -> CacheKey {
        CacheKey::num(Prefix::PropertyById, id)
    }

    fn input(id: i64, multiplicity: u32) -> BulkInput {
        BulkInput {
            key: key(id),
            multiplicity,
        }
    }

    #[tokio::test]
    async fn test_partial_hits() {
        let memory = MemoryCache::default();
        let cache: Arc<dyn Cache> = Arc::new(memory.clone());
        // Prewarm A and B.
        cache.set(&key(1), CachedValue::of(10i64)).unwrap();
        cache.set(&key(2), CachedValue::of(20i64)).unwrap();

        let outcome = bulk_read::<i64, _>(
            &cache,
            vec![input(1, 1), input(2, 1), input(3, 5), input(4, 1)],
            1,
            |keys| {
                // Only the cold keys reach the store.
                assert_eq!(keys, vec![key(3), key(4)]);
                async { Ok(vec![(key(3), 30i64)]) }.boxed()
            },
        )
        .await
        .unwrap();

        let cached: Vec<i64> = outcome.cached.iter().map(|v| **v).collect();
        let fetched: Vec<i64> = outcome.fetched.iter().map(|v| **v).collect();
        assert_eq!(cached, vec![10, 20]);
        assert_eq!(fetched, vec![30]);

        // The unresolved key got a negative entry, the fetched one is warm.
        assert!(matches!(cache.get(&key(4)), Err(CacheError::NegativeHit)));
        assert!(cache.get(&key(3)).is_ok());
    }

    #[tokio::test]
    async fn test_all_hot_returns_without_store_query() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());
        cache.set(&key(1), CachedValue::of(10i64)).unwrap();

        let outcome = bulk_read::<i64, _>(&cache, vec![input(1, 1)], 1, |_keys| {
            async { panic!("store query must not run") }.boxed()
        })
        .await
        .unwrap();

        assert_eq!(outcome.cached.len(), 1);
        assert!(outcome.fetched.is_empty());
    }

    #[tokio::test]
    async fn test_negative_threshold_spares_rare_misses() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());

        bulk_read::<i64, _>(&cache, vec![input(5, 1), input(6, 3)], 2, |_keys| {
            async { Ok(Vec::new()) }.boxed()
        })
        .await
        .unwrap();

        // Multiplicity 1 stays a plain miss; multiplicity 3 went negative.
        assert!(matches!(cache.get(&key(5)), Err(CacheError::Miss)));
        assert!(matches!(cache.get(&key(6)), Err(CacheError::NegativeHit)));
    }

    #[tokio::test]
    async fn test_negative_entries_are_dropped_from_results() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());
        cache.set_missing(&key(9));

        let outcome = bulk_read::<i64, _>(&cache, vec![input(9, 1)], 1, |keys| {
            assert!(keys.is_empty());
            async { Ok(Vec::new()) }.boxed()
        })
        .await
        .unwrap();

        assert!(outcome.cached.is_empty());
        assert!(outcome.fetched.is_empty());
    }
}
