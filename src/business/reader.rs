//! Read helpers unifying cache lookup, store fetch, and negative caching.
//!
//! A reader owns a boxed fetch closure and implements the cache's loader
//! interface for both the initial load and refresh-ahead. A store "no rows"
//! becomes the missing marker for single entities and an empty list for
//! array reads, because an empty list is a valid answer to a list query.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::cache::{Cache, CacheError, CacheKey, CacheLoader, CachedValue};
use crate::db::{StoreError, StoreResult};

type FetchFn<V> = Box<dyn Fn() -> BoxFuture<'static, StoreResult<V>> + Send + Sync>;

/// Loader for a single entity; "no rows" stores the missing marker.
pub struct EntityLoader<V> {
    fetch: FetchFn<V>,
}

impl<V: Send + Sync + 'static> EntityLoader<V> {
    /// Wrap a fetch closure.
    pub fn new<F, Fut>(fetch: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<V>> + Send + 'static,
    {
        Arc::new(Self {
            fetch: Box::new(move || Box::pin(fetch())),
        })
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> CacheLoader for EntityLoader<V> {
    async fn load(&self, _key: &CacheKey) -> anyhow::Result<CachedValue> {
        match (self.fetch)().await {
            Ok(value) => Ok(CachedValue::of(value)),
            Err(StoreError::NotFound) => Ok(CachedValue::Missing),
            Err(e) => Err(e.into()),
        }
    }
}

/// Loader for a list result; "no rows" stores an empty list.
pub struct ListLoader<V> {
    fetch: FetchFn<Vec<V>>,
}

impl<V: Send + Sync + 'static> ListLoader<V> {
    /// Wrap a fetch closure.
    pub fn new<F, Fut>(fetch: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<Vec<V>>> + Send + 'static,
    {
        Arc::new(Self {
            fetch: Box::new(move || Box::pin(fetch())),
        })
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> CacheLoader for ListLoader<V> {
    async fn load(&self, _key: &CacheKey) -> anyhow::Result<CachedValue> {
        match (self.fetch)().await {
            Ok(values) => Ok(CachedValue::of(values)),
            Err(StoreError::NotFound) => Ok(CachedValue::of(Vec::<V>::new())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Property loader with warmup hand-off on refresh-ahead.
///
/// Instead of re-querying on the serving path, a refresh enqueues the site
/// key for the background warmer and keeps the current value; when no warmer
/// is wired, it degrades to a plain reload.
pub struct PropertyLoader {
    inner: FetchFn<crate::db::Property>,
    warmer: Option<mpsc::Sender<String>>,
}

impl PropertyLoader {
    /// Wrap a fetch closure, optionally wiring the warmup queue.
    pub fn new<F, Fut>(fetch: F, warmer: Option<mpsc::Sender<String>>) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<crate::db::Property>> + Send + 'static,
    {
        Arc::new(Self {
            inner: Box::new(move || Box::pin(fetch())),
            warmer,
        })
    }
}

#[async_trait]
impl CacheLoader for PropertyLoader {
    async fn load(&self, _key: &CacheKey) -> anyhow::Result<CachedValue> {
        match (self.inner)().await {
            Ok(value) => Ok(CachedValue::of(value)),
            Err(StoreError::NotFound) => Ok(CachedValue::Missing),
            Err(e) => Err(e.into()),
        }
    }

    async fn reload(&self, key: &CacheKey, current: CachedValue) -> anyhow::Result<CachedValue> {
        if let (Some(warmer), Some(sitekey)) = (&self.warmer, key.name()) {
            if warmer.try_send(sitekey.to_string()).is_ok() {
                // The warmer owns the refresh; extend the current value.
                return Ok(current);
            }
        }
        self.load(key).await
    }
}

/// Map a loader error surfaced through `get_or_load` back to a store error.
pub(crate) fn loader_error(e: anyhow::Error) -> StoreError {
    match e.downcast::<StoreError>() {
        Ok(store_error) => store_error,
        Err(other) => StoreError::Internal(other.to_string()),
    }
}

/// Single-entity read: cache first, loader on a miss, negative hits surface
/// as [`CacheError::NegativeHit`].
pub(crate) async fn read_one<V: Send + Sync + 'static>(
    cache: &Arc<dyn Cache>,
    key: &CacheKey,
    loader: Arc<dyn CacheLoader>,
) -> StoreResult<Arc<V>> {
    match cache.get(key) {
        Ok(value) => return value.downcast::<V>().map_err(StoreError::from),
        Err(CacheError::NegativeHit) => return Err(CacheError::NegativeHit.into()),
        Err(_) => {}
    }
    let value = cache
        .get_or_load(key, &loader)
        .await
        .map_err(loader_error)?;
    if value.is_missing() {
        return Err(CacheError::NegativeHit.into());
    }
    value.downcast::<V>().map_err(StoreError::from)
}

/// List read: identical shape, but never produces a negative hit.
pub(crate) async fn read_list<V: Send + Sync + 'static>(
    cache: &Arc<dyn Cache>,
    key: &CacheKey,
    loader: Arc<dyn CacheLoader>,
) -> StoreResult<Arc<Vec<V>>> {
    match cache.get(key) {
        Ok(value) => return value.downcast::<Vec<V>>().map_err(StoreError::from),
        Err(CacheError::NegativeHit) => return Ok(Arc::new(Vec::new())),
        Err(_) => {}
    }
    let value = cache
        .get_or_load(key, &loader)
        .await
        .map_err(loader_error)?;
    value.downcast::<Vec<V>>().map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, Prefix};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> CacheKey {
        CacheKey::num(Prefix::User, 1)
    }

    #[tokio::test]
    async fn test_read_one_negative_on_no_rows() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let loader = EntityLoader::<i64>::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::NotFound) }
        });

        let first = read_one::<i64>(&cache, &key(), loader.clone()).await;
        assert!(matches!(
            first,
            Err(StoreError::Cache(CacheError::NegativeHit))
        ));
        // The negative entry answers the second read without a fetch.
        let second = read_one::<i64>(&cache, &key(), loader).await;
        assert!(matches!(
            second,
            Err(StoreError::Cache(CacheError::NegativeHit))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_one_propagates_store_errors() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());
        let loader =
            EntityLoader::<i64>::new(|| async { Err(StoreError::InvalidInput("bad".into())) });

        let result = read_one::<i64>(&cache, &key(), loader).await;
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));
        // Errors are not cached.
        assert!(matches!(
            cache.get(&key()),
            Err(CacheError::Miss)
        ));
    }

    #[tokio::test]
    async fn test_read_list_empty_is_not_negative() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());
        let loader = ListLoader::<i64>::new(|| async { Err(StoreError::NotFound) });

        let list = read_list::<i64>(&cache, &key(), loader).await.unwrap();
        assert!(list.is_empty());
        // Stored as a value, so a plain get succeeds.
        assert!(cache.get(&key()).is_ok());
    }

    #[tokio::test]
    async fn test_property_loader_hands_refresh_to_warmer() {
        let (tx, mut rx) = mpsc::channel(4);
        let loader = PropertyLoader::new(
            || async { Err(StoreError::NotFound) },
            Some(tx),
        );

        let sitekey_key = CacheKey::text(Prefix::PropertyBySitekey, "aabb");
        let current = CachedValue::of(42i64);
        let reloaded = loader.reload(&sitekey_key, current).await.unwrap();

        // The current value is extended and the site key queued for warmup.
        assert!(!reloaded.is_missing());
        assert_eq!(rx.recv().await.unwrap(), "aabb");
    }
}
