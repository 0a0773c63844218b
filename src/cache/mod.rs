//! # Caching Layer
//!
//! Provides the in-memory fabric between request handlers and the relational
//! store:
//! - `key`: typed composite cache keys with registrable prefixes
//! - `memory`: the bounded in-process cache with TTL, idle expiry,
//!   refresh-ahead, and negative caching
//! - `staged`: a transaction-scoped cache that defers mutations until the
//!   surrounding store transaction commits
//! - `replay`: per-puzzle redemption counters
//!
//! All cache implementations expose the same capability set through the
//! [`Cache`] trait so callers never care which one they hold.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod key;
pub mod memory;
pub mod replay;
pub mod staged;

pub use key::{register_prefix, CacheKey, Prefix};
pub use memory::{MemoryCache, MemoryCacheConfig};
pub use replay::ReplayCache;
pub use staged::StagedCache;

/// Cache errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not present at all.
    #[error("cache miss")]
    Miss,

    /// The key is present and confirmed absent at the source.
    #[error("negative cache hit")]
    NegativeHit,

    /// The cached value does not cast to the requested type.
    #[error("cached value has unexpected type")]
    InvalidType,

    /// `set` was called with the missing marker; use `set_missing`.
    #[error("cannot set the missing marker")]
    CannotSetMissing,

    /// Direct reads are not available on a transaction-staged cache.
    #[error("cache reads are unsupported inside a transaction")]
    TxUnsupported,
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// A cached value: either a shared opaque payload or the confirmed-absent
/// marker used for negative caching.
#[derive(Clone)]
pub enum CachedValue {
    /// A present value.
    Value(Arc<dyn Any + Send + Sync>),
    /// Confirmed absent at the source.
    Missing,
}

impl CachedValue {
    /// Wrap a concrete value.
    pub fn of<T: Send + Sync + 'static>(value: T) -> Self {
        CachedValue::Value(Arc::new(value))
    }

    /// Wrap an already shared value.
    pub fn shared<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        CachedValue::Value(value)
    }

    /// Whether this is the missing marker.
    pub fn is_missing(&self) -> bool {
        matches!(self, CachedValue::Missing)
    }

    /// Cast to the declared type.
    ///
    /// The missing marker surfaces as [`CacheError::NegativeHit`], a type
    /// mismatch as [`CacheError::InvalidType`].
    pub fn downcast<T: Send + Sync + 'static>(&self) -> CacheResult<Arc<T>> {
        match self {
            CachedValue::Missing => Err(CacheError::NegativeHit),
            CachedValue::Value(v) => v.clone().downcast().map_err(|_| CacheError::InvalidType),
        }
    }
}

impl std::fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachedValue::Missing => f.write_str("CachedValue::Missing"),
            CachedValue::Value(_) => f.write_str("CachedValue::Value(..)"),
        }
    }
}

/// A loader invoked by the cache on a miss and again on refresh-ahead.
///
/// A loader that observes "not found" at the source returns
/// [`CachedValue::Missing`] rather than an error; the cache then stores a
/// negative entry with the shorter negative TTL.
#[async_trait]
pub trait CacheLoader: Send + Sync {
    /// Fetch the value for a key from the source of truth.
    async fn load(&self, key: &CacheKey) -> anyhow::Result<CachedValue>;

    /// Refresh an entry that is past its refresh deadline.
    ///
    /// Defaults to a plain reload. Returning the current value extends it,
    /// a new value replaces it, the missing marker turns the entry negative,
    /// and an error leaves the existing value in place until idle expiry.
    async fn reload(&self, key: &CacheKey, _current: CachedValue) -> anyhow::Result<CachedValue> {
        self.load(key).await
    }
}

/// The capability set shared by every cache implementation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Look up a key without loading.
    fn get(&self, key: &CacheKey) -> CacheResult<CachedValue>;

    /// Look up a key, invoking the loader on a miss and caching the outcome.
    /// The loader is shared so refresh-ahead can retain it per entry.
    async fn get_or_load(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn CacheLoader>,
    ) -> anyhow::Result<CachedValue>;

    /// Store a value under the default policy.
    fn set(&self, key: &CacheKey, value: CachedValue) -> CacheResult<()>;

    /// Store a value with an explicit, non-sliding TTL.
    fn set_with_ttl(&self, key: &CacheKey, value: CachedValue, ttl: Duration) -> CacheResult<()>;

    /// Store the confirmed-absent marker under the negative TTL.
    fn set_missing(&self, key: &CacheKey);

    /// Replace the TTL of an existing entry; absent keys are ignored.
    fn set_ttl(&self, key: &CacheKey, ttl: Duration);

    /// Remove a key. Removing an absent key is a no-op.
    fn delete(&self, key: &CacheKey);

    /// Hits over hits plus misses, `0.0` when nothing was sampled.
    fn hit_ratio(&self) -> f64;
}
