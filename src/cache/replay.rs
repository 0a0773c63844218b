//! Puzzle-redemption counters.
//!
//! Each issued puzzle carries an opaque 64-bit ID and may be redeemed at
//! most N times. The counter for an ID lives in its own bounded cache
//! instance and expires a fixed interval after the first redemption, so an
//! attacker replaying an old puzzle eventually just sees it vanish along
//! with its budget.

use std::time::Duration;

use super::memory::{Compute, MemoryCache, MemoryCacheConfig};
use super::{register_prefix, CacheKey, CachedValue, Prefix};

/// Bounded map of puzzle ID to redemption counter.
pub struct ReplayCache {
    cache: MemoryCache,
    prefix: Prefix,
}

impl ReplayCache {
    /// Create a replay cache bounded to `max_entries` counters.
    pub fn new(max_entries: usize) -> Self {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_entries,
            ..MemoryCacheConfig::default()
        });
        Self {
            cache,
            prefix: register_prefix("puzzle-redemption"),
        }
    }

    fn key(&self, id: u64) -> CacheKey {
        CacheKey::text(self.prefix, format!("{:x}", id))
    }

    /// Whether the puzzle still has redemption budget left.
    pub fn check_count(&self, id: u64, max: u32) -> bool {
        self.count(id) < max
    }

    /// Current counter value; absent entries count as zero.
    pub fn count(&self, id: u64) -> u32 {
        let key = self.key(id);
        self.cache
            .compute(&key, |_| Compute::Keep)
            .and_then(|v| v.downcast::<u32>().ok())
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Atomically increment the counter, returning the new value.
    ///
    /// The first increment pins an absolute TTL of `ttl` on the entry; later
    /// increments never extend it.
    pub fn inc(&self, id: u64, ttl: Duration) -> u32 {
        let key = self.key(id);
        let value = self.cache.compute(&key, |current| {
            let next = match current.and_then(|v| v.downcast::<u32>().ok()) {
                Some(n) => n.saturating_add(1),
                None => 1,
            };
            let pin_ttl = (next == 1).then_some(ttl);
            Compute::Put(CachedValue::of(next), pin_ttl)
        });
        value
            .and_then(|v| v.downcast::<u32>().ok())
            .map(|v| *v)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redemption_budget() {
        let replay = ReplayCache::new(16);
        assert!(replay.check_count(42, 3));
        assert_eq!(replay.inc(42, Duration::from_secs(60)), 1);
        assert_eq!(replay.inc(42, Duration::from_secs(60)), 2);
        assert!(replay.check_count(42, 3));
        assert_eq!(replay.inc(42, Duration::from_secs(60)), 3);
        assert!(!replay.check_count(42, 3));
    }

    #[test]
    fn test_first_write_pins_ttl() {
        let replay = ReplayCache::new(16);
        replay.inc(7, Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(20));
        // Later increments do not extend the deadline.
        replay.inc(7, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(replay.count(7), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_lose_updates() {
        use std::sync::Arc;

        let replay = Arc::new(ReplayCache::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let replay = replay.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    replay.inc(99, Duration::from_secs(60));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(replay.count(99), 200);
    }

    #[test]
    fn test_ids_are_independent() {
        let replay = ReplayCache::new(16);
        replay.inc(1, Duration::from_secs(60));
        assert_eq!(replay.count(2), 0);
    }
}
