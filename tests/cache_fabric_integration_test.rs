//! End-to-end tests for the read-through cache fabric.

use std::sync::Arc;
use std::time::Duration;

use botwall::business::{BusinessConfig, BusinessService};
use botwall::cache::{CacheError, MemoryCacheConfig};
use botwall::context::Context;
use botwall::db::{
    Difficulty, GrowthClass, MemoryBackend, NewProperty, StoreBackend, StoreError,
};
use botwall::timeseries::MemoryTimeSeries;

fn service() -> (BusinessService, Arc<MemoryBackend>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(MemoryBackend::new());
    let service = BusinessService::new(
        backend.clone(),
        Arc::new(MemoryTimeSeries::new()),
        BusinessConfig {
            cache: MemoryCacheConfig {
                max_entries: 1024,
                idle_ttl: Duration::from_secs(300),
                negative_ttl: Duration::from_secs(300),
                refresh_interval: Duration::from_secs(300),
            },
            replay_entries: 64,
        },
    );
    (service, backend)
}

fn property(org_id: i64, name: &str, sitekey: &str) -> NewProperty {
    NewProperty {
        sitekey: sitekey.to_string(),
        org_id,
        creator_id: 1,
        name: name.to_string(),
        domain: "example.com".to_string(),
        difficulty: Difficulty::Normal,
        growth: GrowthClass::Linear,
        valid_from: None,
        valid_until: None,
        max_redemptions: 3,
        allow_subdomains: true,
        allow_localhost: false,
    }
}

#[tokio::test]
async fn test_cold_fetch_then_warm_then_soft_delete() {
    let (service, backend) = service();
    let ctx = Context::new("test");
    let store = service.handle();
    let sitekey = "aaaaaaaabbbbccccddddeeeeeeeeeeee";
    backend
        .insert_property(&property(10, "seeded", sitekey))
        .await
        .unwrap();

    // Cold: exactly one store load.
    let first = store.retrieve_property_by_sitekey(sitekey).await.unwrap();
    assert_eq!(first.sitekey, sitekey);
    assert_eq!(service.cache().loads(), 1);

    // Warm: zero additional loads.
    let second = store.retrieve_property_by_sitekey(sitekey).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(service.cache().loads(), 1);

    // Soft delete and re-read: a negative hit, backed by a missing entry.
    store.delete_property(&ctx, 1, first.id).await.unwrap();
    assert!(matches!(
        store.retrieve_property_by_sitekey(sitekey).await,
        Err(StoreError::Cache(CacheError::NegativeHit))
    ));
    // Still no extra load; the missing entry answered.
    assert_eq!(service.cache().loads(), 1);
}

#[tokio::test]
async fn test_bulk_read_with_partial_hits() {
    let (service, backend) = service();
    let store = service.handle();
    let a = backend
        .insert_property(&property(10, "a", &"aa".repeat(16)))
        .await
        .unwrap();
    let b = backend
        .insert_property(&property(10, "b", &"bb".repeat(16)))
        .await
        .unwrap();
    let c = backend
        .insert_property(&property(10, "c", &"cc".repeat(16)))
        .await
        .unwrap();
    let missing_id = 9_999;

    // Prewarm A and B.
    store.retrieve_property(a.id).await.unwrap();
    store.retrieve_property(b.id).await.unwrap();
    let loads_before = service.cache().loads();

    let outcome = store
        .retrieve_properties_bulk(
            &[(a.id, 1), (b.id, 1), (c.id, 5), (missing_id, 1)],
            1,
        )
        .await
        .unwrap();

    let mut cached: Vec<i64> = outcome.cached.iter().map(|p| p.id).collect();
    cached.sort_unstable();
    assert_eq!(cached, vec![a.id, b.id]);
    let fetched: Vec<i64> = outcome.fetched.iter().map(|p| p.id).collect();
    assert_eq!(fetched, vec![c.id]);
    // The bulk path issues its single multi-key query outside the per-key
    // loader, so the per-key load counter does not move.
    assert_eq!(service.cache().loads(), loads_before);

    // C is now hot; the unknown ID went negative and is dropped silently.
    let outcome = store
        .retrieve_properties_bulk(&[(c.id, 1), (missing_id, 1)], 1)
        .await
        .unwrap();
    assert_eq!(outcome.cached.len(), 1);
    assert!(outcome.fetched.is_empty());
}

#[tokio::test]
async fn test_puzzle_redemption_budget() {
    let (service, _backend) = service();
    let replay = service.replay();
    let ttl = Duration::from_secs(60);

    assert!(replay.check_count(42, 3));
    assert_eq!(replay.inc(42, ttl), 1);
    assert_eq!(replay.inc(42, ttl), 2);
    assert_eq!(replay.inc(42, ttl), 3);
    assert!(!replay.check_count(42, 3));

    // Counters are per ID.
    assert!(replay.check_count(43, 3));
}

