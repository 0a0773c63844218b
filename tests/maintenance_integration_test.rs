//! Maintenance mode flips a process-wide flag, so this test runs in its own
//! binary and must stay the only test here.

use std::sync::Arc;

use botwall::business::{maintenance_mode, set_maintenance, BusinessConfig, BusinessService};
use botwall::db::{Difficulty, GrowthClass, MemoryBackend, NewProperty, StoreBackend, StoreError};
use botwall::timeseries::MemoryTimeSeries;

#[tokio::test]
async fn test_maintenance_mode_serves_hot_reads_only() {
    let backend = Arc::new(MemoryBackend::new());
    let service = BusinessService::new(
        backend.clone(),
        Arc::new(MemoryTimeSeries::new()),
        BusinessConfig::default(),
    );
    let sitekey = "ee".repeat(16);
    backend
        .insert_property(&NewProperty {
            sitekey: sitekey.clone(),
            org_id: 10,
            creator_id: 1,
            name: "hot".to_string(),
            domain: "example.com".to_string(),
            difficulty: Difficulty::Normal,
            growth: GrowthClass::Linear,
            valid_from: None,
            valid_until: None,
            max_redemptions: 3,
            allow_subdomains: true,
            allow_localhost: false,
        })
        .await
        .unwrap();

    // Warm the cache while the store is reachable.
    service
        .handle()
        .retrieve_property_by_sitekey(&sitekey)
        .await
        .unwrap();

    assert!(!maintenance_mode());
    set_maintenance(true);
    let handle = service.handle();

    // The hot read keeps serving; anything needing the store fails fast.
    assert!(handle.retrieve_property_by_sitekey(&sitekey).await.is_ok());
    assert!(matches!(
        handle.retrieve_property_by_sitekey(&"ff".repeat(16)).await,
        Err(StoreError::Maintenance)
    ));

    // Handles created before the flag keep their backend; the flag gates
    // handle creation, not in-flight work.
    set_maintenance(false);
    assert!(service
        .handle()
        .retrieve_property_by_sitekey(&"ff".repeat(16))
        .await
        .is_err());
}
