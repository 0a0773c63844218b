//! # Business Store
//!
//! The domain API the request handlers call. Every operation fits one of
//! three shapes:
//! - Read-one-by-key: a single-entity reader wired to a store fetch
//! - Read-many-by-keys: the bulk reader
//! - Write: mutate the store, then update or invalidate the affected cache
//!   keys and emit an audit event where applicable
//!
//! Writes that span multiple statements run under [`BusinessStore::with_tx`],
//! which stages cache mutations and applies them only after the store
//! transaction commits.
//!
//! Maintenance mode is a process-wide flag: while it is on, handles carry no
//! store backend, every write and cache-miss path fails with
//! [`StoreError::Maintenance`], and reads the cache can satisfy still work.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::audit::{AuditEvent, AuditLog};
use crate::cache::{
    Cache, CacheKey, MemoryCache, MemoryCacheConfig, Prefix, ReplayCache, StagedCache,
};
use crate::context::Context;
use crate::db::{StoreBackend, StoreError, StoreResult};
use crate::timeseries::TimeSeries;

mod accounts;
mod apikeys;
mod bulk;
mod misc;
mod properties;
pub(crate) mod reader;
mod validate;

pub use apikeys::ApiKeyParams;
pub use bulk::{BulkInput, BulkOutcome};
pub use properties::PropertyParams;
pub use reader::{EntityLoader, ListLoader, PropertyLoader};
pub use validate::{validate_org_name, validate_property_name};

/// Process-wide maintenance flag.
static MAINTENANCE: AtomicBool = AtomicBool::new(false);

/// Turn maintenance mode on or off.
pub fn set_maintenance(on: bool) {
    MAINTENANCE.store(on, Ordering::SeqCst);
    log::warn!("maintenance mode {}", if on { "enabled" } else { "disabled" });
}

/// Whether maintenance mode is on.
pub fn maintenance_mode() -> bool {
    MAINTENANCE.load(Ordering::SeqCst)
}

/// Cache key constructors for the domain namespaces.
pub(crate) mod ckeys {
    use super::{CacheKey, Prefix};

    pub fn user(id: i64) -> CacheKey {
        CacheKey::num(Prefix::User, id)
    }

    pub fn api_key(secret: &str) -> CacheKey {
        CacheKey::text(Prefix::ApiKey, secret)
    }

    pub fn org(id: i64) -> CacheKey {
        CacheKey::num(Prefix::Org, id)
    }

    pub fn org_properties(org_id: i64) -> CacheKey {
        CacheKey::num(Prefix::OrgProperties, org_id)
    }

    pub fn property_id(id: i64) -> CacheKey {
        CacheKey::num(Prefix::PropertyById, id)
    }

    pub fn property_sitekey(sitekey: &str) -> CacheKey {
        CacheKey::text(Prefix::PropertyBySitekey, sitekey)
    }

    pub fn user_orgs(user_id: i64) -> CacheKey {
        CacheKey::num(Prefix::UserOrgs, user_id)
    }

    pub fn org_users(org_id: i64) -> CacheKey {
        CacheKey::num(Prefix::OrgUsers, org_id)
    }

    pub fn user_api_keys(user_id: i64) -> CacheKey {
        CacheKey::num(Prefix::UserApiKeys, user_id)
    }

    pub fn subscription(org_id: i64) -> CacheKey {
        CacheKey::num(Prefix::Subscription, org_id)
    }

    pub fn notification(user_id: i64) -> CacheKey {
        CacheKey::num(Prefix::Notification, user_id)
    }

    pub fn property_audit_logs(property_id: i64) -> CacheKey {
        CacheKey::num(Prefix::PropertyAuditLogs, property_id)
    }

    pub fn org_audit_logs(org_id: i64) -> CacheKey {
        CacheKey::num(Prefix::OrgAuditLogs, org_id)
    }

    pub fn user_audit_logs(user_id: i64) -> CacheKey {
        CacheKey::num(Prefix::UserAuditLogs, user_id)
    }

    pub fn org_properties_count(org_id: i64) -> CacheKey {
        CacheKey::num(Prefix::OrgPropertiesCount, org_id)
    }

    pub fn user_properties_count(user_id: i64) -> CacheKey {
        CacheKey::num(Prefix::UserPropertiesCount, user_id)
    }

    pub fn user_account_stats(user_id: i64) -> CacheKey {
        CacheKey::num(Prefix::UserAccountStats, user_id)
    }

    pub fn property_stats(org_id: i64, property_id: i64, tag: &str) -> CacheKey {
        CacheKey::text(Prefix::PropertyStats, format!("{}/{}/{}", org_id, property_id, tag))
    }
}

/// Settings for [`BusinessService`].
#[derive(Debug, Clone, Default)]
pub struct BusinessConfig {
    /// In-memory cache tuning.
    pub cache: MemoryCacheConfig,
    /// Maximum number of live puzzle-redemption counters.
    pub replay_entries: usize,
}

impl BusinessConfig {
    fn replay_entries(&self) -> usize {
        if self.replay_entries == 0 {
            1_000_000
        } else {
            self.replay_entries
        }
    }
}

/// Long-lived owner of the cache, the replay counters, and the store handle.
pub struct BusinessService {
    cache: MemoryCache,
    replay: Arc<ReplayCache>,
    backend: Arc<dyn StoreBackend>,
    timeseries: Arc<dyn TimeSeries>,
    audit: Mutex<Option<Arc<AuditLog>>>,
    warmer: Mutex<Option<mpsc::Sender<String>>>,
}

impl BusinessService {
    /// Build the service over a store backend and a time-series facade.
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        timeseries: Arc<dyn TimeSeries>,
        config: BusinessConfig,
    ) -> Self {
        Self {
            cache: MemoryCache::new(config.cache.clone()),
            replay: Arc::new(ReplayCache::new(config.replay_entries())),
            backend,
            timeseries,
            audit: Mutex::new(None),
            warmer: Mutex::new(None),
        }
    }

    /// Wire the audit sink; writes emit events into it from then on.
    pub fn attach_audit(&self, audit: Arc<AuditLog>) {
        *self.audit.lock() = Some(audit);
    }

    /// Wire the property warmup queue; refresh-ahead on site-key entries
    /// hands re-queries to it instead of blocking the serving path.
    pub fn attach_warmer(&self, warmer: mpsc::Sender<String>) {
        *self.warmer.lock() = Some(warmer);
    }

    /// The shared in-memory cache.
    pub fn cache(&self) -> &MemoryCache {
        &self.cache
    }

    /// The puzzle-redemption counters.
    pub fn replay(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    /// The raw store backend, for jobs that bypass the domain surface.
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// The time-series facade.
    pub fn timeseries(&self) -> &Arc<dyn TimeSeries> {
        &self.timeseries
    }

    /// An operating handle. Under maintenance mode the handle carries no
    /// backend, so cache-satisfiable reads keep working while everything
    /// else fails fast.
    pub fn handle(&self) -> BusinessStore {
        let backend = if maintenance_mode() {
            None
        } else {
            Some(self.backend.clone())
        };
        BusinessStore {
            cache: Arc::new(self.cache.clone()),
            live: self.cache.clone(),
            backend,
            replay: self.replay.clone(),
            timeseries: self.timeseries.clone(),
            audit_sink: self.audit.lock().clone(),
            tx_events: None,
            warmer: self.warmer.lock().clone(),
        }
    }
}

/// One operating handle over the business domain.
///
/// Cheap to construct; request handlers take a fresh one per request via
/// [`BusinessService::handle`]. Inside [`BusinessStore::with_tx`] the handle
/// wraps the open transaction and a staged cache instead.
#[derive(Clone)]
pub struct BusinessStore {
    /// The cache all reads and writes go through; staged inside a transaction.
    cache: Arc<dyn Cache>,
    /// The live in-memory cache, for mutations that must bypass staging.
    live: MemoryCache,
    /// The store, absent under maintenance mode.
    backend: Option<Arc<dyn StoreBackend>>,
    replay: Arc<ReplayCache>,
    timeseries: Arc<dyn TimeSeries>,
    /// Audit sink for writes outside a transaction.
    audit_sink: Option<Arc<AuditLog>>,
    /// Inside a transaction: events collected for post-commit forwarding.
    tx_events: Option<Arc<Mutex<Vec<AuditEvent>>>>,
    /// Property warmup queue, when the warmup job is running.
    warmer: Option<mpsc::Sender<String>>,
}

impl BusinessStore {
    /// The store backend, or [`StoreError::Maintenance`] when unavailable.
    pub(crate) fn backend(&self) -> StoreResult<&Arc<dyn StoreBackend>> {
        self.backend.as_ref().ok_or(StoreError::Maintenance)
    }

    /// Optional backend for loader closures; they fail with
    /// [`StoreError::Maintenance`] only when the cache could not answer.
    pub(crate) fn backend_opt(&self) -> Option<Arc<dyn StoreBackend>> {
        self.backend.clone()
    }

    pub(crate) fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub(crate) fn live(&self) -> &MemoryCache {
        &self.live
    }

    pub(crate) fn timeseries(&self) -> &Arc<dyn TimeSeries> {
        &self.timeseries
    }

    pub(crate) fn warmer(&self) -> Option<mpsc::Sender<String>> {
        self.warmer.clone()
    }

    /// The puzzle-redemption counters.
    pub fn replay(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    /// Whether this handle runs inside a transaction.
    pub fn in_tx(&self) -> bool {
        self.tx_events.is_some()
    }

    /// Emit an audit event: queued for post-commit forwarding inside a
    /// transaction, recorded directly otherwise.
    pub(crate) async fn record_event(&self, ctx: &Context, event: AuditEvent) {
        if let Some(collector) = &self.tx_events {
            collector.lock().push(event);
            return;
        }
        if let Some(sink) = &self.audit_sink {
            if let Err(e) = sink.record(ctx, event).await {
                log::warn!("{}: failed to record audit event: {}", ctx, e);
            }
        }
    }

    /// Run `f` inside a store transaction with a staged cache.
    ///
    /// On success the transaction commits first, then the staged cache
    /// mutations are applied to the live cache; audit events emitted inside
    /// `f` are returned for the caller to forward to the audit sink after
    /// commit. On error the transaction rolls back and the staged mutations
    /// are discarded.
    pub async fn with_tx<T, F, Fut>(&self, f: F) -> StoreResult<(T, Vec<AuditEvent>)>
    where
        F: FnOnce(BusinessStore) -> Fut,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let backend = self.backend()?.clone();
        let tx = backend.begin().await?;
        let staged = Arc::new(StagedCache::new());
        let events = Arc::new(Mutex::new(Vec::new()));

        let child = BusinessStore {
            cache: staged.clone(),
            live: self.live.clone(),
            backend: Some(tx.clone().as_backend()),
            replay: self.replay.clone(),
            timeseries: self.timeseries.clone(),
            audit_sink: None,
            tx_events: Some(events.clone()),
            warmer: self.warmer.clone(),
        };

        match f(child).await {
            Ok(value) => {
                tx.commit().await?;
                staged.commit(&self.live);
                let events = std::mem::take(&mut *events.lock());
                Ok((value, events))
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    log::warn!("transaction rollback failed: {}", rollback_error);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::db::MemoryBackend;
    use crate::timeseries::MemoryTimeSeries;
    use std::time::Duration;

    pub fn service() -> (BusinessService, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let service = BusinessService::new(
            backend.clone(),
            Arc::new(MemoryTimeSeries::new()),
            BusinessConfig {
                cache: MemoryCacheConfig {
                    max_entries: 1024,
                    idle_ttl: Duration::from_secs(60),
                    negative_ttl: Duration::from_secs(60),
                    refresh_interval: Duration::from_secs(60),
                },
                replay_entries: 64,
            },
        );
        (service, backend)
    }
}
