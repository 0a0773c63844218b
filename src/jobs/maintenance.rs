//! Concrete maintenance jobs.
//!
//! These are the periodic chores the core owns: garbage collection of
//! tombstoned rows and lapsed leases, property cache warmup, scheduled
//! notification dispatch, trial expiry, and the async-task pump. Each of
//! them is meant to be registered through [`super::LockedJob`] in a
//! multi-instance deployment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::business::ckeys;
use crate::cache::{Cache, CachedValue, MemoryCache};
use crate::context::Context;
use crate::db::{
    MembershipLevel, NewNotification, Property, ScheduledNotification, StoreBackend, StoreError,
    SubscriptionCondition,
};
use crate::timeseries::TimeSeries;

use super::{JobParams, OneOffJob, PeriodicJob};

/// Template hash used for trial-expiry notifications.
const TRIAL_EXPIRED_TEMPLATE: i64 = 0x7472_6961;

/// Garbage collection: hard-delete rows tombstoned longer than the
/// retention window, cascade their analytics data, and drop lapsed leases
/// and expired session rows.
pub struct GcJob {
    backend: Arc<dyn StoreBackend>,
    timeseries: Arc<dyn TimeSeries>,
    retention: Duration,
}

impl GcJob {
    /// Build the job with the given tombstone retention window.
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        timeseries: Arc<dyn TimeSeries>,
        retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            timeseries,
            retention,
        })
    }
}

#[async_trait]
impl OneOffJob for GcJob {
    fn name(&self) -> &'static str {
        "gc"
    }

    async fn run_once(&self, ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(30));

        let properties = self.backend.purge_deleted_properties(cutoff).await?;
        if !properties.is_empty() {
            self.timeseries.delete_property_data(&properties).await?;
        }
        let orgs = self.backend.purge_deleted_orgs(cutoff).await?;
        if !orgs.is_empty() {
            self.timeseries.delete_org_data(&orgs).await?;
        }
        let users = self.backend.purge_deleted_users(cutoff).await?;
        if !users.is_empty() {
            self.timeseries.delete_user_data(&users).await?;
        }
        let locks = self.backend.delete_expired_locks(now).await?;
        let cache_rows = self.backend.delete_expired_cache_rows(now).await?;

        log::info!(
            "{}: purged {} properties, {} orgs, {} users, {} locks, {} cache rows",
            ctx,
            properties.len(),
            orgs.len(),
            users.len(),
            locks,
            cache_rows
        );
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for GcJob {
    fn interval(&self) -> Duration {
        Duration::from_secs(60 * 60)
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }
}

/// Property cache warmup.
///
/// Serves two inputs: site keys handed over by refresh-ahead on the serving
/// path, and the recently busiest properties from the analytics store. Both
/// end up as fresh entries under the property's ID and site-key cache keys.
pub struct WarmupJob {
    cache: MemoryCache,
    backend: Arc<dyn StoreBackend>,
    timeseries: Arc<dyn TimeSeries>,
    requests: tokio::sync::Mutex<mpsc::Receiver<String>>,
    top_limit: usize,
}

impl WarmupJob {
    /// Build the job; the returned sender is the warmup queue to hand to
    /// [`crate::business::BusinessService::attach_warmer`].
    pub fn new(
        cache: MemoryCache,
        backend: Arc<dyn StoreBackend>,
        timeseries: Arc<dyn TimeSeries>,
        top_limit: usize,
    ) -> (Arc<Self>, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            Arc::new(Self {
                cache,
                backend,
                timeseries,
                requests: tokio::sync::Mutex::new(rx),
                top_limit,
            }),
            tx,
        )
    }

    fn cache_property(&self, property: &Property) {
        let shared = Arc::new(property.clone());
        if let Err(e) = self.cache.set(
            &ckeys::property_id(property.id),
            CachedValue::shared(shared.clone()),
        ) {
            log::warn!("warmup: failed to cache property {}: {}", property.id, e);
        }
        if let Err(e) = self.cache.set(
            &ckeys::property_sitekey(&property.sitekey),
            CachedValue::shared(shared),
        ) {
            log::warn!("warmup: failed to cache property {}: {}", property.sitekey, e);
        }
    }
}

#[async_trait]
impl OneOffJob for WarmupJob {
    fn name(&self) -> &'static str {
        "cache-warmup"
    }

    async fn run_once(&self, ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
        // Refresh the entries the serving path asked for.
        let mut requested = 0usize;
        {
            let mut rx = self.requests.lock().await;
            while let Ok(sitekey) = rx.try_recv() {
                requested += 1;
                match self.backend.property_by_sitekey(&sitekey).await {
                    Ok(property) => self.cache_property(&property),
                    Err(StoreError::NotFound) => {
                        self.cache.set_missing(&ckeys::property_sitekey(&sitekey));
                    }
                    Err(e) => log::warn!("{}: warmup fetch of '{}' failed: {}", ctx, sitekey, e),
                }
            }
        }

        // Pre-warm the busiest properties of the last day.
        let top = self
            .timeseries
            .retrieve_recent_top_properties(self.top_limit)
            .await?;
        if !top.is_empty() {
            let ids: Vec<i64> = top.iter().map(|t| t.property_id).collect();
            for property in self.backend.properties_by_ids(&ids).await? {
                self.cache_property(&property);
            }
        }

        log::debug!("{}: warmed {} requested and {} top properties", ctx, requested, top.len());
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for WarmupJob {
    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Trial expiry: deactivate lapsed trials and queue the notification.
pub struct TrialExpiryJob {
    backend: Arc<dyn StoreBackend>,
    cache: MemoryCache,
}

impl TrialExpiryJob {
    /// Build the job.
    pub fn new(backend: Arc<dyn StoreBackend>, cache: MemoryCache) -> Arc<Self> {
        Arc::new(Self { backend, cache })
    }
}

#[async_trait]
impl OneOffJob for TrialExpiryJob {
    fn name(&self) -> &'static str {
        "trial-expiry"
    }

    async fn run_once(&self, ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
        let expired = self.backend.expire_trials(Utc::now()).await?;
        for subscription in &expired {
            self.cache
                .delete(&ckeys::subscription(subscription.org_id));

            let org = match self.backend.org_by_id(subscription.org_id).await {
                Ok(org) => org,
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            // The reference ID keeps a retried run from double-notifying.
            self.backend
                .schedule_notification(&NewNotification {
                    user_id: org.user_id,
                    reference_id: format!("trial-expired-{}", subscription.org_id),
                    template_hash: TRIAL_EXPIRED_TEMPLATE,
                    payload: serde_json::json!({
                        "org_id": subscription.org_id,
                        "plan": subscription.plan,
                    }),
                    scheduled_at: Utc::now(),
                    persistent: true,
                    condition: SubscriptionCondition::WithoutSubscription,
                })
                .await?;
        }
        if !expired.is_empty() {
            log::info!("{}: expired {} trials", ctx, expired.len());
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for TrialExpiryJob {
    fn interval(&self) -> Duration {
        Duration::from_secs(60 * 60)
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }
}

/// Delivers rendered notifications; implemented by the mailer outside the
/// core.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Deliver one notification.
    async fn send(&self, notification: &ScheduledNotification) -> anyhow::Result<()>;
}

/// Scheduled-notification dispatch.
pub struct NotifyJob {
    backend: Arc<dyn StoreBackend>,
    sender: Arc<dyn NotificationSender>,
    batch_size: i64,
}

impl NotifyJob {
    /// Build the job.
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        sender: Arc<dyn NotificationSender>,
        batch_size: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            sender,
            batch_size,
        })
    }

    async fn has_active_subscription(&self, user_id: i64) -> anyhow::Result<bool> {
        for owned in self.backend.orgs_by_user(user_id).await? {
            if owned.level != MembershipLevel::Owner {
                continue;
            }
            match self.backend.subscription_by_org(owned.org.id).await {
                Ok(subscription) if subscription.active => return Ok(true),
                Ok(_) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl OneOffJob for NotifyJob {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn run_once(&self, ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
        let due = self.backend.due_notifications(Utc::now(), self.batch_size).await?;
        for notification in due {
            let eligible = match notification.condition {
                SubscriptionCondition::Any => true,
                SubscriptionCondition::WithSubscription => {
                    self.has_active_subscription(notification.user_id).await?
                }
                SubscriptionCondition::WithoutSubscription => {
                    !self.has_active_subscription(notification.user_id).await?
                }
            };

            if eligible {
                if let Err(e) = self.sender.send(&notification).await {
                    log::error!("{}: failed to send notification {}: {:#}", ctx, notification.id, e);
                    // Leave it unsent; the next tick retries.
                    continue;
                }
            } else {
                log::debug!(
                    "{}: suppressing notification {} by subscription condition",
                    ctx,
                    notification.id
                );
            }
            self.backend.mark_notification_sent(notification.id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for NotifyJob {
    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Executes one kind of deferred work from the async-task table.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process a task's input, returning its output blob.
    async fn handle(&self, ctx: &Context, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// The async-task pump: claims due tasks and runs their handlers.
pub struct TaskJob {
    backend: Arc<dyn StoreBackend>,
    handlers: Mutex<HashMap<String, Arc<dyn TaskHandler>>>,
    batch_size: i64,
    max_attempts: i32,
    retry_delay: Duration,
}

impl TaskJob {
    /// Build the pump.
    pub fn new(backend: Arc<dyn StoreBackend>, batch_size: i64, max_attempts: i32) -> Arc<Self> {
        Arc::new(Self {
            backend,
            handlers: Mutex::new(HashMap::new()),
            batch_size,
            max_attempts,
            retry_delay: Duration::from_secs(60),
        })
    }

    /// Register a handler for a task tag. Registration is allowed at any
    /// time and is serialised by the registry lock.
    pub fn register_handler(&self, tag: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.lock().insert(tag.to_string(), handler);
    }
}

#[async_trait]
impl OneOffJob for TaskJob {
    fn name(&self) -> &'static str {
        "task-pump"
    }

    async fn run_once(&self, ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
        let due = self.backend.due_tasks(Utc::now(), self.batch_size).await?;
        for task in due {
            let handler = self.handlers.lock().get(&task.handler).cloned();
            let Some(handler) = handler else {
                log::error!("{}: no handler for task tag '{}'", ctx, task.handler);
                self.backend.complete_task(task.id, None).await?;
                continue;
            };

            match handler.handle(ctx, &task.input).await {
                Ok(output) => {
                    self.backend.complete_task(task.id, Some(&output)).await?;
                }
                Err(e) => {
                    let attempts = task.attempts + 1;
                    if attempts >= self.max_attempts {
                        log::error!(
                            "{}: task {} failed permanently after {} attempts: {:#}",
                            ctx,
                            task.id,
                            attempts,
                            e
                        );
                        self.backend.complete_task(task.id, None).await?;
                    } else {
                        log::warn!("{}: task {} failed (attempt {}): {:#}", ctx, task.id, attempts, e);
                        let delay = self.retry_delay * attempts as u32;
                        let next = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        self.backend.reschedule_task(task.id, next, attempts).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for TaskJob {
    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs(5)
    }
}
