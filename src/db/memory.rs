//! In-memory store backend.
//!
//! Implements the full [`StoreBackend`] surface over plain collections so
//! tests and local tooling can run the core without a database. A
//! transaction clones the current state, applies its writes to the clone,
//! and swaps the clone back in on commit; concurrent readers keep seeing the
//! pre-transaction state until then.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::models::*;
use super::{StoreBackend, StoreError, StoreResult, StoreTx};

#[derive(Default, Clone)]
struct MemState {
    next_id: i64,
    properties: Vec<Property>,
    api_keys: Vec<ApiKey>,
    users: Vec<User>,
    orgs: Vec<Org>,
    memberships: Vec<Membership>,
    subscriptions: Vec<Subscription>,
    audit: Vec<AuditLogEntry>,
    locks: HashMap<String, DateTime<Utc>>,
    cache_rows: HashMap<String, (Vec<u8>, DateTime<Utc>)>,
    tasks: Vec<AsyncTask>,
    notifications: Vec<ScheduledNotification>,
}

impl MemState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of [`StoreBackend`].
///
/// Cloning is cheap; clones observe the same state. A handle returned by
/// [`StoreBackend::begin`] owns a private snapshot instead.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemState>>,
    /// Set on transaction handles: where to publish the snapshot on commit.
    origin: Option<Arc<Mutex<MemState>>>,
    finished: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// A fresh, empty backend.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            origin: None,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed a subscription row directly; test conveniences only.
    pub fn put_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock();
        let id = state.next_id();
        let mut subscription = subscription;
        subscription.id = id;
        state.subscriptions.push(subscription);
    }

    /// Number of stored audit entries; test conveniences only.
    pub fn audit_len(&self) -> usize {
        self.state.lock().audit.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn begin(&self) -> StoreResult<Arc<dyn StoreTx>> {
        let snapshot = self.state.lock().clone();
        Ok(Arc::new(MemoryBackend {
            state: Arc::new(Mutex::new(snapshot)),
            origin: Some(self.state.clone()),
            finished: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn property_by_id(&self, id: i64) -> StoreResult<Property> {
        self.state
            .lock()
            .properties
            .iter()
            .find(|p| p.id == id && !p.is_deleted())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn property_by_sitekey(&self, sitekey: &str) -> StoreResult<Property> {
        self.state
            .lock()
            .properties
            .iter()
            .find(|p| p.sitekey == sitekey && !p.is_deleted())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn properties_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<Property>> {
        Ok(self
            .state
            .lock()
            .properties
            .iter()
            .filter(|p| ids.contains(&p.id) && !p.is_deleted())
            .cloned()
            .collect())
    }

    async fn properties_by_org(&self, org_id: i64) -> StoreResult<Vec<Property>> {
        Ok(self
            .state
            .lock()
            .properties
            .iter()
            .filter(|p| p.org_id == org_id && !p.is_deleted())
            .cloned()
            .collect())
    }

    async fn insert_property(&self, property: &NewProperty) -> StoreResult<Property> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let row = Property {
            id: state.next_id(),
            sitekey: property.sitekey.clone(),
            org_id: property.org_id,
            creator_id: property.creator_id,
            name: property.name.clone(),
            domain: property.domain.clone(),
            difficulty: property.difficulty,
            growth: property.growth,
            valid_from: property.valid_from,
            valid_until: property.valid_until,
            max_redemptions: property.max_redemptions,
            allow_subdomains: property.allow_subdomains,
            allow_localhost: property.allow_localhost,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        state.properties.push(row.clone());
        Ok(row)
    }

    async fn update_property(&self, property: &Property) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .properties
            .iter_mut()
            .find(|p| p.id == property.id && !p.is_deleted())
            .ok_or(StoreError::NotFound)?;
        *row = Property {
            updated_at: Utc::now(),
            ..property.clone()
        };
        Ok(())
    }

    async fn soft_delete_property(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .properties
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::NotFound)?;
        if row.is_deleted() {
            return Err(StoreError::SoftDeleted);
        }
        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn count_properties_by_org(&self, org_id: i64) -> StoreResult<i64> {
        Ok(self
            .state
            .lock()
            .properties
            .iter()
            .filter(|p| p.org_id == org_id && !p.is_deleted())
            .count() as i64)
    }

    async fn count_properties_by_user(&self, user_id: i64) -> StoreResult<i64> {
        let state = self.state.lock();
        let owned_orgs: Vec<i64> = state
            .orgs
            .iter()
            .filter(|o| o.user_id == user_id && o.deleted_at.is_none())
            .map(|o| o.id)
            .collect();
        Ok(state
            .properties
            .iter()
            .filter(|p| {
                !p.is_deleted() && (p.creator_id == user_id || owned_orgs.contains(&p.org_id))
            })
            .count() as i64)
    }

    async fn purge_deleted_properties(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut state = self.state.lock();
        let purged: Vec<i64> = state
            .properties
            .iter()
            .filter(|p| p.deleted_at.map_or(false, |at| at < cutoff))
            .map(|p| p.id)
            .collect();
        state.properties.retain(|p| !purged.contains(&p.id));
        Ok(purged)
    }

    async fn api_key_by_secret(&self, secret: &str) -> StoreResult<ApiKey> {
        self.state
            .lock()
            .api_keys
            .iter()
            .find(|k| k.secret == secret)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>> {
        Ok(self
            .state
            .lock()
            .api_keys
            .iter()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey> {
        let mut state = self.state.lock();
        let row = ApiKey {
            id: state.next_id(),
            secret: key.secret.clone(),
            org_id: key.org_id,
            user_id: key.user_id,
            scope: key.scope,
            enabled: true,
            rate_per_second: key.rate_per_second,
            burst: key.burst,
            expires_at: key.expires_at,
            read_only: key.read_only,
            created_at: Utc::now(),
        };
        state.api_keys.push(row.clone());
        Ok(row)
    }

    async fn update_api_key_secret(&self, id: i64, secret: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .api_keys
            .iter_mut()
            .find(|k| k.id == id)
            .ok_or(StoreError::NotFound)?;
        row.secret = secret.to_string();
        Ok(())
    }

    async fn set_api_key_enabled(&self, id: i64, enabled: bool) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .api_keys
            .iter_mut()
            .find(|k| k.id == id)
            .ok_or(StoreError::NotFound)?;
        row.enabled = enabled;
        Ok(())
    }

    async fn delete_api_key(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let before = state.api_keys.len();
        state.api_keys.retain(|k| k.id != id);
        if state.api_keys.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_api_keys_for_user(&self, user_id: i64) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock();
        let secrets: Vec<String> = state
            .api_keys
            .iter()
            .filter(|k| k.user_id == user_id)
            .map(|k| k.secret.clone())
            .collect();
        state.api_keys.retain(|k| k.user_id != user_id);
        Ok(secrets)
    }

    async fn user_by_id(&self, id: i64) -> StoreResult<User> {
        self.state
            .lock()
            .users
            .iter()
            .find(|u| u.id == id && u.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<User> {
        self.state
            .lock()
            .users
            .iter()
            .find(|u| u.email == email && u.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn insert_user(&self, user: &NewUser) -> StoreResult<User> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let row = User {
            id: state.next_id(),
            email: user.email.clone(),
            name: user.name.clone(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        state.users.push(row.clone());
        Ok(row)
    }

    async fn soft_delete_user(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(StoreError::NotFound)?;
        if row.deleted_at.is_some() {
            return Err(StoreError::SoftDeleted);
        }
        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn purge_deleted_users(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut state = self.state.lock();
        let purged: Vec<i64> = state
            .users
            .iter()
            .filter(|u| u.deleted_at.map_or(false, |at| at < cutoff))
            .map(|u| u.id)
            .collect();
        state.users.retain(|u| !purged.contains(&u.id));
        Ok(purged)
    }

    async fn org_by_id(&self, id: i64) -> StoreResult<Org> {
        self.state
            .lock()
            .orgs
            .iter()
            .find(|o| o.id == id && o.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn insert_org(&self, org: &NewOrg) -> StoreResult<Org> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let row = Org {
            id: state.next_id(),
            user_id: org.user_id,
            name: org.name.clone(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        state.orgs.push(row.clone());
        Ok(row)
    }

    async fn update_org(&self, org: &Org) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .orgs
            .iter_mut()
            .find(|o| o.id == org.id && o.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;
        *row = Org {
            updated_at: Utc::now(),
            ..org.clone()
        };
        Ok(())
    }

    async fn soft_delete_org(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .orgs
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(StoreError::NotFound)?;
        if row.deleted_at.is_some() {
            return Err(StoreError::SoftDeleted);
        }
        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn soft_delete_orgs_of_user(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut ids = Vec::new();
        for org in state
            .orgs
            .iter_mut()
            .filter(|o| o.user_id == user_id && o.deleted_at.is_none())
        {
            org.deleted_at = Some(now);
            ids.push(org.id);
        }
        Ok(ids)
    }

    async fn purge_deleted_orgs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut state = self.state.lock();
        let purged: Vec<i64> = state
            .orgs
            .iter()
            .filter(|o| o.deleted_at.map_or(false, |at| at < cutoff))
            .map(|o| o.id)
            .collect();
        state.orgs.retain(|o| !purged.contains(&o.id));
        state.memberships.retain(|m| !purged.contains(&m.org_id));
        Ok(purged)
    }

    async fn orgs_by_user(&self, user_id: i64) -> StoreResult<Vec<OrgWithLevel>> {
        let state = self.state.lock();
        let mut result = Vec::new();
        for org in state
            .orgs
            .iter()
            .filter(|o| o.deleted_at.is_none())
        {
            if org.user_id == user_id {
                result.push(OrgWithLevel {
                    org: org.clone(),
                    level: MembershipLevel::Owner,
                });
            } else if let Some(membership) = state
                .memberships
                .iter()
                .find(|m| m.org_id == org.id && m.user_id == user_id)
            {
                result.push(OrgWithLevel {
                    org: org.clone(),
                    level: membership.level,
                });
            }
        }
        Ok(result)
    }

    async fn users_by_org(&self, org_id: i64) -> StoreResult<Vec<Membership>> {
        Ok(self
            .state
            .lock()
            .memberships
            .iter()
            .filter(|m| m.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn org_with_level(&self, user_id: i64, org_id: i64) -> StoreResult<OrgWithLevel> {
        let state = self.state.lock();
        let org = state
            .orgs
            .iter()
            .find(|o| o.id == org_id && o.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound)?;
        if org.user_id == user_id {
            return Ok(OrgWithLevel {
                org,
                level: MembershipLevel::Owner,
            });
        }
        let membership = state
            .memberships
            .iter()
            .find(|m| m.org_id == org_id && m.user_id == user_id)
            .ok_or(StoreError::NotFound)?;
        Ok(OrgWithLevel {
            org,
            level: membership.level,
        })
    }

    async fn insert_membership(
        &self,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.memberships.retain(|m| !(m.org_id == org_id && m.user_id == user_id));
        state.memberships.push(Membership {
            org_id,
            user_id,
            level,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn update_membership_level(
        &self,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .memberships
            .iter_mut()
            .find(|m| m.org_id == org_id && m.user_id == user_id)
            .ok_or(StoreError::NotFound)?;
        row.level = level;
        Ok(())
    }

    async fn delete_membership(&self, org_id: i64, user_id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let before = state.memberships.len();
        state
            .memberships
            .retain(|m| !(m.org_id == org_id && m.user_id == user_id));
        if state.memberships.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn subscription_by_org(&self, org_id: i64) -> StoreResult<Subscription> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.org_id == org_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn expire_trials(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        for subscription in state.subscriptions.iter_mut() {
            if subscription.active && subscription.trial_ends_at.map_or(false, |at| at < now) {
                subscription.active = false;
                expired.push(subscription.clone());
            }
        }
        Ok(expired)
    }

    async fn insert_audit_entries(&self, entries: &[AuditLogEntry]) -> StoreResult<()> {
        self.state.lock().audit.extend_from_slice(entries);
        Ok(())
    }

    async fn audit_entries_for(
        &self,
        target_kind: &str,
        target_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<AuditLogEntry> = state
            .audit
            .iter()
            .filter(|e| e.target_kind == target_kind && e.target_id == target_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn acquire_lock(&self, name: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.lock();
        let now = Utc::now();
        if let Some(existing) = state.locks.get(name) {
            if *existing > now {
                return Err(StoreError::Locked(name.to_string()));
            }
        }
        state.locks.insert(name.to_string(), expires_at);
        Ok(())
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        self.state.lock().locks.remove(name);
        Ok(())
    }

    async fn delete_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let before = state.locks.len();
        state.locks.retain(|_, expires_at| *expires_at > now);
        Ok((before - state.locks.len()) as u64)
    }

    async fn upsert_cache_row(
        &self,
        key: &str,
        value: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.state
            .lock()
            .cache_rows
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn cache_row(&self, key: &str) -> StoreResult<Vec<u8>> {
        let state = self.state.lock();
        match state.cache_rows.get(key) {
            Some((value, expires_at)) if *expires_at > Utc::now() => Ok(value.clone()),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn delete_cache_row(&self, key: &str) -> StoreResult<()> {
        self.state.lock().cache_rows.remove(key);
        Ok(())
    }

    async fn delete_expired_cache_rows(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let before = state.cache_rows.len();
        state.cache_rows.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - state.cache_rows.len()) as u64)
    }

    async fn enqueue_task(&self, task: &AsyncTask) -> StoreResult<()> {
        self.state.lock().tasks.push(task.clone());
        Ok(())
    }

    async fn due_tasks(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<AsyncTask>> {
        let state = self.state.lock();
        let mut due: Vec<AsyncTask> = state
            .tasks
            .iter()
            .filter(|t| t.processed_at.is_none() && t.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn complete_task(&self, id: Uuid, output: Option<&[u8]>) -> StoreResult<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound)?;
        task.processed_at = Some(Utc::now());
        task.output = output.map(|o| o.to_vec());
        Ok(())
    }

    async fn reschedule_task(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        attempts: i32,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound)?;
        task.scheduled_at = scheduled_at;
        task.attempts = attempts;
        Ok(())
    }

    async fn schedule_notification(&self, notification: &NewNotification) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state
            .notifications
            .iter()
            .any(|n| n.reference_id == notification.reference_id)
        {
            return Ok(false);
        }
        let id = state.next_id();
        state.notifications.push(ScheduledNotification {
            id,
            user_id: notification.user_id,
            reference_id: notification.reference_id.clone(),
            template_hash: notification.template_hash,
            payload: notification.payload.clone(),
            scheduled_at: notification.scheduled_at,
            sent_at: None,
            persistent: notification.persistent,
            condition: notification.condition,
        });
        Ok(true)
    }

    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledNotification>> {
        let state = self.state.lock();
        let mut due: Vec<ScheduledNotification> = state
            .notifications
            .iter()
            .filter(|n| n.sent_at.is_none() && n.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn mark_notification_sent(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let row = state
            .notifications
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(StoreError::NotFound)?;
        row.sent_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryBackend {
    async fn commit(&self) -> StoreResult<()> {
        let origin = self.origin.as_ref().ok_or(StoreError::TxFinished)?;
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(StoreError::TxFinished);
        }
        let snapshot = self.state.lock().clone();
        *origin.lock() = snapshot;
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        if self.origin.is_none() || self.finished.swap(true, Ordering::SeqCst) {
            return Err(StoreError::TxFinished);
        }
        Ok(())
    }

    fn as_backend(self: Arc<Self>) -> Arc<dyn StoreBackend> {
        self
    }
}
