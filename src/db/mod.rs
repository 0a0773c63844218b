//! # Relational Store Layer
//!
//! The core depends on a deliberately narrow query surface: single-row fetch
//! by numeric ID, single-row fetch by external string ID, multi-row fetch by
//! ID set, owner-filtered writes, soft-delete, hard-delete with an age
//! filter, a conflict-on-name lock upsert, and generic cache upserts with
//! TTL. [`StoreBackend`] captures that surface; `postgres` implements it over
//! a connection pool and `memory` provides the in-process double the tests
//! run against.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::CacheError;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryBackend;
pub use models::*;
pub use postgres::{PgBackend, PgConfig};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// A precondition failed at the API surface.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The store has no such row.
    #[error("row not found")]
    NotFound,

    /// The row exists but carries a tombstone.
    #[error("row is soft-deleted")]
    SoftDeleted,

    /// The caller's access level is insufficient.
    #[error("permission denied")]
    PermissionDenied,

    /// A name already exists within its scope.
    #[error("duplicate name in scope")]
    DuplicateName,

    /// The named lease is held by another instance.
    #[error("lock '{0}' is already held")]
    Locked(String),

    /// A write or cache-miss path ran while maintenance mode was on.
    #[error("maintenance mode is active")]
    Maintenance,

    /// Connecting to the store exceeded the deadline.
    #[error("store connection timed out")]
    ConnectionTimeout,

    /// The transaction handle was used after commit or rollback.
    #[error("transaction already finished")]
    TxFinished,

    /// A cache-layer error surfaced through a read helper.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Session or payload encoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// A loader returned an error the read helpers could not classify.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::PoolTimedOut => StoreError::ConnectionTimeout,
            e => StoreError::Database(e),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The narrow query surface the core needs from the relational store.
///
/// Both the pooled backend and an open transaction implement this, so the
/// business layer runs the same code inside and outside a transaction.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Open a transaction. Transaction handles implement [`StoreBackend`]
    /// themselves and must be finished with commit or rollback.
    async fn begin(&self) -> StoreResult<Arc<dyn StoreTx>>;

    /// Connectivity check.
    async fn ping(&self) -> StoreResult<()>;

    // Properties

    /// Fetch a live property by numeric ID.
    async fn property_by_id(&self, id: i64) -> StoreResult<Property>;
    /// Fetch a live property by site key.
    async fn property_by_sitekey(&self, sitekey: &str) -> StoreResult<Property>;
    /// Fetch live properties for an ID set; absent IDs are simply not returned.
    async fn properties_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<Property>>;
    /// All live properties of an organization.
    async fn properties_by_org(&self, org_id: i64) -> StoreResult<Vec<Property>>;
    /// Insert a property.
    async fn insert_property(&self, property: &NewProperty) -> StoreResult<Property>;
    /// Update a property's mutable fields.
    async fn update_property(&self, property: &Property) -> StoreResult<()>;
    /// Set the soft-delete tombstone.
    async fn soft_delete_property(&self, id: i64) -> StoreResult<()>;
    /// Count live properties of an organization.
    async fn count_properties_by_org(&self, org_id: i64) -> StoreResult<i64>;
    /// Count live properties a user owns or created.
    async fn count_properties_by_user(&self, user_id: i64) -> StoreResult<i64>;
    /// Hard-delete properties tombstoned before `cutoff`; returns their IDs.
    async fn purge_deleted_properties(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>>;

    // API keys

    /// Fetch an API key by its secret.
    async fn api_key_by_secret(&self, secret: &str) -> StoreResult<ApiKey>;
    /// All API keys owned by a user.
    async fn api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>>;
    /// Insert an API key.
    async fn insert_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey>;
    /// Replace a key's secret (rotation).
    async fn update_api_key_secret(&self, id: i64, secret: &str) -> StoreResult<()>;
    /// Enable or disable a key.
    async fn set_api_key_enabled(&self, id: i64, enabled: bool) -> StoreResult<()>;
    /// Hard-delete a key.
    async fn delete_api_key(&self, id: i64) -> StoreResult<()>;
    /// Hard-delete all keys of a user; returns the deleted secrets.
    async fn delete_api_keys_for_user(&self, user_id: i64) -> StoreResult<Vec<String>>;

    // Users

    /// Fetch a live user by ID.
    async fn user_by_id(&self, id: i64) -> StoreResult<User>;
    /// Fetch a live user by email.
    async fn user_by_email(&self, email: &str) -> StoreResult<User>;
    /// Insert a user.
    async fn insert_user(&self, user: &NewUser) -> StoreResult<User>;
    /// Set the soft-delete tombstone on a user.
    async fn soft_delete_user(&self, id: i64) -> StoreResult<()>;
    /// Hard-delete users tombstoned before `cutoff`; returns their IDs.
    async fn purge_deleted_users(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>>;

    // Organizations and memberships

    /// Fetch a live organization by ID.
    async fn org_by_id(&self, id: i64) -> StoreResult<Org>;
    /// Insert an organization.
    async fn insert_org(&self, org: &NewOrg) -> StoreResult<Org>;
    /// Update an organization's mutable fields.
    async fn update_org(&self, org: &Org) -> StoreResult<()>;
    /// Set the soft-delete tombstone on an organization.
    async fn soft_delete_org(&self, id: i64) -> StoreResult<()>;
    /// Tombstone every organization a user owns; returns their IDs.
    async fn soft_delete_orgs_of_user(&self, user_id: i64) -> StoreResult<Vec<i64>>;
    /// Hard-delete organizations tombstoned before `cutoff`; returns their IDs.
    async fn purge_deleted_orgs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>>;
    /// All organizations a user owns or belongs to, with the user's level.
    async fn orgs_by_user(&self, user_id: i64) -> StoreResult<Vec<OrgWithLevel>>;
    /// All stored membership rows of an organization.
    async fn users_by_org(&self, org_id: i64) -> StoreResult<Vec<Membership>>;
    /// Fetch an organization together with the asking user's access level.
    async fn org_with_level(&self, user_id: i64, org_id: i64) -> StoreResult<OrgWithLevel>;
    /// Insert a membership row.
    async fn insert_membership(
        &self,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()>;
    /// Change a stored membership level.
    async fn update_membership_level(
        &self,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()>;
    /// Remove a membership row.
    async fn delete_membership(&self, org_id: i64, user_id: i64) -> StoreResult<()>;

    // Subscriptions

    /// Fetch the subscription of an organization.
    async fn subscription_by_org(&self, org_id: i64) -> StoreResult<Subscription>;
    /// Deactivate subscriptions whose trial ended before `now`; returns them.
    async fn expire_trials(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>>;

    // Audit log

    /// Bulk-insert audit entries.
    async fn insert_audit_entries(&self, entries: &[AuditLogEntry]) -> StoreResult<()>;
    /// Recent audit entries for a target entity, newest first.
    async fn audit_entries_for(
        &self,
        target_kind: &str,
        target_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<AuditLogEntry>>;

    // Locks

    /// Acquire the named lease until `expires_at`.
    ///
    /// Succeeds iff no row exists or the existing lease is expired; otherwise
    /// fails with [`StoreError::Locked`].
    async fn acquire_lock(&self, name: &str, expires_at: DateTime<Utc>) -> StoreResult<()>;
    /// Release the named lease immediately.
    async fn release_lock(&self, name: &str) -> StoreResult<()>;
    /// Remove lapsed leases; returns how many were removed.
    async fn delete_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // Generic cache rows (session persistence)

    /// Insert or replace a cache row with an absolute expiry.
    async fn upsert_cache_row(
        &self,
        key: &str,
        value: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Fetch an unexpired cache row.
    async fn cache_row(&self, key: &str) -> StoreResult<Vec<u8>>;
    /// Remove a cache row.
    async fn delete_cache_row(&self, key: &str) -> StoreResult<()>;
    /// Remove expired cache rows; returns how many were removed.
    async fn delete_expired_cache_rows(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // Async tasks

    /// Insert a task.
    async fn enqueue_task(&self, task: &AsyncTask) -> StoreResult<()>;
    /// Unprocessed tasks due at `now`, oldest first.
    async fn due_tasks(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<AsyncTask>>;
    /// Mark a task processed and record its output.
    async fn complete_task(&self, id: Uuid, output: Option<&[u8]>) -> StoreResult<()>;
    /// Push a failed task back with a new schedule and attempt count.
    async fn reschedule_task(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        attempts: i32,
    ) -> StoreResult<()>;

    // Scheduled notifications

    /// Schedule a notification. Returns `false` when the reference ID was
    /// already scheduled, which makes retries idempotent.
    async fn schedule_notification(&self, notification: &NewNotification) -> StoreResult<bool>;
    /// Unsent notifications due at `now`, oldest first.
    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledNotification>>;
    /// Mark a notification sent.
    async fn mark_notification_sent(&self, id: i64) -> StoreResult<()>;
}

/// An open store transaction.
#[async_trait]
pub trait StoreTx: StoreBackend {
    /// Commit the transaction.
    async fn commit(&self) -> StoreResult<()>;
    /// Roll the transaction back.
    async fn rollback(&self) -> StoreResult<()>;
    /// View this transaction as a plain backend for the business layer.
    fn as_backend(self: Arc<Self>) -> Arc<dyn StoreBackend>;
}
