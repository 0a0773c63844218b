//! Domain entities persisted in the relational store.
//!
//! Entities refer to each other by numeric ID only; the in-memory layer never
//! builds an object graph with back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Puzzle difficulty assigned to a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum Difficulty {
    Easy = 0,
    Normal = 1,
    Hard = 2,
    Brutal = 3,
}

/// How a property's difficulty grows while it is under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum GrowthClass {
    Constant = 0,
    Linear = 1,
    Exponential = 2,
}

/// What an API key may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum ApiKeyScope {
    Full = 0,
    Verify = 1,
}

/// A user's level inside an organization.
///
/// `Owner` is derived from `Org::user_id`, never trusted from a stored
/// membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum MembershipLevel {
    Invited = 0,
    Member = 1,
    Owner = 2,
}

/// Who a scheduled notification applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum SubscriptionCondition {
    Any = 0,
    WithSubscription = 1,
    WithoutSubscription = 2,
}

/// A protected site, reachable by numeric ID or by its 32-hex site key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Property {
    /// Stable numeric ID.
    pub id: i64,
    /// External 32-hex site key; unique.
    pub sitekey: String,
    /// Owning organization.
    pub org_id: i64,
    /// User who created the property.
    pub creator_id: i64,
    /// Display name, unique within the organization.
    pub name: String,
    /// Domain the widget is allowed to run on.
    pub domain: String,
    /// Base puzzle difficulty.
    pub difficulty: Difficulty,
    /// Difficulty growth class.
    pub growth: GrowthClass,
    /// Start of the validity interval, if bounded.
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity interval, if bounded.
    pub valid_until: Option<DateTime<Utc>>,
    /// How many times one puzzle may be redeemed.
    pub max_redemptions: i32,
    /// Whether subdomains of `domain` are accepted.
    pub allow_subdomains: bool,
    /// Whether localhost origins are accepted (development properties).
    pub allow_localhost: bool,
    /// Soft-delete tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Property {
    /// Whether the tombstone is set.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether `now` falls inside the validity interval.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| now >= from)
            && self.valid_until.map_or(true, |until| now <= until)
    }
}

/// Fields for creating a property.
#[derive(Debug, Clone)]
pub struct NewProperty {
    /// Pre-generated external site key.
    pub sitekey: String,
    /// Owning organization.
    pub org_id: i64,
    /// Creating user.
    pub creator_id: i64,
    /// Display name.
    pub name: String,
    /// Widget domain.
    pub domain: String,
    /// Base difficulty.
    pub difficulty: Difficulty,
    /// Growth class.
    pub growth: GrowthClass,
    /// Validity interval start.
    pub valid_from: Option<DateTime<Utc>>,
    /// Validity interval end.
    pub valid_until: Option<DateTime<Utc>>,
    /// Redemption limit per puzzle.
    pub max_redemptions: i32,
    /// Accept subdomains.
    pub allow_subdomains: bool,
    /// Accept localhost.
    pub allow_localhost: bool,
}

/// An API key; the secret is the external identifier.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKey {
    /// Stable numeric ID.
    pub id: i64,
    /// External secret of the form `pc_<32-hex>`; unique.
    pub secret: String,
    /// Owning organization.
    pub org_id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Scope tag.
    pub scope: ApiKeyScope,
    /// Whether the key is accepted at all.
    pub enabled: bool,
    /// Sustained request budget per second.
    pub rate_per_second: i32,
    /// Burst budget.
    pub burst: i32,
    /// Hard expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the key may only read.
    pub read_only: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Whether the key is usable at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map_or(true, |at| now < at)
    }
}

/// Fields for creating an API key.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewApiKey {
    pub secret: String,
    pub org_id: i64,
    pub user_id: i64,
    pub scope: ApiKeyScope,
    pub rate_per_second: i32,
    pub burst: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub read_only: bool,
}

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Stable numeric ID.
    pub id: i64,
    /// Login email; unique among live users.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Soft-delete tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a user.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewUser {
    pub email: String,
    pub name: String,
}

/// An organization; `user_id` is the owner.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Org {
    /// Stable numeric ID.
    pub id: i64,
    /// Owning user; the source of truth for the `Owner` level.
    pub user_id: i64,
    /// Display name, unique per owner.
    pub name: String,
    /// Soft-delete tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating an organization.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewOrg {
    pub user_id: i64,
    pub name: String,
}

/// A stored membership row. Owners do not have one.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Membership {
    /// The organization.
    pub org_id: i64,
    /// The member.
    pub user_id: i64,
    /// Stored level; `Owner` is synthesised, never stored.
    pub level: MembershipLevel,
    /// When the membership was created.
    pub created_at: DateTime<Utc>,
}

/// An organization together with the asking user's access level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgWithLevel {
    /// The organization.
    pub org: Org,
    /// The user's effective level in it.
    pub level: MembershipLevel,
}

/// A billing subscription attached to an organization.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Stable numeric ID.
    pub id: i64,
    /// The organization.
    pub org_id: i64,
    /// Plan label.
    pub plan: String,
    /// Whether the subscription is currently active.
    pub active: bool,
    /// End of the trial window, if the org is on trial.
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A persisted audit log row; the `audit` module owns the richer event type.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[allow(missing_docs)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: i64,
    pub action: String,
    pub source: String,
    pub target_kind: String,
    pub target_id: i64,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A unit of deferred work executed by the async-task pump.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[allow(missing_docs)]
pub struct AsyncTask {
    pub id: Uuid,
    pub handler: String,
    pub input: Vec<u8>,
    pub output: Option<Vec<u8>>,
    pub attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub user_id: i64,
}

/// Fields for scheduling a notification; `reference_id` makes scheduling
/// idempotent.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewNotification {
    pub user_id: i64,
    pub reference_id: String,
    pub template_hash: i64,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub persistent: bool,
    pub condition: SubscriptionCondition,
}

/// A scheduled notification row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[allow(missing_docs)]
pub struct ScheduledNotification {
    pub id: i64,
    pub user_id: i64,
    pub reference_id: String,
    pub template_hash: i64,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub persistent: bool,
    pub condition: SubscriptionCondition,
}

/// A named exclusive lease.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lock {
    /// Lease name; at most one holder.
    pub name: String,
    /// When the lease lapses and may be re-acquired.
    pub expires_at: DateTime<Utc>,
}

/// A generic key/value cache row, used for session persistence.
#[derive(Debug, Clone, sqlx::FromRow)]
#[allow(missing_docs)]
pub struct CacheRow {
    pub key: String,
    pub value: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}
