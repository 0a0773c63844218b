//! PostgreSQL store backend.
//!
//! Thin sqlx plumbing over the [`StoreBackend`] surface. Every query is a
//! free function generic over the executor so the pooled backend and an open
//! transaction share one SQL definition. The schema itself is owned by the
//! host application's migrations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use super::models::*;
use super::{StoreBackend, StoreError, StoreResult, StoreTx};

/// Connection settings for [`PgBackend`].
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
    /// Deadline for the initial connect.
    pub connect_timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/botwall".to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Pooled PostgreSQL implementation of [`StoreBackend`].
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect to the database, honouring the connect deadline.
    pub async fn connect(config: &PgConfig) -> StoreResult<Self> {
        let options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout);
        let connect = options.connect(&config.url);
        let pool = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| StoreError::ConnectionTimeout)??;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// An open PostgreSQL transaction.
pub struct PgTx {
    tx: TokioMutex<Option<Transaction<'static, Postgres>>>,
}

/// Borrow the open transaction out of its mutex, or fail if it was already
/// committed or rolled back.
macro_rules! tx_conn {
    ($guard:ident) => {
        match $guard.as_mut() {
            Some(tx) => &mut **tx,
            None => return Err(StoreError::TxFinished),
        }
    };
}

mod q {
    //! One SQL definition per backend operation.

    use super::*;
    use sqlx::PgExecutor;

    pub async fn ping<'e>(exec: impl PgExecutor<'e>) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(exec).await?;
        Ok(())
    }

    pub async fn property_by_id<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<Property> {
        Ok(sqlx::query_as::<_, Property>(
            "SELECT * FROM properties WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_one(exec)
        .await?)
    }

    pub async fn property_by_sitekey<'e>(
        exec: impl PgExecutor<'e>,
        sitekey: &str,
    ) -> StoreResult<Property> {
        Ok(sqlx::query_as::<_, Property>(
            "SELECT * FROM properties WHERE sitekey = $1 AND deleted_at IS NULL",
        )
        .bind(sitekey)
        .fetch_one(exec)
        .await?)
    }

    pub async fn properties_by_ids<'e>(
        exec: impl PgExecutor<'e>,
        ids: &[i64],
    ) -> StoreResult<Vec<Property>> {
        Ok(sqlx::query_as::<_, Property>(
            "SELECT * FROM properties WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(ids)
        .fetch_all(exec)
        .await?)
    }

    pub async fn properties_by_org<'e>(
        exec: impl PgExecutor<'e>,
        org_id: i64,
    ) -> StoreResult<Vec<Property>> {
        Ok(sqlx::query_as::<_, Property>(
            "SELECT * FROM properties WHERE org_id = $1 AND deleted_at IS NULL ORDER BY created_at",
        )
        .bind(org_id)
        .fetch_all(exec)
        .await?)
    }

    pub async fn insert_property<'e>(
        exec: impl PgExecutor<'e>,
        p: &NewProperty,
    ) -> StoreResult<Property> {
        Ok(sqlx::query_as::<_, Property>(
            "INSERT INTO properties \
             (sitekey, org_id, creator_id, name, domain, difficulty, growth, valid_from, \
              valid_until, max_redemptions, allow_subdomains, allow_localhost) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING *",
        )
        .bind(&p.sitekey)
        .bind(p.org_id)
        .bind(p.creator_id)
        .bind(&p.name)
        .bind(&p.domain)
        .bind(p.difficulty)
        .bind(p.growth)
        .bind(p.valid_from)
        .bind(p.valid_until)
        .bind(p.max_redemptions)
        .bind(p.allow_subdomains)
        .bind(p.allow_localhost)
        .fetch_one(exec)
        .await?)
    }

    pub async fn update_property<'e>(exec: impl PgExecutor<'e>, p: &Property) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE properties SET name = $2, domain = $3, difficulty = $4, growth = $5, \
             valid_from = $6, valid_until = $7, max_redemptions = $8, allow_subdomains = $9, \
             allow_localhost = $10, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(&p.domain)
        .bind(p.difficulty)
        .bind(p.growth)
        .bind(p.valid_from)
        .bind(p.valid_until)
        .bind(p.max_redemptions)
        .bind(p.allow_subdomains)
        .bind(p.allow_localhost)
        .execute(exec)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Distinguishes a missing row from one that is already tombstoned by
    /// returning the pre-update tombstone state.
    pub async fn soft_delete_property<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<()> {
        soft_delete_row(exec, "properties", id).await
    }

    async fn soft_delete_row<'e>(
        exec: impl PgExecutor<'e>,
        table: &str,
        id: i64,
    ) -> StoreResult<()> {
        // `target` reads the pre-update tombstone state, so one statement
        // both performs the update and tells the two failure modes apart.
        let was_deleted: Option<bool> = sqlx::query_scalar(&format!(
            "WITH target AS (SELECT id, deleted_at FROM {table} WHERE id = $1), \
             updated AS (UPDATE {table} SET deleted_at = now() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING id) \
             SELECT t.deleted_at IS NOT NULL FROM target t",
            table = table
        ))
        .bind(id)
        .fetch_optional(exec)
        .await?;
        match was_deleted {
            None => Err(StoreError::NotFound),
            Some(true) => Err(StoreError::SoftDeleted),
            Some(false) => Ok(()),
        }
    }

    pub async fn count_properties_by_org<'e>(
        exec: impl PgExecutor<'e>,
        org_id: i64,
    ) -> StoreResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM properties WHERE org_id = $1 AND deleted_at IS NULL",
        )
        .bind(org_id)
        .fetch_one(exec)
        .await?)
    }

    pub async fn count_properties_by_user<'e>(
        exec: impl PgExecutor<'e>,
        user_id: i64,
    ) -> StoreResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM properties p \
             LEFT JOIN orgs o ON o.id = p.org_id AND o.deleted_at IS NULL \
             WHERE p.deleted_at IS NULL AND (p.creator_id = $1 OR o.user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(exec)
        .await?)
    }

    pub async fn purge_deleted_properties<'e>(
        exec: impl PgExecutor<'e>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "DELETE FROM properties WHERE deleted_at IS NOT NULL AND deleted_at < $1 RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(exec)
        .await?)
    }

    pub async fn api_key_by_secret<'e>(
        exec: impl PgExecutor<'e>,
        secret: &str,
    ) -> StoreResult<ApiKey> {
        Ok(
            sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE secret = $1")
                .bind(secret)
                .fetch_one(exec)
                .await?,
        )
    }

    pub async fn api_keys_by_user<'e>(
        exec: impl PgExecutor<'e>,
        user_id: i64,
    ) -> StoreResult<Vec<ApiKey>> {
        Ok(sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(exec)
        .await?)
    }

    pub async fn insert_api_key<'e>(exec: impl PgExecutor<'e>, k: &NewApiKey) -> StoreResult<ApiKey> {
        Ok(sqlx::query_as::<_, ApiKey>(
            "INSERT INTO api_keys \
             (secret, org_id, user_id, scope, enabled, rate_per_second, burst, expires_at, read_only) \
             VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7, $8) \
             RETURNING *",
        )
        .bind(&k.secret)
        .bind(k.org_id)
        .bind(k.user_id)
        .bind(k.scope)
        .bind(k.rate_per_second)
        .bind(k.burst)
        .bind(k.expires_at)
        .bind(k.read_only)
        .fetch_one(exec)
        .await?)
    }

    pub async fn update_api_key_secret<'e>(
        exec: impl PgExecutor<'e>,
        id: i64,
        secret: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE api_keys SET secret = $2 WHERE id = $1")
            .bind(id)
            .bind(secret)
            .execute(exec)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn set_api_key_enabled<'e>(
        exec: impl PgExecutor<'e>,
        id: i64,
        enabled: bool,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE api_keys SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(exec)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn delete_api_key<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id)
            .execute(exec)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn delete_api_keys_for_user<'e>(
        exec: impl PgExecutor<'e>,
        user_id: i64,
    ) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "DELETE FROM api_keys WHERE user_id = $1 RETURNING secret",
        )
        .bind(user_id)
        .fetch_all(exec)
        .await?)
    }

    pub async fn user_by_id<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<User> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL")
                .bind(id)
                .fetch_one(exec)
                .await?,
        )
    }

    pub async fn user_by_email<'e>(exec: impl PgExecutor<'e>, email: &str) -> StoreResult<User> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE email = $1 AND deleted_at IS NULL",
        )
        .bind(email)
        .fetch_one(exec)
        .await?)
    }

    pub async fn insert_user<'e>(exec: impl PgExecutor<'e>, u: &NewUser) -> StoreResult<User> {
        Ok(sqlx::query_as::<_, User>(
            "INSERT INTO users (email, name) VALUES ($1, $2) RETURNING *",
        )
        .bind(&u.email)
        .bind(&u.name)
        .fetch_one(exec)
        .await?)
    }

    pub async fn soft_delete_user<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<()> {
        soft_delete_row(exec, "users", id).await
    }

    pub async fn purge_deleted_users<'e>(
        exec: impl PgExecutor<'e>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "DELETE FROM users WHERE deleted_at IS NOT NULL AND deleted_at < $1 RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(exec)
        .await?)
    }

    pub async fn org_by_id<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<Org> {
        Ok(
            sqlx::query_as::<_, Org>("SELECT * FROM orgs WHERE id = $1 AND deleted_at IS NULL")
                .bind(id)
                .fetch_one(exec)
                .await?,
        )
    }

    pub async fn insert_org<'e>(exec: impl PgExecutor<'e>, o: &NewOrg) -> StoreResult<Org> {
        Ok(
            sqlx::query_as::<_, Org>("INSERT INTO orgs (user_id, name) VALUES ($1, $2) RETURNING *")
                .bind(o.user_id)
                .bind(&o.name)
                .fetch_one(exec)
                .await?,
        )
    }

    pub async fn update_org<'e>(exec: impl PgExecutor<'e>, o: &Org) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE orgs SET name = $2, updated_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(o.id)
        .bind(&o.name)
        .execute(exec)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn soft_delete_org<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<()> {
        soft_delete_row(exec, "orgs", id).await
    }

    pub async fn soft_delete_orgs_of_user<'e>(
        exec: impl PgExecutor<'e>,
        user_id: i64,
    ) -> StoreResult<Vec<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "UPDATE orgs SET deleted_at = now() \
             WHERE user_id = $1 AND deleted_at IS NULL RETURNING id",
        )
        .bind(user_id)
        .fetch_all(exec)
        .await?)
    }

    pub async fn purge_deleted_orgs<'e>(
        exec: impl PgExecutor<'e>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "DELETE FROM orgs WHERE deleted_at IS NOT NULL AND deleted_at < $1 RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(exec)
        .await?)
    }

    #[derive(sqlx::FromRow)]
    struct OrgLevelRow {
        id: i64,
        user_id: i64,
        name: String,
        deleted_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        level: MembershipLevel,
    }

    impl From<OrgLevelRow> for OrgWithLevel {
        fn from(row: OrgLevelRow) -> Self {
            OrgWithLevel {
                org: Org {
                    id: row.id,
                    user_id: row.user_id,
                    name: row.name,
                    deleted_at: row.deleted_at,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                },
                level: row.level,
            }
        }
    }

    pub async fn orgs_by_user<'e>(
        exec: impl PgExecutor<'e>,
        user_id: i64,
    ) -> StoreResult<Vec<OrgWithLevel>> {
        let rows = sqlx::query_as::<_, OrgLevelRow>(
            "SELECT o.id, o.user_id, o.name, o.deleted_at, o.created_at, o.updated_at, \
             CASE WHEN o.user_id = $1 THEN 2::smallint ELSE m.level END AS level \
             FROM orgs o \
             LEFT JOIN memberships m ON m.org_id = o.id AND m.user_id = $1 \
             WHERE o.deleted_at IS NULL AND (o.user_id = $1 OR m.user_id IS NOT NULL) \
             ORDER BY o.created_at",
        )
        .bind(user_id)
        .fetch_all(exec)
        .await?;
        Ok(rows.into_iter().map(OrgWithLevel::from).collect())
    }

    pub async fn users_by_org<'e>(
        exec: impl PgExecutor<'e>,
        org_id: i64,
    ) -> StoreResult<Vec<Membership>> {
        Ok(sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE org_id = $1 ORDER BY created_at",
        )
        .bind(org_id)
        .fetch_all(exec)
        .await?)
    }

    pub async fn org_with_level<'e>(
        exec: impl PgExecutor<'e>,
        user_id: i64,
        org_id: i64,
    ) -> StoreResult<OrgWithLevel> {
        let row = sqlx::query_as::<_, OrgLevelRow>(
            "SELECT o.id, o.user_id, o.name, o.deleted_at, o.created_at, o.updated_at, \
             CASE WHEN o.user_id = $1 THEN 2::smallint ELSE m.level END AS level \
             FROM orgs o \
             LEFT JOIN memberships m ON m.org_id = o.id AND m.user_id = $1 \
             WHERE o.id = $2 AND o.deleted_at IS NULL AND (o.user_id = $1 OR m.user_id IS NOT NULL)",
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_one(exec)
        .await?;
        Ok(row.into())
    }

    pub async fn insert_membership<'e>(
        exec: impl PgExecutor<'e>,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO memberships (org_id, user_id, level) VALUES ($1, $2, $3) \
             ON CONFLICT (org_id, user_id) DO UPDATE SET level = EXCLUDED.level",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(level)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn update_membership_level<'e>(
        exec: impl PgExecutor<'e>,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE memberships SET level = $3 WHERE org_id = $1 AND user_id = $2")
                .bind(org_id)
                .bind(user_id)
                .bind(level)
                .execute(exec)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn delete_membership<'e>(
        exec: impl PgExecutor<'e>,
        org_id: i64,
        user_id: i64,
    ) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM memberships WHERE org_id = $1 AND user_id = $2")
            .bind(org_id)
            .bind(user_id)
            .execute(exec)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn subscription_by_org<'e>(
        exec: impl PgExecutor<'e>,
        org_id: i64,
    ) -> StoreResult<Subscription> {
        Ok(
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE org_id = $1")
                .bind(org_id)
                .fetch_one(exec)
                .await?,
        )
    }

    pub async fn expire_trials<'e>(
        exec: impl PgExecutor<'e>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Subscription>> {
        Ok(sqlx::query_as::<_, Subscription>(
            "UPDATE subscriptions SET active = FALSE \
             WHERE active AND trial_ends_at IS NOT NULL AND trial_ends_at < $1 \
             RETURNING *",
        )
        .bind(now)
        .fetch_all(exec)
        .await?)
    }

    pub async fn insert_audit_entries<'e>(
        exec: impl PgExecutor<'e>,
        entries: &[AuditLogEntry],
    ) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(entries.len());
        let mut user_ids = Vec::with_capacity(entries.len());
        let mut actions = Vec::with_capacity(entries.len());
        let mut sources = Vec::with_capacity(entries.len());
        let mut target_kinds = Vec::with_capacity(entries.len());
        let mut target_ids = Vec::with_capacity(entries.len());
        let mut befores = Vec::with_capacity(entries.len());
        let mut afters = Vec::with_capacity(entries.len());
        let mut session_ids = Vec::with_capacity(entries.len());
        let mut created_ats = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(entry.id);
            user_ids.push(entry.user_id);
            actions.push(entry.action.clone());
            sources.push(entry.source.clone());
            target_kinds.push(entry.target_kind.clone());
            target_ids.push(entry.target_id);
            befores.push(entry.before.clone().unwrap_or(serde_json::Value::Null));
            afters.push(entry.after.clone().unwrap_or(serde_json::Value::Null));
            session_ids.push(entry.session_id.clone());
            created_ats.push(entry.created_at);
        }
        sqlx::query(
            "INSERT INTO audit_log \
             (id, user_id, action, source, target_kind, target_id, before, after, session_id, created_at) \
             SELECT * FROM UNNEST \
             ($1::uuid[], $2::bigint[], $3::text[], $4::text[], $5::text[], $6::bigint[], \
              $7::jsonb[], $8::jsonb[], $9::text[], $10::timestamptz[])",
        )
        .bind(&ids)
        .bind(&user_ids)
        .bind(&actions)
        .bind(&sources)
        .bind(&target_kinds)
        .bind(&target_ids)
        .bind(&befores)
        .bind(&afters)
        .bind(&session_ids)
        .bind(&created_ats)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn audit_entries_for<'e>(
        exec: impl PgExecutor<'e>,
        target_kind: &str,
        target_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        Ok(sqlx::query_as::<_, AuditLogEntry>(
            "SELECT * FROM audit_log WHERE target_kind = $1 AND target_id = $2 \
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(target_kind)
        .bind(target_id)
        .bind(limit)
        .fetch_all(exec)
        .await?)
    }

    pub async fn acquire_lock<'e>(
        exec: impl PgExecutor<'e>,
        name: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO locks (name, expires_at) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET expires_at = EXCLUDED.expires_at \
             WHERE locks.expires_at <= now()",
        )
        .bind(name)
        .bind(expires_at)
        .execute(exec)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Locked(name.to_string()));
        }
        Ok(())
    }

    pub async fn release_lock<'e>(exec: impl PgExecutor<'e>, name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM locks WHERE name = $1")
            .bind(name)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn delete_expired_locks<'e>(
        exec: impl PgExecutor<'e>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at <= $1")
            .bind(now)
            .execute(exec)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_cache_row<'e>(
        exec: impl PgExecutor<'e>,
        key: &str,
        value: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO cache (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn cache_row<'e>(exec: impl PgExecutor<'e>, key: &str) -> StoreResult<Vec<u8>> {
        Ok(sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT value FROM cache WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_one(exec)
        .await?)
    }

    pub async fn delete_cache_row<'e>(exec: impl PgExecutor<'e>, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM cache WHERE key = $1")
            .bind(key)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn delete_expired_cache_rows<'e>(
        exec: impl PgExecutor<'e>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= $1")
            .bind(now)
            .execute(exec)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn enqueue_task<'e>(exec: impl PgExecutor<'e>, task: &AsyncTask) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO async_tasks (id, handler, input, attempts, scheduled_at, user_id) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(task.id)
        .bind(&task.handler)
        .bind(&task.input)
        .bind(task.attempts)
        .bind(task.scheduled_at)
        .bind(task.user_id)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn due_tasks<'e>(
        exec: impl PgExecutor<'e>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<AsyncTask>> {
        Ok(sqlx::query_as::<_, AsyncTask>(
            "SELECT * FROM async_tasks WHERE processed_at IS NULL AND scheduled_at <= $1 \
             ORDER BY scheduled_at LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(exec)
        .await?)
    }

    pub async fn complete_task<'e>(
        exec: impl PgExecutor<'e>,
        id: Uuid,
        output: Option<&[u8]>,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE async_tasks SET processed_at = now(), output = $2 WHERE id = $1")
                .bind(id)
                .bind(output)
                .execute(exec)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn reschedule_task<'e>(
        exec: impl PgExecutor<'e>,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        attempts: i32,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE async_tasks SET scheduled_at = $2, attempts = $3 WHERE id = $1")
                .bind(id)
                .bind(scheduled_at)
                .bind(attempts)
                .execute(exec)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn schedule_notification<'e>(
        exec: impl PgExecutor<'e>,
        n: &NewNotification,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO notifications \
             (user_id, reference_id, template_hash, payload, scheduled_at, persistent, condition) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (reference_id) DO NOTHING",
        )
        .bind(n.user_id)
        .bind(&n.reference_id)
        .bind(n.template_hash)
        .bind(&n.payload)
        .bind(n.scheduled_at)
        .bind(n.persistent)
        .bind(n.condition)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn due_notifications<'e>(
        exec: impl PgExecutor<'e>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledNotification>> {
        Ok(sqlx::query_as::<_, ScheduledNotification>(
            "SELECT * FROM notifications WHERE sent_at IS NULL AND scheduled_at <= $1 \
             ORDER BY scheduled_at LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(exec)
        .await?)
    }

    pub async fn mark_notification_sent<'e>(exec: impl PgExecutor<'e>, id: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE notifications SET sent_at = now() WHERE id = $1")
            .bind(id)
            .execute(exec)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for PgBackend {
    async fn begin(&self) -> StoreResult<Arc<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Arc::new(PgTx {
            tx: TokioMutex::new(Some(tx)),
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        q::ping(&self.pool).await
    }

    async fn property_by_id(&self, id: i64) -> StoreResult<Property> {
        q::property_by_id(&self.pool, id).await
    }

    async fn property_by_sitekey(&self, sitekey: &str) -> StoreResult<Property> {
        q::property_by_sitekey(&self.pool, sitekey).await
    }

    async fn properties_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<Property>> {
        q::properties_by_ids(&self.pool, ids).await
    }

    async fn properties_by_org(&self, org_id: i64) -> StoreResult<Vec<Property>> {
        q::properties_by_org(&self.pool, org_id).await
    }

    async fn insert_property(&self, property: &NewProperty) -> StoreResult<Property> {
        q::insert_property(&self.pool, property).await
    }

    async fn update_property(&self, property: &Property) -> StoreResult<()> {
        q::update_property(&self.pool, property).await
    }

    async fn soft_delete_property(&self, id: i64) -> StoreResult<()> {
        q::soft_delete_property(&self.pool, id).await
    }

    async fn count_properties_by_org(&self, org_id: i64) -> StoreResult<i64> {
        q::count_properties_by_org(&self.pool, org_id).await
    }

    async fn count_properties_by_user(&self, user_id: i64) -> StoreResult<i64> {
        q::count_properties_by_user(&self.pool, user_id).await
    }

    async fn purge_deleted_properties(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        q::purge_deleted_properties(&self.pool, cutoff).await
    }

    async fn api_key_by_secret(&self, secret: &str) -> StoreResult<ApiKey> {
        q::api_key_by_secret(&self.pool, secret).await
    }

    async fn api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>> {
        q::api_keys_by_user(&self.pool, user_id).await
    }

    async fn insert_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey> {
        q::insert_api_key(&self.pool, key).await
    }

    async fn update_api_key_secret(&self, id: i64, secret: &str) -> StoreResult<()> {
        q::update_api_key_secret(&self.pool, id, secret).await
    }

    async fn set_api_key_enabled(&self, id: i64, enabled: bool) -> StoreResult<()> {
        q::set_api_key_enabled(&self.pool, id, enabled).await
    }

    async fn delete_api_key(&self, id: i64) -> StoreResult<()> {
        q::delete_api_key(&self.pool, id).await
    }

    async fn delete_api_keys_for_user(&self, user_id: i64) -> StoreResult<Vec<String>> {
        q::delete_api_keys_for_user(&self.pool, user_id).await
    }

    async fn user_by_id(&self, id: i64) -> StoreResult<User> {
        q::user_by_id(&self.pool, id).await
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<User> {
        q::user_by_email(&self.pool, email).await
    }

    async fn insert_user(&self, user: &NewUser) -> StoreResult<User> {
        q::insert_user(&self.pool, user).await
    }

    async fn soft_delete_user(&self, id: i64) -> StoreResult<()> {
        q::soft_delete_user(&self.pool, id).await
    }

    async fn purge_deleted_users(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        q::purge_deleted_users(&self.pool, cutoff).await
    }

    async fn org_by_id(&self, id: i64) -> StoreResult<Org> {
        q::org_by_id(&self.pool, id).await
    }

    async fn insert_org(&self, org: &NewOrg) -> StoreResult<Org> {
        q::insert_org(&self.pool, org).await
    }

    async fn update_org(&self, org: &Org) -> StoreResult<()> {
        q::update_org(&self.pool, org).await
    }

    async fn soft_delete_org(&self, id: i64) -> StoreResult<()> {
        q::soft_delete_org(&self.pool, id).await
    }

    async fn soft_delete_orgs_of_user(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        q::soft_delete_orgs_of_user(&self.pool, user_id).await
    }

    async fn purge_deleted_orgs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        q::purge_deleted_orgs(&self.pool, cutoff).await
    }

    async fn orgs_by_user(&self, user_id: i64) -> StoreResult<Vec<OrgWithLevel>> {
        q::orgs_by_user(&self.pool, user_id).await
    }

    async fn users_by_org(&self, org_id: i64) -> StoreResult<Vec<Membership>> {
        q::users_by_org(&self.pool, org_id).await
    }

    async fn org_with_level(&self, user_id: i64, org_id: i64) -> StoreResult<OrgWithLevel> {
        q::org_with_level(&self.pool, user_id, org_id).await
    }

    async fn insert_membership(
        &self,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()> {
        q::insert_membership(&self.pool, org_id, user_id, level).await
    }

    async fn update_membership_level(
        &self,
        org_id: i64,
        user_id: i64,
        level: MembershipLevel,
    ) -> StoreResult<()> {
        q::update_membership_level(&self.pool, org_id, user_id, level).await
    }

    async fn delete_membership(&self, org_id: i64, user_id: i64) -> StoreResult<()> {
        q::delete_membership(&self.pool, org_id, user_id).await
    }

    async fn subscription_by_org(&self, org_id: i64) -> StoreResult<Subscription> {
        q::subscription_by_org(&self.pool, org_id).await
    }

    async fn expire_trials(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        q::expire_trials(&self.pool, now).await
    }

    async fn insert_audit_entries(&self, entries: &[AuditLogEntry]) -> StoreResult<()> {
        q::insert_audit_entries(&self.pool, entries).await
    }

    async fn audit_entries_for(
        &self,
        target_kind: &str,
        target_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        q::audit_entries_for(&self.pool, target_kind, target_id, limit).await
    }

    async fn acquire_lock(&self, name: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        q::acquire_lock(&self.pool, name, expires_at).await
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        q::release_lock(&self.pool, name).await
    }

    async fn delete_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        q::delete_expired_locks(&self.pool, now).await
    }

    async fn upsert_cache_row(
        &self,
        key: &str,
        value: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        q::upsert_cache_row(&self.pool, key, value, expires_at).await
    }

    async fn cache_row(&self, key: &str) -> StoreResult<Vec<u8>> {
        q::cache_row(&self.pool, key).await
    }

    async fn delete_cache_row(&self, key: &str) -> StoreResult<()> {
        q::delete_cache_row(&self.pool, key).await
    }

    async fn delete_expired_cache_rows(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        q::delete_expired_cache_rows(&self.pool, now).await
    }

    async fn enqueue_task(&self, task: &AsyncTask) -> StoreResult<()> {
        q::enqueue_task(&self.pool, task).await
    }

    async fn due_tasks(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<AsyncTask>> {
        q::due_tasks(&self.pool, now, limit).await
    }

    async fn complete_task(&self, id: Uuid, output: Option<&[u8]>) -> StoreResult<()> {
        q::complete_task(&self.pool, id, output).await
    }

    async fn reschedule_task(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        attempts: i32,
    ) -> StoreResult<()> {
        q::reschedule_task(&self.pool, id, scheduled_at, attempts).await
    }

    async fn schedule_notification(&self, notification: &NewNotification) -> StoreResult<bool> {
        q::schedule_notification(&self.pool, notification).await
    }

    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledNotification>> {
        q::due_notifications(&self.pool, now, limit).await
    }

    async fn mark_notification_sent(&self, id: i64) -> StoreResult<()> {
        q::mark_notification_sent(&self.pool, id).await
    }
}

#[async_trait]
impl StoreBackend for PgTx {
    async fn begin(&self) -> StoreResult<Arc<dyn StoreTx>> {
        Err(StoreError::Internal(
            "nested transactions are not supported".to_string(),
        ))
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::ping(conn).await
    }

    async fn property_by_id(&self, id: i64) -> StoreResult<Property> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::property_by_id(conn, id).await
    }

    async fn property_by_sitekey(&self, sitekey: &str) -> StoreResult<Property> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::property_by_sitekey(conn, sitekey).await
    }

    async fn properties_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<Property>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::properties_by_ids(conn, ids).await
    }

    async fn properties_by_org(&self, org_id: i64) -> StoreResult<Vec<Property>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::properties_by_org(conn, org_id).await
    }

    async fn insert_property(&self, property: &NewProperty) -> StoreResult<Property> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::insert_property(conn, property).await
    }

    async fn update_property(&self, property: &Property) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::update_property(conn, property).await
    }

    async fn soft_delete_property(&self, id: i64) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::soft_delete_property(conn, id).await
    }

    async fn count_properties_by_org(&self, org_id: i64) -> StoreResult<i64> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::count_properties_by_org(conn, org_id).await
    }

    async fn count_properties_by_user(&self, user_id: i64) -> StoreResult<i64> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::count_properties_by_user(conn, user_id).await
    }

    async fn purge_deleted_properties(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::purge_deleted_properties(conn, cutoff).await
    }

    async fn api_key_by_secret(&self, secret: &str) -> StoreResult<ApiKey> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::api_key_by_secret(conn, secret).await
    }

    async fn api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::api_keys_by_user(conn, user_id).await
    }

    async fn insert_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::insert_api_key(conn, key).await
    }

    async fn update_api_key_secret(&self, id: i64, secret: &str) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::update_api_key_secret(conn, id, secret).await
    }

    async fn set_api_key_enabled(&self, id: i64, enabled: bool) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::set_api_key_enabled(conn, id, enabled).await
    }

    async fn delete_api_key(&self, id: i64) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::delete_api_key(conn, id).await
    }

    async fn delete_api_keys_for_user(&self, user_id: i64) -> StoreResult<Vec<String>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::delete_api_keys_for_user(conn, user_id).await
    }

    async fn user_by_id(&self, id: i64) -> StoreResult<User> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::user_by_id(conn, id).await
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<User> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::user_by_email(conn, email).await
    }

    async fn insert_user(&self, user: &NewUser) -> StoreResult<User> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::insert_user(conn, user).await
    }

    async fn soft_delete_user(&self, id: i64) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::soft_delete_user(conn, id).await
    }

    async fn purge_deleted_users(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::purge_deleted_users(conn, cutoff).await
    }

    async fn org_by_id(&self, id: i64) -> StoreResult<Org> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::org_by_id(conn, id).await
    }

    async fn insert_org(&self, org: &NewOrg) -> StoreResult<Org> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::insert_org(conn, org).await
    }

    async fn update_org(&self, org: &Org) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::update_org(conn, org).await
    }

    async fn soft_delete_org(&self, id: i64) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::soft_delete_org(conn, id).await
    }

    async fn soft_delete_orgs_of_user(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::soft_delete_orgs_of_user(conn, user_id).await
    }

    async fn purge_deleted_orgs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::purge_deleted_orgs(conn, cutoff).await
    }

    async fn orgs_by_user(&self, user_id: i64) -> StoreResult<Vec<OrgWithLevel>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::orgs_by_user(conn, user_id).await
    }

    async fn users_by_org(&self, org_id: i64) -> StoreResult<Vec<Membership>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::users_by_org(conn, org_id).await
    }

    async fn org_with_level(&self, user_id: i64, org_id: i64) -> StoreResult<OrgWithLevel> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::org_with_level(conn, user_id, org_id).await
    }

    async fn insert_membership(&self, org_id: i64, user_id: i64, level: MembershipLevel) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::insert_membership(conn, org_id, user_id, level).await
    }

    async fn update_membership_level(&self, org_id: i64, user_id: i64, level: MembershipLevel) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::update_membership_level(conn, org_id, user_id, level).await
    }

    async fn delete_membership(&self, org_id: i64, user_id: i64) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::delete_membership(conn, org_id, user_id).await
    }

    async fn subscription_by_org(&self, org_id: i64) -> StoreResult<Subscription> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::subscription_by_org(conn, org_id).await
    }

    async fn expire_trials(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::expire_trials(conn, now).await
    }

    async fn insert_audit_entries(&self, entries: &[AuditLogEntry]) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::insert_audit_entries(conn, entries).await
    }

    async fn audit_entries_for(&self, target_kind: &str, target_id: i64, limit: i64) -> StoreResult<Vec<AuditLogEntry>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::audit_entries_for(conn, target_kind, target_id, limit).await
    }

    async fn acquire_lock(&self, name: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::acquire_lock(conn, name, expires_at).await
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::release_lock(conn, name).await
    }

    async fn delete_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::delete_expired_locks(conn, now).await
    }

    async fn upsert_cache_row(&self, key: &str, value: &[u8], expires_at: DateTime<Utc>) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::upsert_cache_row(conn, key, value, expires_at).await
    }

    async fn cache_row(&self, key: &str) -> StoreResult<Vec<u8>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::cache_row(conn, key).await
    }

    async fn delete_cache_row(&self, key: &str) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::delete_cache_row(conn, key).await
    }

    async fn delete_expired_cache_rows(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::delete_expired_cache_rows(conn, now).await
    }

    async fn enqueue_task(&self, task: &AsyncTask) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::enqueue_task(conn, task).await
    }

    async fn due_tasks(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<AsyncTask>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::due_tasks(conn, now, limit).await
    }

    async fn complete_task(&self, id: Uuid, output: Option<&[u8]>) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::complete_task(conn, id, output).await
    }

    async fn reschedule_task(&self, id: Uuid, scheduled_at: DateTime<Utc>, attempts: i32) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::reschedule_task(conn, id, scheduled_at, attempts).await
    }

    async fn schedule_notification(&self, notification: &NewNotification) -> StoreResult<bool> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::schedule_notification(conn, notification).await
    }

    async fn due_notifications(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<ScheduledNotification>> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::due_notifications(conn, now, limit).await
    }

    async fn mark_notification_sent(&self, id: i64) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = tx_conn!(guard);
        q::mark_notification_sent(conn, id).await
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(&self) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.take().ok_or(StoreError::TxFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.take().ok_or(StoreError::TxFinished)?;
        tx.rollback().await?;
        Ok(())
    }

    fn as_backend(self: Arc<Self>) -> Arc<dyn StoreBackend> {
        self
    }
}
