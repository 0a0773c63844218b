//! API key operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSource, TargetKind, TargetRef};
use crate::cache::{Cache, CachedValue};
use crate::context::Context;
use crate::db::{ApiKey, ApiKeyScope, NewApiKey, StoreError, StoreResult};
use crate::keys::secret_from_uuid;

use super::reader::{read_list, read_one, EntityLoader, ListLoader};
use super::{ckeys, BusinessStore};

/// User-editable API key fields.
#[derive(Debug, Clone)]
pub struct ApiKeyParams {
    /// Owning organization.
    pub org_id: i64,
    /// Scope tag.
    pub scope: ApiKeyScope,
    /// Sustained request budget per second.
    pub rate_per_second: i32,
    /// Burst budget.
    pub burst: i32,
    /// Hard expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the key may only read.
    pub read_only: bool,
}

impl BusinessStore {
    /// Create an API key with a freshly generated secret.
    pub async fn create_api_key(
        &self,
        ctx: &Context,
        user_id: i64,
        params: ApiKeyParams,
    ) -> StoreResult<ApiKey> {
        let backend = self.backend()?.clone();
        let key = backend
            .insert_api_key(&NewApiKey {
                secret: secret_from_uuid(&Uuid::new_v4()),
                org_id: params.org_id,
                user_id,
                scope: params.scope,
                rate_per_second: params.rate_per_second,
                burst: params.burst,
                expires_at: params.expires_at,
                read_only: params.read_only,
            })
            .await?;

        if let Err(e) = self
            .cache()
            .set(&ckeys::api_key(&key.secret), CachedValue::of(key.clone()))
        {
            log::warn!("failed to cache api key {}: {}", key.id, e);
        }
        self.cache().delete(&ckeys::user_api_keys(user_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Create,
            AuditSource::Portal,
            TargetRef::new(TargetKind::ApiKey, key.id),
        );
        self.record_event(ctx, event).await;

        Ok(key)
    }

    /// Fetch an API key by its secret, through the cache.
    pub async fn retrieve_api_key(&self, secret: &str) -> StoreResult<Arc<ApiKey>> {
        let backend = self.backend_opt();
        let owned = secret.to_string();
        let loader = EntityLoader::new(move || {
            let backend = backend.clone();
            let secret = owned.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .api_key_by_secret(&secret)
                    .await
            }
        });
        read_one(self.cache(), &ckeys::api_key(secret), loader).await
    }

    /// All API keys owned by a user, through the cache.
    pub async fn retrieve_user_api_keys(&self, user_id: i64) -> StoreResult<Arc<Vec<ApiKey>>> {
        let backend = self.backend_opt();
        let loader = ListLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .api_keys_by_user(user_id)
                    .await
            }
        });
        read_list(self.cache(), &ckeys::user_api_keys(user_id), loader).await
    }

    /// Rotate an API key's secret.
    ///
    /// The old secret's cache entry drops on the live cache immediately,
    /// before the store runs and even under a transaction, so no request can
    /// authenticate against the retired secret while the rotation is in
    /// flight.
    pub async fn rotate_api_key(
        &self,
        ctx: &Context,
        user_id: i64,
        key_id: i64,
        old_secret: &str,
    ) -> StoreResult<ApiKey> {
        let backend = self.backend()?.clone();
        let new_secret = secret_from_uuid(&Uuid::new_v4());

        self.live().delete(&ckeys::api_key(old_secret));
        backend.update_api_key_secret(key_id, &new_secret).await?;
        let rotated = backend.api_key_by_secret(&new_secret).await?;

        if let Err(e) = self.cache().set(
            &ckeys::api_key(&rotated.secret),
            CachedValue::of(rotated.clone()),
        ) {
            log::warn!("failed to cache api key {}: {}", rotated.id, e);
        }
        self.cache().delete(&ckeys::user_api_keys(rotated.user_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Rotate,
            AuditSource::Portal,
            TargetRef::new(TargetKind::ApiKey, key_id),
        );
        self.record_event(ctx, event).await;

        Ok(rotated)
    }

    /// Enable or disable an API key.
    pub async fn set_api_key_enabled(
        &self,
        ctx: &Context,
        user_id: i64,
        key: &ApiKey,
        enabled: bool,
    ) -> StoreResult<()> {
        let backend = self.backend()?.clone();
        backend.set_api_key_enabled(key.id, enabled).await?;

        self.cache().delete(&ckeys::api_key(&key.secret));
        self.cache().delete(&ckeys::user_api_keys(key.user_id));

        let action = if enabled {
            AuditAction::Enable
        } else {
            AuditAction::Disable
        };
        let event = AuditEvent::new(
            user_id,
            action,
            AuditSource::Portal,
            TargetRef::new(TargetKind::ApiKey, key.id),
        );
        self.record_event(ctx, event).await;

        Ok(())
    }

    /// Hard-delete an API key. Always invalidates both the per-key entry
    /// and the owner's key list.
    pub async fn delete_api_key(&self, ctx: &Context, user_id: i64, key: &ApiKey) -> StoreResult<()> {
        let backend = self.backend()?.clone();
        backend.delete_api_key(key.id).await?;

        self.cache().delete(&ckeys::api_key(&key.secret));
        self.cache().delete(&ckeys::user_api_keys(key.user_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Delete,
            AuditSource::Portal,
            TargetRef::new(TargetKind::ApiKey, key.id),
        );
        self.record_event(ctx, event).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::service;
    use super::*;
    use crate::cache::CacheError;

    fn params() -> ApiKeyParams {
        ApiKeyParams {
            org_id: 10,
            scope: ApiKeyScope::Verify,
            rate_per_second: 25,
            burst: 50,
            expires_at: None,
            read_only: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();

        let key = store.create_api_key(&ctx, 1, params()).await.unwrap();
        assert!(key.secret.starts_with("pc_"));
        assert!(key.enabled);

        let cached = store.retrieve_api_key(&key.secret).await.unwrap();
        assert_eq!(cached.id, key.id);
        assert_eq!(svc.cache().loads(), 0);
    }

    #[tokio::test]
    async fn test_rotation_invalidates_old_secret() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let key = store.create_api_key(&ctx, 1, params()).await.unwrap();

        let rotated = store
            .rotate_api_key(&ctx, 1, key.id, &key.secret)
            .await
            .unwrap();
        assert_ne!(rotated.secret, key.secret);

        // The old secret is gone from the cache and from the store.
        assert!(matches!(
            store.retrieve_api_key(&key.secret).await,
            Err(StoreError::Cache(CacheError::NegativeHit))
        ));
        assert_eq!(store.retrieve_api_key(&rotated.secret).await.unwrap().id, key.id);
    }

    #[tokio::test]
    async fn test_delete_invalidates_key_and_list() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let key = store.create_api_key(&ctx, 1, params()).await.unwrap();
        // Warm the list.
        assert_eq!(store.retrieve_user_api_keys(1).await.unwrap().len(), 1);

        store.delete_api_key(&ctx, 1, &key).await.unwrap();

        assert!(matches!(
            store.retrieve_api_key(&key.secret).await,
            Err(StoreError::Cache(CacheError::NegativeHit))
        ));
        assert!(store.retrieve_user_api_keys(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disable_enable_cycle() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let key = store.create_api_key(&ctx, 1, params()).await.unwrap();

        store.set_api_key_enabled(&ctx, 1, &key, false).await.unwrap();
        assert!(!store.retrieve_api_key(&key.secret).await.unwrap().enabled);
        store.set_api_key_enabled(&ctx, 1, &key, true).await.unwrap();
        assert!(store.retrieve_api_key(&key.secret).await.unwrap().enabled);
    }
}
