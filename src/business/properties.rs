//! Property operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSource, TargetKind, TargetRef};
use crate::cache::CachedValue;
use crate::context::Context;
use crate::db::{
    AuditLogEntry, Difficulty, GrowthClass, NewProperty, Property, StoreError, StoreResult,
};
use crate::keys::sitekey_from_uuid;

use super::bulk::{bulk_read, BulkInput, BulkOutcome};
use super::reader::{read_list, read_one, EntityLoader, ListLoader, PropertyLoader};
use super::validate::validate_property_name;
use super::{ckeys, BusinessStore};

/// How many audit entries a per-entity log view fetches.
const AUDIT_LOG_LIMIT: i64 = 100;

/// User-editable property fields.
#[derive(Debug, Clone)]
pub struct PropertyParams {
    /// Owning organization.
    pub org_id: i64,
    /// Display name, unique within the organization.
    pub name: String,
    /// Widget domain.
    pub domain: String,
    /// Base difficulty.
    pub difficulty: Difficulty,
    /// Difficulty growth class.
    pub growth: GrowthClass,
    /// Validity interval start.
    pub valid_from: Option<DateTime<Utc>>,
    /// Validity interval end.
    pub valid_until: Option<DateTime<Utc>>,
    /// Redemption limit per issued puzzle.
    pub max_redemptions: i32,
    /// Accept subdomains of `domain`.
    pub allow_subdomains: bool,
    /// Accept localhost origins.
    pub allow_localhost: bool,
}

impl BusinessStore {
    /// Create a property with a freshly generated site key.
    pub async fn create_property(
        &self,
        ctx: &Context,
        user_id: i64,
        params: PropertyParams,
    ) -> StoreResult<Property> {
        validate_property_name(&params.name)?;
        let backend = self.backend()?.clone();

        let siblings = self.retrieve_org_properties(params.org_id).await?;
        if siblings
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(&params.name))
        {
            return Err(StoreError::DuplicateName);
        }

        let row = NewProperty {
            sitekey: sitekey_from_uuid(&Uuid::new_v4()),
            org_id: params.org_id,
            creator_id: user_id,
            name: params.name,
            domain: params.domain,
            difficulty: params.difficulty,
            growth: params.growth,
            valid_from: params.valid_from,
            valid_until: params.valid_until,
            max_redemptions: params.max_redemptions,
            allow_subdomains: params.allow_subdomains,
            allow_localhost: params.allow_localhost,
        };
        let property = backend.insert_property(&row).await?;

        self.cache_property(&property);
        self.invalidate_property_lists(&property, user_id).await;

        let event = AuditEvent::new(
            user_id,
            AuditAction::Create,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Property, property.id),
        )
        .with_after(&property);
        self.record_event(ctx, event).await;

        Ok(property)
    }

    /// Fetch a property by numeric ID, through the cache.
    pub async fn retrieve_property(&self, id: i64) -> StoreResult<Arc<Property>> {
        let backend = self.backend_opt();
        let loader = EntityLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .property_by_id(id)
                    .await
            }
        });
        read_one(self.cache(), &ckeys::property_id(id), loader).await
    }

    /// Fetch a property by site key, through the cache.
    ///
    /// This is the hottest read in the system: every widget load and every
    /// verification resolves a site key. Refresh-ahead hands the re-query to
    /// the background warmer when one is wired.
    pub async fn retrieve_property_by_sitekey(&self, sitekey: &str) -> StoreResult<Arc<Property>> {
        let backend = self.backend_opt();
        let owned = sitekey.to_string();
        let loader = PropertyLoader::new(
            move || {
                let backend = backend.clone();
                let sitekey = owned.clone();
                async move {
                    backend
                        .ok_or(StoreError::Maintenance)?
                        .property_by_sitekey(&sitekey)
                        .await
                }
            },
            self.warmer(),
        );
        read_one(self.cache(), &ckeys::property_sitekey(sitekey), loader).await
    }

    /// All live properties of an organization, through the cache.
    pub async fn retrieve_org_properties(&self, org_id: i64) -> StoreResult<Arc<Vec<Property>>> {
        let backend = self.backend_opt();
        let loader = ListLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .properties_by_org(org_id)
                    .await
            }
        });
        read_list(self.cache(), &ckeys::org_properties(org_id), loader).await
    }

    /// Resolve many properties by ID with one store round trip for the cold
    /// subset. `inputs` pairs each ID with its request multiplicity.
    pub async fn retrieve_properties_bulk(
        &self,
        inputs: &[(i64, u32)],
        negative_threshold: u32,
    ) -> StoreResult<BulkOutcome<Property>> {
        let backend = self.backend_opt();
        let bulk_inputs = inputs
            .iter()
            .map(|(id, multiplicity)| BulkInput {
                key: ckeys::property_id(*id),
                multiplicity: *multiplicity,
            })
            .collect();

        bulk_read(self.cache(), bulk_inputs, negative_threshold, move |keys| {
            async move {
                let ids: Vec<i64> = keys.iter().filter_map(|k| k.id()).collect();
                let rows = backend
                    .ok_or(StoreError::Maintenance)?
                    .properties_by_ids(&ids)
                    .await?;
                Ok(rows
                    .into_iter()
                    .map(|row| (ckeys::property_id(row.id), row))
                    .collect())
            }
            .boxed()
        })
        .await
    }

    /// Update a property's editable fields.
    pub async fn update_property(
        &self,
        ctx: &Context,
        user_id: i64,
        property: Property,
    ) -> StoreResult<Property> {
        validate_property_name(&property.name)?;
        let backend = self.backend()?.clone();

        let before = backend.property_by_id(property.id).await?;
        if !before.name.eq_ignore_ascii_case(&property.name) {
            let siblings = backend.properties_by_org(before.org_id).await?;
            if siblings
                .iter()
                .any(|p| p.id != property.id && p.name.eq_ignore_ascii_case(&property.name))
            {
                return Err(StoreError::DuplicateName);
            }
        }

        backend.update_property(&property).await?;
        let updated = backend.property_by_id(property.id).await?;

        self.cache_property(&updated);
        self.cache().delete(&ckeys::org_properties(updated.org_id));
        self.cache().delete(&ckeys::property_audit_logs(updated.id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Update,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Property, updated.id),
        )
        .with_before(&before)
        .with_after(&updated);
        self.record_event(ctx, event).await;

        Ok(updated)
    }

    /// Soft-delete a property and invalidate everything that may embed it.
    pub async fn delete_property(&self, ctx: &Context, user_id: i64, id: i64) -> StoreResult<()> {
        let backend = self.backend()?.clone();
        let property = backend.property_by_id(id).await?;
        backend.soft_delete_property(id).await?;

        self.cache().set_missing(&ckeys::property_id(id));
        self.cache()
            .set_missing(&ckeys::property_sitekey(&property.sitekey));
        self.invalidate_property_lists(&property, user_id).await;
        self.cache().delete(&ckeys::property_audit_logs(id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Delete,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Property, id),
        )
        .with_before(&property);
        self.record_event(ctx, event).await;

        Ok(())
    }

    /// Live property count of an organization, materialised as its own key.
    pub async fn retrieve_org_property_count(&self, org_id: i64) -> StoreResult<i64> {
        let backend = self.backend_opt();
        let loader = EntityLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .count_properties_by_org(org_id)
                    .await
            }
        });
        let count: Arc<i64> =
            read_one(self.cache(), &ckeys::org_properties_count(org_id), loader).await?;
        Ok(*count)
    }

    /// Live property count of a user, materialised as its own key.
    pub async fn retrieve_user_property_count(&self, user_id: i64) -> StoreResult<i64> {
        let backend = self.backend_opt();
        let loader = EntityLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .count_properties_by_user(user_id)
                    .await
            }
        });
        let count: Arc<i64> =
            read_one(self.cache(), &ckeys::user_properties_count(user_id), loader).await?;
        Ok(*count)
    }

    /// Recent audit entries for a property, through the cache.
    pub async fn retrieve_property_audit_logs(
        &self,
        property_id: i64,
    ) -> StoreResult<Arc<Vec<AuditLogEntry>>> {
        let backend = self.backend_opt();
        let loader = ListLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .audit_entries_for(crate::audit::TargetKind::Property.as_str(), property_id, AUDIT_LOG_LIMIT)
                    .await
            }
        });
        read_list(self.cache(), &ckeys::property_audit_logs(property_id), loader).await
    }

    /// Store a property under both of its lookup keys.
    fn cache_property(&self, property: &Property) {
        let value = Arc::new(property.clone());
        if let Err(e) = self
            .cache()
            .set(&ckeys::property_id(property.id), CachedValue::shared(value.clone()))
        {
            log::warn!("failed to cache property {}: {}", property.id, e);
        }
        if let Err(e) = self.cache().set(
            &ckeys::property_sitekey(&property.sitekey),
            CachedValue::shared(value),
        ) {
            log::warn!("failed to cache property {}: {}", property.sitekey, e);
        }
    }

    /// Drop the org's property list, its count, and the owner's and
    /// creator's per-user counts.
    async fn invalidate_property_lists(&self, property: &Property, acting_user: i64) {
        self.cache().delete(&ckeys::org_properties(property.org_id));
        self.cache()
            .delete(&ckeys::org_properties_count(property.org_id));
        self.cache()
            .delete(&ckeys::user_properties_count(property.creator_id));
        self.cache()
            .delete(&ckeys::user_properties_count(acting_user));
        if let Ok(backend) = self.backend() {
            if let Ok(org) = backend.org_by_id(property.org_id).await {
                self.cache()
                    .delete(&ckeys::user_properties_count(org.user_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::service;
    use super::*;
    use crate::cache::CacheError;

    fn params(org_id: i64, name: &str) -> PropertyParams {
        PropertyParams {
            org_id,
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
    async fn test_create_then_read_is_cached() {
        let (svc, backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let property = store.create_property(&ctx, 1, params(10, "site")).await.unwrap();

        // Both lookup keys answer from cache; no loads happen.
        let by_id = store.retrieve_property(property.id).await.unwrap();
        let by_key = store
            .retrieve_property_by_sitekey(&property.sitekey)
            .await
            .unwrap();
        assert_eq!(by_id.id, by_key.id);
        assert_eq!(svc.cache().loads(), 0);
        drop(backend);
    }

    #[tokio::test]
    async fn test_duplicate_name_in_org() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        store.create_property(&ctx, 1, params(10, "site")).await.unwrap();

        assert!(matches!(
            store.create_property(&ctx, 1, params(10, "SITE")).await,
            Err(StoreError::DuplicateName)
        ));
        // Same name in a different org is fine.
        store.create_property(&ctx, 1, params(11, "site")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_property_invalidates_lookups() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let property = store.create_property(&ctx, 1, params(10, "site")).await.unwrap();
        store.retrieve_org_property_count(10).await.unwrap();

        store.delete_property(&ctx, 1, property.id).await.unwrap();

        // Both entity keys are negative now.
        assert!(matches!(
            store.retrieve_property(property.id).await,
            Err(StoreError::Cache(CacheError::NegativeHit))
        ));
        assert!(matches!(
            store.retrieve_property_by_sitekey(&property.sitekey).await,
            Err(StoreError::Cache(CacheError::NegativeHit))
        ));
        // The materialised count was invalidated and recomputes to zero.
        assert_eq!(store.retrieve_org_property_count(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_read_partial() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let a = store.create_property(&ctx, 1, params(10, "a")).await.unwrap();
        let b = store.create_property(&ctx, 1, params(10, "b")).await.unwrap();

        let outcome = store
            .retrieve_properties_bulk(&[(a.id, 1), (b.id, 1), (9999, 5)], 1)
            .await
            .unwrap();
        assert_eq!(outcome.cached.len(), 2);
        assert!(outcome.fetched.is_empty());

        // The unknown ID went negative and is dropped on the next call.
        let outcome = store
            .retrieve_properties_bulk(&[(9999, 1)], 1)
            .await
            .unwrap();
        assert!(outcome.cached.is_empty() && outcome.fetched.is_empty());
    }

    #[tokio::test]
    async fn test_update_rejects_duplicate_name() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        store.create_property(&ctx, 1, params(10, "first")).await.unwrap();
        let second = store.create_property(&ctx, 1, params(10, "second")).await.unwrap();

        let mut renamed = second.clone();
        renamed.name = "first".to_string();
        assert!(matches!(
            store.update_property(&ctx, 1, renamed).await,
            Err(StoreError::DuplicateName)
        ));
    }
}
