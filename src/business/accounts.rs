//! User, organization, and membership operations.

use std::sync::Arc;

use crate::audit::{AuditAction, AuditEvent, AuditSource, TargetKind, TargetRef};
use crate::cache::CachedValue;
use crate::context::Context;
use crate::db::{
    Membership, MembershipLevel, NewOrg, NewUser, Org, OrgWithLevel, StoreError, StoreResult, User,
};

use super::reader::{read_list, read_one, EntityLoader, ListLoader};
use super::validate::validate_org_name;
use super::{ckeys, BusinessStore};

impl BusinessStore {
    /// Create a user.
    pub async fn create_user(&self, ctx: &Context, user: NewUser) -> StoreResult<User> {
        let backend = self.backend()?.clone();
        let created = backend.insert_user(&user).await?;

        if let Err(e) = self
            .cache()
            .set(&ckeys::user(created.id), CachedValue::of(created.clone()))
        {
            log::warn!("failed to cache user {}: {}", created.id, e);
        }

        let event = AuditEvent::new(
            created.id,
            AuditAction::Create,
            AuditSource::Portal,
            TargetRef::new(TargetKind::User, created.id),
        )
        .with_after(&created);
        self.record_event(ctx, event).await;

        Ok(created)
    }

    /// Fetch a user by ID, through the cache.
    pub async fn retrieve_user(&self, id: i64) -> StoreResult<Arc<User>> {
        let backend = self.backend_opt();
        let loader = EntityLoader::new(move || {
            let backend = backend.clone();
            async move { backend.ok_or(StoreError::Maintenance)?.user_by_id(id).await }
        });
        read_one(self.cache(), &ckeys::user(id), loader).await
    }

    /// Soft-delete a user.
    ///
    /// Cascades: the user's organizations are tombstoned too, and its API
    /// keys are hard-deleted; cache entries for all of them drop out here.
    pub async fn delete_user(&self, ctx: &Context, id: i64) -> StoreResult<()> {
        let backend = self.backend()?.clone();
        let user = backend.user_by_id(id).await?;

        backend.soft_delete_user(id).await?;
        let org_ids = backend.soft_delete_orgs_of_user(id).await?;
        let secrets = backend.delete_api_keys_for_user(id).await?;

        self.cache().set_missing(&ckeys::user(id));
        self.cache().delete(&ckeys::user_orgs(id));
        self.cache().delete(&ckeys::user_api_keys(id));
        self.cache().delete(&ckeys::user_properties_count(id));
        self.cache().delete(&ckeys::user_account_stats(id));
        self.cache().delete(&ckeys::user_audit_logs(id));
        for org_id in &org_ids {
            self.cache().set_missing(&ckeys::org(*org_id));
            self.cache().delete(&ckeys::org_users(*org_id));
            self.cache().delete(&ckeys::org_properties(*org_id));
            self.cache().delete(&ckeys::org_properties_count(*org_id));
            self.cache().delete(&ckeys::subscription(*org_id));
        }
        for secret in &secrets {
            self.cache().delete(&ckeys::api_key(secret));
        }

        let event = AuditEvent::new(
            id,
            AuditAction::Delete,
            AuditSource::Portal,
            TargetRef::new(TargetKind::User, id),
        )
        .with_before(&user);
        self.record_event(ctx, event).await;

        Ok(())
    }

    /// Create an organization owned by `user_id`.
    pub async fn create_org(&self, ctx: &Context, user_id: i64, name: &str) -> StoreResult<Org> {
        validate_org_name(name)?;
        let backend = self.backend()?.clone();

        let existing = self.retrieve_user_orgs(user_id).await?;
        if existing
            .iter()
            .any(|o| o.level == MembershipLevel::Owner && o.org.name.eq_ignore_ascii_case(name))
        {
            return Err(StoreError::DuplicateName);
        }

        let org = backend
            .insert_org(&NewOrg {
                user_id,
                name: name.to_string(),
            })
            .await?;

        if let Err(e) = self
            .cache()
            .set(&ckeys::org(org.id), CachedValue::of(org.clone()))
        {
            log::warn!("failed to cache org {}: {}", org.id, e);
        }
        self.cache().delete(&ckeys::user_orgs(user_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Create,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, org.id),
        )
        .with_after(&org);
        self.record_event(ctx, event).await;

        Ok(org)
    }

    /// Fetch an organization for a user, verifying access.
    ///
    /// Precedence of truth: (1) cached org plus a cached org-users list that
    /// contains the user, (2) the cached user-orgs list, (3) the SQL lookup
    /// with the embedded access level. If the user owns the org the level is
    /// always `Owner`, whatever a stored membership row says.
    pub async fn retrieve_org(
        &self,
        user_id: i64,
        org_id: i64,
    ) -> StoreResult<(Arc<Org>, MembershipLevel)> {
        // 1: both the org and its member list are hot.
        if let Ok(value) = self.cache().get(&ckeys::org(org_id)) {
            if let Ok(org) = value.downcast::<Org>() {
                if org.user_id == user_id {
                    return Ok((org, MembershipLevel::Owner));
                }
                if let Ok(members) = self.cache().get(&ckeys::org_users(org_id)) {
                    if let Ok(members) = members.downcast::<Vec<Membership>>() {
                        if let Some(m) = members.iter().find(|m| m.user_id == user_id) {
                            return Ok((org, m.level));
                        }
                    }
                }
                // 2: the user's own org list.
                if let Ok(user_orgs) = self.cache().get(&ckeys::user_orgs(user_id)) {
                    if let Ok(user_orgs) = user_orgs.downcast::<Vec<OrgWithLevel>>() {
                        if let Some(o) = user_orgs.iter().find(|o| o.org.id == org_id) {
                            return Ok((org, o.level));
                        }
                    }
                }
            }
        }

        // 3: the store, with the access level embedded in the query.
        let backend = self.backend()?.clone();
        match backend.org_with_level(user_id, org_id).await {
            Ok(with_level) => {
                let level = if with_level.org.user_id == user_id {
                    MembershipLevel::Owner
                } else {
                    with_level.level
                };
                let org = Arc::new(with_level.org);
                if let Err(e) = self
                    .cache()
                    .set(&ckeys::org(org_id), CachedValue::shared(org.clone()))
                {
                    log::warn!("failed to cache org {}: {}", org_id, e);
                }
                Ok((org, level))
            }
            Err(StoreError::NotFound) => {
                // Distinguish a missing org from missing access.
                match backend.org_by_id(org_id).await {
                    Ok(_) => Err(StoreError::PermissionDenied),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// All organizations a user owns or belongs to, through the cache.
    pub async fn retrieve_user_orgs(&self, user_id: i64) -> StoreResult<Arc<Vec<OrgWithLevel>>> {
        let backend = self.backend_opt();
        let loader = ListLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .orgs_by_user(user_id)
                    .await
            }
        });
        read_list(self.cache(), &ckeys::user_orgs(user_id), loader).await
    }

    /// Stored membership rows of an organization, through the cache.
    pub async fn retrieve_org_users(&self, org_id: i64) -> StoreResult<Arc<Vec<Membership>>> {
        let backend = self.backend_opt();
        let loader = ListLoader::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .ok_or(StoreError::Maintenance)?
                    .users_by_org(org_id)
                    .await
            }
        });
        read_list(self.cache(), &ckeys::org_users(org_id), loader).await
    }

    /// Rename an organization; owner only.
    pub async fn update_org(
        &self,
        ctx: &Context,
        user_id: i64,
        org_id: i64,
        name: &str,
    ) -> StoreResult<Org> {
        validate_org_name(name)?;
        let (org, level) = self.retrieve_org(user_id, org_id).await?;
        if level != MembershipLevel::Owner {
            return Err(StoreError::PermissionDenied);
        }

        let backend = self.backend()?.clone();
        let mut updated = (*org).clone();
        updated.name = name.to_string();
        backend.update_org(&updated).await?;

        if let Err(e) = self
            .cache()
            .set(&ckeys::org(org_id), CachedValue::of(updated.clone()))
        {
            log::warn!("failed to cache org {}: {}", org_id, e);
        }
        self.cache().delete(&ckeys::user_orgs(user_id));
        self.cache().delete(&ckeys::org_audit_logs(org_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Update,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, org_id),
        )
        .with_before(&*org)
        .with_after(&updated);
        self.record_event(ctx, event).await;

        Ok(updated)
    }

    /// Soft-delete an organization; owner only.
    pub async fn delete_org(&self, ctx: &Context, user_id: i64, org_id: i64) -> StoreResult<()> {
        let (org, level) = self.retrieve_org(user_id, org_id).await?;
        if level != MembershipLevel::Owner {
            return Err(StoreError::PermissionDenied);
        }

        let backend = self.backend()?.clone();
        backend.soft_delete_org(org_id).await?;

        self.cache().set_missing(&ckeys::org(org_id));
        self.cache().delete(&ckeys::org_users(org_id));
        self.cache().delete(&ckeys::org_properties(org_id));
        self.cache().delete(&ckeys::org_properties_count(org_id));
        self.cache().delete(&ckeys::subscription(org_id));
        self.cache().delete(&ckeys::org_audit_logs(org_id));
        self.cache().delete(&ckeys::user_orgs(user_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Delete,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, org_id),
        )
        .with_before(&*org);
        self.record_event(ctx, event).await;

        Ok(())
    }

    /// Invite a user into an organization.
    pub async fn invite_member(
        &self,
        ctx: &Context,
        acting_user: i64,
        org_id: i64,
        invited_user: i64,
    ) -> StoreResult<()> {
        let (_, level) = self.retrieve_org(acting_user, org_id).await?;
        if level != MembershipLevel::Owner {
            return Err(StoreError::PermissionDenied);
        }

        let backend = self.backend()?.clone();
        backend
            .insert_membership(org_id, invited_user, MembershipLevel::Invited)
            .await?;

        self.cache().delete(&ckeys::org_users(org_id));
        self.cache().delete(&ckeys::user_orgs(invited_user));

        let event = AuditEvent::new(
            acting_user,
            AuditAction::Invite,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, org_id),
        );
        self.record_event(ctx, event).await;

        Ok(())
    }

    /// Accept an invitation, promoting the membership to `Member`.
    pub async fn accept_invite(&self, ctx: &Context, user_id: i64, org_id: i64) -> StoreResult<()> {
        let backend = self.backend()?.clone();
        backend
            .update_membership_level(org_id, user_id, MembershipLevel::Member)
            .await?;

        self.cache().delete(&ckeys::org_users(org_id));
        self.cache().delete(&ckeys::user_orgs(user_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::Update,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, org_id),
        );
        self.record_event(ctx, event).await;

        Ok(())
    }

    /// Remove a member from an organization; owner only.
    pub async fn remove_member(
        &self,
        ctx: &Context,
        acting_user: i64,
        org_id: i64,
        member: i64,
    ) -> StoreResult<()> {
        let (_, level) = self.retrieve_org(acting_user, org_id).await?;
        if level != MembershipLevel::Owner {
            return Err(StoreError::PermissionDenied);
        }

        let backend = self.backend()?.clone();
        backend.delete_membership(org_id, member).await?;

        self.cache().delete(&ckeys::org_users(org_id));
        self.cache().delete(&ckeys::user_orgs(member));

        let event = AuditEvent::new(
            acting_user,
            AuditAction::RemoveMember,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, org_id),
        );
        self.record_event(ctx, event).await;

        Ok(())
    }

    /// Leave an organization. Owners cannot leave their own org.
    pub async fn leave_org(&self, ctx: &Context, user_id: i64, org_id: i64) -> StoreResult<()> {
        let (org, _) = self.retrieve_org(user_id, org_id).await?;
        if org.user_id == user_id {
            return Err(StoreError::InvalidInput(
                "owners cannot leave their own organization".to_string(),
            ));
        }

        let backend = self.backend()?.clone();
        backend.delete_membership(org_id, user_id).await?;

        self.cache().delete(&ckeys::org_users(org_id));
        self.cache().delete(&ckeys::user_orgs(user_id));

        let event = AuditEvent::new(
            user_id,
            AuditAction::LeaveOrg,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, org_id),
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
    use crate::db::StoreBackend;

    async fn user(store: &BusinessStore, ctx: &Context, email: &str) -> User {
        store
            .create_user(
                ctx,
                NewUser {
                    email: email.to_string(),
                    name: email.to_string(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_owner_level_is_synthesised() {
        let (svc, backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let owner = user(&store, &ctx, "o@x.y").await;
        let org = store.create_org(&ctx, owner.id, "acme").await.unwrap();

        // Even a bogus stored membership row cannot demote the owner.
        backend
            .insert_membership(org.id, owner.id, MembershipLevel::Invited)
            .await
            .unwrap();

        let (_, level) = store.retrieve_org(owner.id, org.id).await.unwrap();
        assert_eq!(level, MembershipLevel::Owner);
    }

    #[tokio::test]
    async fn test_access_check_precedence_falls_back_to_sql() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let owner = user(&store, &ctx, "o@x.y").await;
        let member = user(&store, &ctx, "m@x.y").await;
        let stranger = user(&store, &ctx, "s@x.y").await;
        let org = store.create_org(&ctx, owner.id, "acme").await.unwrap();
        store
            .invite_member(&ctx, owner.id, org.id, member.id)
            .await
            .unwrap();
        store.accept_invite(&ctx, member.id, org.id).await.unwrap();

        let (got, level) = store.retrieve_org(member.id, org.id).await.unwrap();
        assert_eq!(got.id, org.id);
        assert_eq!(level, MembershipLevel::Member);

        // A user with no relationship to an existing org is denied.
        assert!(matches!(
            store.retrieve_org(stranger.id, org.id).await,
            Err(StoreError::PermissionDenied)
        ));
        // A missing org is NotFound, not PermissionDenied.
        assert!(matches!(
            store.retrieve_org(stranger.id, 424242).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_cached_member_list_answers_access_check() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let owner = user(&store, &ctx, "o@x.y").await;
        let member = user(&store, &ctx, "m@x.y").await;
        let org = store.create_org(&ctx, owner.id, "acme").await.unwrap();
        store
            .invite_member(&ctx, owner.id, org.id, member.id)
            .await
            .unwrap();
        store.accept_invite(&ctx, member.id, org.id).await.unwrap();

        // Warm org + member list, then check that the lookup stays cache-only.
        store.retrieve_org(member.id, org.id).await.unwrap();
        store.retrieve_org_users(org.id).await.unwrap();
        let loads_before = svc.cache().loads();
        let (_, level) = store.retrieve_org(member.id, org.id).await.unwrap();
        assert_eq!(level, MembershipLevel::Member);
        assert_eq!(svc.cache().loads(), loads_before);
    }

    #[tokio::test]
    async fn test_delete_user_cascades_into_cache() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let owner = user(&store, &ctx, "o@x.y").await;
        let org = store.create_org(&ctx, owner.id, "acme").await.unwrap();

        store.delete_user(&ctx, owner.id).await.unwrap();

        assert!(matches!(
            store.retrieve_user(owner.id).await,
            Err(StoreError::Cache(CacheError::NegativeHit))
        ));
        assert!(matches!(
            store.retrieve_org(owner.id, org.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_org_name_per_owner() {
        let (svc, _backend) = service();
        let ctx = Context::new("test");
        let store = svc.handle();
        let a = user(&store, &ctx, "a@x.y").await;
        let b = user(&store, &ctx, "b@x.y").await;

        store.create_org(&ctx, a.id, "acme").await.unwrap();
        assert!(matches!(
            store.create_org(&ctx, a.id, "Acme").await,
            Err(StoreError::DuplicateName)
        ));
        // A different owner may reuse the name.
        store.create_org(&ctx, b.id, "acme").await.unwrap();
    }
}
