//! Audit event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::AuditLogEntry;

/// What happened. Closed set; the store persists the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Rotate,
    Enable,
    Disable,
    Login,
    Logout,
    Invite,
    RemoveMember,
    LeaveOrg,
}

impl AuditAction {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Rotate => "rotate",
            AuditAction::Enable => "enable",
            AuditAction::Disable => "disable",
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::Invite => "invite",
            AuditAction::RemoveMember => "remove-member",
            AuditAction::LeaveOrg => "leave-org",
        }
    }
}

/// Where the action originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum AuditSource {
    Portal,
    Api,
    Job,
    System,
}

impl AuditSource {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSource::Portal => "portal",
            AuditSource::Api => "api",
            AuditSource::Job => "job",
            AuditSource::System => "system",
        }
    }
}

/// Kind of the entity an event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum TargetKind {
    User,
    Org,
    Property,
    ApiKey,
    Subscription,
    Notification,
}

impl TargetKind {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Org => "org",
            TargetKind::Property => "property",
            TargetKind::ApiKey => "api-key",
            TargetKind::Subscription => "subscription",
            TargetKind::Notification => "notification",
        }
    }
}

/// Reference to the entity an event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    /// Entity kind.
    pub kind: TargetKind,
    /// Entity numeric ID.
    pub id: i64,
}

impl TargetRef {
    /// Build a target reference.
    pub fn new(kind: TargetKind, id: i64) -> Self {
        Self { kind, id }
    }
}

/// One audit log event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub id: Uuid,
    /// Acting user.
    pub user_id: i64,
    /// What happened.
    pub action: AuditAction,
    /// Where it originated.
    pub source: AuditSource,
    /// The entity it happened to.
    pub target: TargetRef,
    /// Serialized state before the change, for updates.
    pub before: Option<serde_json::Value>,
    /// Serialized state after the change, for updates.
    pub after: Option<serde_json::Value>,
    /// Ambient session ID, attached by the sink.
    pub session_id: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    /// A new event with a fresh ID and the current timestamp.
    pub fn new(user_id: i64, action: AuditAction, source: AuditSource, target: TargetRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            action,
            source,
            target,
            before: None,
            after: None,
            session_id: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the pre-change state. Unserializable payloads are dropped with
    /// a warning rather than failing the operation that emitted the event.
    pub fn with_before<T: Serialize>(mut self, value: &T) -> Self {
        self.before = to_payload(value);
        self
    }

    /// Attach the post-change state.
    pub fn with_after<T: Serialize>(mut self, value: &T) -> Self {
        self.after = to_payload(value);
        self
    }

    /// Convert to the store row shape.
    pub fn to_entry(&self) -> AuditLogEntry {
        AuditLogEntry {
            id: self.id,
            user_id: self.user_id,
            action: self.action.as_str().to_string(),
            source: self.source.as_str().to_string(),
            target_kind: self.target.kind.as_str().to_string(),
            target_id: self.target.id,
            before: self.before.clone(),
            after: self.after.clone(),
            session_id: self.session_id.clone(),
            created_at: self.created_at,
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("dropping unserializable audit payload: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_to_entry() {
        let event = AuditEvent::new(
            7,
            AuditAction::Update,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Property, 42),
        )
        .with_before(&serde_json::json!({"name": "old"}))
        .with_after(&serde_json::json!({"name": "new"}));

        let entry = event.to_entry();
        assert_eq!(entry.user_id, 7);
        assert_eq!(entry.action, "update");
        assert_eq!(entry.target_kind, "property");
        assert_eq!(entry.target_id, 42);
        assert_eq!(entry.before.unwrap()["name"], "old");
        assert_eq!(entry.after.unwrap()["name"], "new");
    }
}
