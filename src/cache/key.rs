//! Typed composite cache keys.
//!
//! A cache key is a tagged tuple of a prefix namespace and exactly one
//! payload, numeric or textual. The string form exists for logging and key
//! comparisons only; nothing parses it back.

use std::fmt;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Closed set of built-in key namespaces, plus runtime-registered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Prefix {
    User,
    ApiKey,
    Org,
    OrgProperties,
    PropertyById,
    PropertyBySitekey,
    UserOrgs,
    OrgUsers,
    UserApiKeys,
    Subscription,
    Notification,
    Session,
    Template,
    PropertyAuditLogs,
    OrgAuditLogs,
    UserAuditLogs,
    OrgPropertiesCount,
    UserPropertiesCount,
    UserAccountStats,
    PropertyStats,
    AsyncTask,
    /// A namespace registered at startup via [`register_prefix`].
    Custom(u16),
}

static CUSTOM_PREFIXES: Lazy<RwLock<Vec<String>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Register a new key namespace at startup.
///
/// Registering the same name twice returns the original prefix.
pub fn register_prefix(name: &str) -> Prefix {
    let mut registry = CUSTOM_PREFIXES.write();
    if let Some(idx) = registry.iter().position(|n| n == name) {
        return Prefix::Custom(idx as u16);
    }
    registry.push(name.to_string());
    Prefix::Custom((registry.len() - 1) as u16)
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Prefix::User => "user",
            Prefix::ApiKey => "api-key",
            Prefix::Org => "org",
            Prefix::OrgProperties => "org-properties",
            Prefix::PropertyById => "property-by-id",
            Prefix::PropertyBySitekey => "property-by-sitekey",
            Prefix::UserOrgs => "user-orgs",
            Prefix::OrgUsers => "org-users",
            Prefix::UserApiKeys => "user-api-keys",
            Prefix::Subscription => "subscription",
            Prefix::Notification => "notification",
            Prefix::Session => "session",
            Prefix::Template => "template",
            Prefix::PropertyAuditLogs => "property-audit-logs",
            Prefix::OrgAuditLogs => "org-audit-logs",
            Prefix::UserAuditLogs => "user-audit-logs",
            Prefix::OrgPropertiesCount => "org-properties-count",
            Prefix::UserPropertiesCount => "user-properties-count",
            Prefix::UserAccountStats => "user-account-stats",
            Prefix::PropertyStats => "property-stats",
            Prefix::AsyncTask => "async-task",
            Prefix::Custom(idx) => {
                let registry = CUSTOM_PREFIXES.read();
                return match registry.get(*idx as usize) {
                    Some(name) => f.write_str(name),
                    None => write!(f, "custom-{}", idx),
                };
            }
        };
        f.write_str(name)
    }
}

/// Payload of a cache key; exactly one form is meaningful per prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Payload {
    Num(i64),
    Text(String),
}

/// A namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefix: Prefix,
    payload: Payload,
}

impl CacheKey {
    /// A key with a numeric payload.
    pub fn num(prefix: Prefix, id: i64) -> Self {
        Self {
            prefix,
            payload: Payload::Num(id),
        }
    }

    /// A key with a textual payload.
    pub fn text(prefix: Prefix, text: impl Into<String>) -> Self {
        Self {
            prefix,
            payload: Payload::Text(text.into()),
        }
    }

    /// The key's namespace.
    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    /// The numeric payload, when this key carries one.
    pub fn id(&self) -> Option<i64> {
        match &self.payload {
            Payload::Num(id) => Some(*id),
            Payload::Text(_) => None,
        }
    }

    /// The textual payload, when this key carries one.
    pub fn name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Num(_) => None,
            Payload::Text(t) => Some(t.as_str()),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Num(id) => write!(f, "{}/{}", self.prefix, id),
            Payload::Text(t) => write!(f, "{}/{}", self.prefix, t),
        }
    }
}
