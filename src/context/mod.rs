//! # Ambient Request Context
//!
//! A small, cheaply cloneable context carrying per-request attributes
//! (trace ID, session ID, service name). Handlers attach values on entry and
//! loggers extract them on log. Attachment is scoped: `with` returns a new
//! context, it never mutates the parent and there is no global.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Keys for ambient context attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKey {
    /// Correlation ID for a request or a job run.
    TraceId,
    /// The current session ID, when a session is attached.
    SessionId,
    /// Logical service name.
    Service,
    /// Name of the running background job.
    JobName,
    /// Acting user ID.
    UserId,
}

impl ContextKey {
    fn label(&self) -> &'static str {
        match self {
            ContextKey::TraceId => "trace_id",
            ContextKey::SessionId => "session_id",
            ContextKey::Service => "service",
            ContextKey::JobName => "job",
            ContextKey::UserId => "user_id",
        }
    }
}

/// Immutable chain of attached attributes.
#[derive(Clone)]
pub struct Context {
    values: Arc<Vec<(ContextKey, String)>>,
}

impl Context {
    /// Root context for a service, with a fresh trace ID.
    pub fn new(service: &str) -> Self {
        Self {
            values: Arc::new(vec![
                (ContextKey::Service, service.to_string()),
                (ContextKey::TraceId, Uuid::new_v4().to_string()),
            ]),
        }
    }

    /// A context with no attributes at all.
    pub fn background() -> Self {
        Self {
            values: Arc::new(Vec::new()),
        }
    }

    /// Return a child context with one more attribute attached.
    ///
    /// Later attachments shadow earlier ones for the same key.
    pub fn with(&self, key: ContextKey, value: impl Into<String>) -> Self {
        let mut values = (*self.values).clone();
        values.push((key, value.into()));
        Self {
            values: Arc::new(values),
        }
    }

    /// Child context with a fresh trace ID, shadowing any inherited one.
    pub fn with_new_trace(&self) -> Self {
        self.with(ContextKey::TraceId, Uuid::new_v4().to_string())
    }

    /// Look up an attribute; the most recent attachment wins.
    pub fn get(&self, key: ContextKey) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The trace ID, if attached.
    pub fn trace_id(&self) -> Option<&str> {
        self.get(ContextKey::TraceId)
    }

    /// The session ID, if attached.
    pub fn session_id(&self) -> Option<&str> {
        self.get(ContextKey::SessionId)
    }
}

impl fmt::Display for Context {
    /// Render as `key=value` pairs for log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut seen = Vec::new();
        for (key, value) in self.values.iter().rev() {
            if seen.contains(key) {
                continue;
            }
            seen.push(*key);
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}={}", key.label(), value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({})", self)
    }
}
