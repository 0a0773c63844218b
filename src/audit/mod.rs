//! # Audit Log Sink
//!
//! Write-only facade for recording who did what to which entity. Events are
//! enriched with a timestamp and the ambient session ID, buffered through an
//! array batcher, and bulk-inserted into the store.

pub mod event;
pub mod sink;

pub use event::{AuditAction, AuditEvent, AuditSource, TargetKind, TargetRef};
pub use sink::{AuditLog, AuditLogConfig};
