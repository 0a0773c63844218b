//! Buffered audit log writer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::batch::{ArrayBatcher, BatchError, BatchProcessor, BatcherConfig};
use crate::context::Context;
use crate::db::StoreBackend;

use super::event::AuditEvent;

/// Configuration for the audit sink.
#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    /// Batching behaviour of the underlying pipeline.
    pub batcher: BatcherConfig,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
        }
    }
}

struct InsertProcessor {
    backend: Arc<dyn StoreBackend>,
}

#[async_trait]
impl BatchProcessor<AuditEvent> for InsertProcessor {
    async fn process(&self, batch: &[AuditEvent]) -> anyhow::Result<()> {
        let entries: Vec<_> = batch.iter().map(AuditEvent::to_entry).collect();
        self.backend.insert_audit_entries(&entries).await?;
        log::debug!("audit: flushed {} events", entries.len());
        Ok(())
    }
}

/// Write-only audit facade feeding an array batcher.
pub struct AuditLog {
    batcher: ArrayBatcher<AuditEvent>,
}

impl AuditLog {
    /// Start the sink against a store backend.
    pub fn start(backend: Arc<dyn StoreBackend>, config: AuditLogConfig) -> Arc<Self> {
        let processor = Arc::new(InsertProcessor { backend });
        Arc::new(Self {
            batcher: ArrayBatcher::spawn("audit", config.batcher, processor),
        })
    }

    /// Record an event, enriching it with the ambient session ID and a
    /// fresh timestamp. Blocks when the queue is at capacity.
    pub async fn record(&self, ctx: &Context, mut event: AuditEvent) -> Result<(), BatchError> {
        event.created_at = Utc::now();
        if event.session_id.is_none() {
            event.session_id = ctx.session_id().map(|s| s.to_string());
        }
        self.batcher.push(event).await
    }

    /// Record a batch of already-built events, e.g. collected under a
    /// transaction and forwarded after commit.
    pub async fn record_all(
        &self,
        ctx: &Context,
        events: Vec<AuditEvent>,
    ) -> Result<(), BatchError> {
        for event in events {
            self.record(ctx, event).await?;
        }
        Ok(())
    }

    /// Stop accepting events and drain in-flight batches.
    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{AuditAction, AuditSource, TargetKind, TargetRef};
    use crate::context::{Context, ContextKey};
    use crate::db::MemoryBackend;
    use std::time::Duration;

    fn event() -> AuditEvent {
        AuditEvent::new(
            1,
            AuditAction::Create,
            AuditSource::Portal,
            TargetRef::new(TargetKind::Org, 2),
        )
    }

    #[tokio::test]
    async fn test_record_and_flush() {
        let backend = Arc::new(MemoryBackend::new());
        let log = AuditLog::start(backend.clone(), AuditLogConfig::default());
        let ctx = Context::new("test").with(ContextKey::SessionId, "sess-1");

        log.record(&ctx, event()).await.unwrap();
        log.shutdown().await;

        assert_eq!(backend.audit_len(), 1);
        let entries = backend.audit_entries_for("org", 2, 10).await.unwrap();
        assert_eq!(entries[0].session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_record_all_after_commit() {
        let backend = Arc::new(MemoryBackend::new());
        let log = AuditLog::start(
            backend.clone(),
            AuditLogConfig {
                batcher: BatcherConfig {
                    flush_delay: Duration::from_millis(10),
                    ..BatcherConfig::default()
                },
            },
        );
        let ctx = Context::new("test");

        log.record_all(&ctx, vec![event(), event()]).await.unwrap();
        log.shutdown().await;
        assert_eq!(backend.audit_len(), 2);
    }
}
