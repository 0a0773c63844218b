//! Fleet-unique periodic jobs via named database leases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::context::Context;
use crate::db::{StoreBackend, StoreError};

use super::{JobParams, OneOffJob, PeriodicJob};

/// Wraps a periodic job so that across a fleet at most one instance's inner
/// run executes at any instant.
///
/// Each tick acquires `lock/<name>` with `expires_at = now + lock_duration`
/// inside a transaction. A successful inner run lets the lease expire on its
/// own, which makes the lease, not the interval, the effective clock: with
/// `lock_duration` longer than the interval, ticks that land while the lease
/// is live simply skip. A failed inner run releases the lease eagerly so
/// another instance can retry sooner.
pub struct LockedJob {
    inner: Arc<dyn PeriodicJob>,
    backend: Arc<dyn StoreBackend>,
    lock_duration: Duration,
}

impl LockedJob {
    /// Wrap a periodic job.
    pub fn new(
        inner: Arc<dyn PeriodicJob>,
        backend: Arc<dyn StoreBackend>,
        lock_duration: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            backend,
            lock_duration,
        })
    }

    fn lock_name(&self) -> String {
        format!("job/{}", self.inner.name())
    }
}

#[async_trait]
impl OneOffJob for LockedJob {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn initial_pause(&self) -> Duration {
        self.inner.initial_pause()
    }

    fn new_params(&self) -> JobParams {
        self.inner.new_params()
    }

    async fn run_once(&self, ctx: &Context, params: JobParams) -> anyhow::Result<()> {
        let lock_name = self.lock_name();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.lock_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let tx = self.backend.begin().await?;
        match tx.acquire_lock(&lock_name, expires_at).await {
            Ok(()) => {
                tx.commit().await?;
            }
            Err(StoreError::Locked(_)) => {
                let _ = tx.rollback().await;
                log::warn!("{}: lock '{}' already held, skipping", ctx, lock_name);
                return Ok(());
            }
            Err(e) => {
                let _ = tx.rollback().await;
                log::error!("{}: failed to acquire lock '{}': {}", ctx, lock_name, e);
                return Err(e.into());
            }
        }

        match self.inner.run_once(ctx, params).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(release_error) = self.backend.release_lock(&lock_name).await {
                    log::warn!(
                        "{}: failed to release lock '{}': {}",
                        ctx,
                        lock_name,
                        release_error
                    );
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PeriodicJob for LockedJob {
    fn interval(&self) -> Duration {
        self.inner.interval()
    }

    fn jitter(&self) -> Duration {
        self.inner.jitter()
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBackend;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl OneOffJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self, _ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock() {
                anyhow::bail!("induced failure");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    fn setup(fail: bool) -> (Arc<LockedJob>, Arc<CountingJob>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let inner = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: Mutex::new(fail),
        });
        let locked = LockedJob::new(inner.clone(), backend.clone(), Duration::from_secs(120));
        (locked, inner, backend)
    }

    #[tokio::test]
    async fn test_only_one_instance_runs() {
        let (locked, inner, backend) = setup(false);
        let ctx = Context::new("test");

        // First tick acquires and runs; a second "instance" sharing the
        // store skips while the lease is live.
        locked.run_once(&ctx, Box::new(())).await.unwrap();
        let second = LockedJob::new(inner.clone(), backend.clone(), Duration::from_secs(120));
        second.run_once(&ctx, Box::new(())).await.unwrap();

        assert_eq!(inner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_run_releases_lock_eagerly() {
        let (locked, inner, _backend) = setup(true);
        let ctx = Context::new("test");

        assert!(locked.run_once(&ctx, Box::new(())).await.is_err());
        // The eager release lets the next tick run before the lease lapses.
        *inner.fail.lock() = false;
        locked.run_once(&ctx, Box::new(())).await.unwrap();
        assert_eq!(inner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reacquired() {
        let (locked, inner, backend) = setup(false);
        let ctx = Context::new("test");

        // Simulate a lapsed lease left by a dead instance.
        backend
            .acquire_lock("job/counting", Utc::now() - chrono::Duration::seconds(5))
            .await
            .unwrap();
        locked.run_once(&ctx, Box::new(())).await.unwrap();
        assert_eq!(inner.runs.load(Ordering::SeqCst), 1);
    }
}
