//! Job scheduling and invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::context::{Context, ContextKey};

use super::{JobError, OneOffJob, PeriodicJob};

/// Capacity of a job's trigger channel; sends beyond it coalesce.
const TRIGGER_CAPACITY: usize = 8;

/// Handle for firing a periodic job out of band.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    /// Queue one extra run, waiting for trigger-channel room.
    pub async fn fire(&self) -> bool {
        self.tx.send(()).await.is_ok()
    }

    /// Queue one extra run without waiting; a full channel coalesces.
    pub fn try_fire(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Counters for one job, exposed for operators and tests.
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    /// Completed invocations, successful or not.
    pub runs: u64,
    /// Invocations that returned an error, panicked, or timed out.
    pub failures: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

#[derive(Default)]
struct StatsCell {
    runs: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl StatsCell {
    fn snapshot(&self) -> JobStats {
        JobStats {
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn record_failure(&self, message: String) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message);
    }
}

/// Owns one scheduler task per registered job.
pub struct JobEngine {
    ctx: Context,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    triggers: Mutex<HashMap<&'static str, Trigger>>,
    one_offs: Mutex<HashMap<&'static str, Arc<dyn OneOffJob>>>,
    stats: Mutex<HashMap<&'static str, Arc<StatsCell>>>,
}

impl JobEngine {
    /// Create an engine rooted in the given ambient context.
    pub fn new(ctx: Context) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            shutdown,
            handles: Mutex::new(Vec::new()),
            triggers: Mutex::new(HashMap::new()),
            one_offs: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        })
    }

    fn stats_cell(&self, name: &'static str) -> Arc<StatsCell> {
        self.stats.lock().entry(name).or_default().clone()
    }

    /// Register a one-off job and schedule its single run.
    pub fn spawn_one_off(&self, job: Arc<dyn OneOffJob>) {
        let name = job.name();
        self.one_offs.lock().insert(name, job.clone());
        let stats = self.stats_cell(name);
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(job.initial_pause()) => {}
            }
            invoke(&ctx, &job, Duration::ZERO, &stats).await;
        });
        self.handles.lock().push(handle);
    }

    /// Register a periodic job, start its scheduler loop, and return the
    /// trigger handle for manual firing.
    pub fn spawn_periodic(&self, job: Arc<dyn PeriodicJob>) -> Trigger {
        let name = job.name();
        let (tx, mut trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let trigger = Trigger { tx };
        self.triggers.lock().insert(name, trigger.clone());
        let stats = self.stats_cell(name);
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(job.initial_pause()) => {}
            }
            loop {
                let wait = job.interval() + random_jitter(job.jitter());
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                    Some(()) = trigger_rx.recv() => {}
                }
                invoke(&ctx, &job, job.timeout(), &stats).await;
            }
            log::debug!("job '{}': scheduler stopped", job.name());
        });
        self.handles.lock().push(handle);
        trigger
    }

    /// Fire a registered periodic job now. Used by the HTTP surface.
    pub fn trigger_periodic(&self, name: &str) -> Result<(), JobError> {
        let trigger = self
            .triggers
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Unknown(name.to_string()))?;
        if trigger.try_fire() {
            Ok(())
        } else {
            Err(JobError::Unknown(name.to_string()))
        }
    }

    /// Run a registered one-off job again, immediately.
    pub fn run_one_off(&self, name: &str) -> Result<(), JobError> {
        let job = self
            .one_offs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Unknown(name.to_string()))?;
        let stats = self.stats_cell(job.name());
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            invoke(&ctx, &job, Duration::ZERO, &stats).await;
        });
        self.handles.lock().push(handle);
        Ok(())
    }

    /// Counters for a job, if it ever registered.
    pub fn stats(&self, name: &str) -> Option<JobStats> {
        self.stats.lock().get(name).map(|cell| cell.snapshot())
    }

    /// Stop all scheduler loops and wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::error!("job scheduler task ended abnormally: {}", e);
                }
            }
        }
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        Duration::ZERO
    } else {
        rand::thread_rng().gen_range(Duration::ZERO..max)
    }
}

/// Run one invocation under panic recovery and the job's timeout.
async fn invoke<J>(ctx: &Context, job: &Arc<J>, timeout: Duration, stats: &StatsCell)
where
    J: OneOffJob + ?Sized + 'static,
{
    let run_ctx = ctx
        .with(ContextKey::JobName, job.name())
        .with_new_trace();
    let params = job.new_params();
    let task_job = job.clone();
    let task_ctx = run_ctx.clone();
    let mut task = tokio::spawn(async move { task_job.run_once(&task_ctx, params).await });

    let result = if timeout.is_zero() {
        (&mut task).await
    } else {
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(result) => result,
            Err(_) => {
                task.abort();
                let error = JobError::DeadlineExceeded(job.name().to_string());
                log::error!("{}: {}", run_ctx, error);
                stats.runs.fetch_add(1, Ordering::Relaxed);
                stats.record_failure(error.to_string());
                return;
            }
        }
    };

    stats.runs.fetch_add(1, Ordering::Relaxed);
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("{}: run failed: {:#}", run_ctx, e);
            stats.record_failure(format!("{:#}", e));
        }
        Err(join_error) => {
            if join_error.is_panic() {
                let error = JobError::Panicked(job.name().to_string());
                log::error!("{}: {}", run_ctx, error);
                stats.record_failure(error.to_string());
            } else {
                stats.record_failure("run task cancelled".to_string());
            }
        }
    }
}
