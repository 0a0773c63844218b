//! # Background Job Engine
//!
//! One-off and periodic background work:
//! - [`OneOffJob`]: runs once after an initial pause
//! - [`PeriodicJob`]: runs on an interval with jitter, an optional per-run
//!   timeout, and a trigger handle for out-of-band invocation
//! - [`locked::LockedJob`]: wraps a periodic job in a named database lease so
//!   it runs on only one instance of a horizontally scaled fleet
//!
//! Every invocation runs under panic recovery with the job name attached to
//! the ambient context, so one bad run never kills its scheduler loop.
//! [`http::maintenance_router`] exposes on-demand triggering for operators.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Context;

pub mod engine;
pub mod http;
pub mod locked;
pub mod maintenance;

pub use engine::{JobEngine, JobStats, Trigger};
pub use http::maintenance_router;
pub use locked::LockedJob;
pub use maintenance::{
    GcJob, NotificationSender, NotifyJob, TaskHandler, TaskJob, TrialExpiryJob, WarmupJob,
};

/// Job errors
#[derive(Debug, Error)]
pub enum JobError {
    /// No job with that name is registered.
    #[error("job '{0}' is not registered")]
    Unknown(String),

    /// The job's run panicked; the scheduler keeps going.
    #[error("job '{0}' panicked")]
    Panicked(String),

    /// The run exceeded the job's timeout.
    #[error("job '{0}' exceeded its deadline")]
    DeadlineExceeded(String),
}

/// Opaque per-run parameters, built fresh for every invocation.
pub type JobParams = Box<dyn Any + Send>;

/// A job that runs once.
#[async_trait]
pub trait OneOffJob: Send + Sync {
    /// Unique job name; doubles as the trace attribute and lock name.
    fn name(&self) -> &'static str;

    /// Delay before the first (and for one-off jobs, only) run.
    fn initial_pause(&self) -> Duration {
        Duration::ZERO
    }

    /// Build the parameters for one run.
    fn new_params(&self) -> JobParams {
        Box::new(())
    }

    /// Execute one run.
    async fn run_once(&self, ctx: &Context, params: JobParams) -> anyhow::Result<()>;
}

/// A job that runs on an interval.
#[async_trait]
pub trait PeriodicJob: OneOffJob {
    /// Base interval between runs.
    fn interval(&self) -> Duration;

    /// Upper bound of the random delay added to each interval.
    fn jitter(&self) -> Duration {
        Duration::ZERO
    }

    /// Per-run timeout; zero inherits the parent context's deadline only.
    fn timeout(&self) -> Duration {
        Duration::ZERO
    }
}
