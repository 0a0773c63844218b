//! End-to-end tests for the job engine with fleet-unique locking and the
//! maintenance HTTP surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use botwall::context::Context;
use botwall::db::MemoryBackend;
use botwall::jobs::{
    maintenance_router, JobEngine, JobParams, LockedJob, OneOffJob, PeriodicJob,
};
use tower::ServiceExt;

struct CountingJob {
    runs: AtomicUsize,
}

#[async_trait]
impl OneOffJob for CountingJob {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn run_once(&self, _ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for CountingJob {
    fn interval(&self) -> Duration {
        Duration::from_secs(300)
    }
}

#[tokio::test]
async fn test_locked_job_across_two_engines() {
    let backend = Arc::new(MemoryBackend::new());
    let inner = Arc::new(CountingJob {
        runs: AtomicUsize::new(0),
    });

    // Two "instances" sharing one store, as in a scaled fleet.
    let engine_a = JobEngine::new(Context::new("node-a"));
    let engine_b = JobEngine::new(Context::new("node-b"));
    let trigger_a = engine_a.spawn_periodic(LockedJob::new(
        inner.clone(),
        backend.clone(),
        Duration::from_secs(300),
    ));
    let trigger_b = engine_b.spawn_periodic(LockedJob::new(
        inner.clone(),
        backend.clone(),
        Duration::from_secs(300),
    ));

    trigger_a.fire().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    trigger_b.fire().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The lease is the real clock: only the first tick ran the inner job.
    assert_eq!(inner.runs.load(Ordering::SeqCst), 1);

    engine_a.shutdown().await;
    engine_b.shutdown().await;
}

#[tokio::test]
async fn test_http_trigger_runs_job_once() {
    let engine = JobEngine::new(Context::new("test"));
    let job = Arc::new(CountingJob {
        runs: AtomicUsize::new(0),
    });
    engine.spawn_periodic(job.clone());
    let router = maintenance_router(engine.clone());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/maintenance/periodic/counting")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats("counting").unwrap().runs, 1);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/maintenance/periodic/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    engine.shutdown().await;
}
