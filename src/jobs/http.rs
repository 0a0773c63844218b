//! HTTP surface for running maintenance jobs on demand.
//!
//! `POST /maintenance/periodic/{job}` and `POST /maintenance/oneoff/{job}`
//! run a registered job once; unknown names get a 404. The host application
//! mounts this router behind its own operator authentication.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;

use super::JobEngine;

/// Build the maintenance-trigger router.
pub fn maintenance_router(engine: Arc<JobEngine>) -> Router {
    Router::new()
        .route("/maintenance/periodic/:job", post(trigger_periodic))
        .route("/maintenance/oneoff/:job", post(run_one_off))
        .with_state(engine)
}

async fn trigger_periodic(
    State(engine): State<Arc<JobEngine>>,
    Path(job): Path<String>,
) -> (StatusCode, &'static str) {
    match engine.trigger_periodic(&job) {
        Ok(()) => (StatusCode::OK, "started"),
        Err(e) => {
            log::warn!("maintenance trigger for periodic '{}' failed: {}", job, e);
            (StatusCode::NOT_FOUND, "not found")
        }
    }
}

async fn run_one_off(
    State(engine): State<Arc<JobEngine>>,
    Path(job): Path<String>,
) -> (StatusCode, &'static str) {
    match engine.run_one_off(&job) {
        Ok(()) => (StatusCode::OK, "started"),
        Err(e) => {
            log::warn!("maintenance trigger for one-off '{}' failed: {}", job, e);
            (StatusCode::NOT_FOUND, "not found")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::jobs::{JobParams, OneOffJob, PeriodicJob};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoopJob {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl OneOffJob for NoopJob {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn run_once(&self, _ctx: &Context, _params: JobParams) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl PeriodicJob for NoopJob {
        fn interval(&self) -> Duration {
            Duration::from_secs(600)
        }
    }

    fn post_to(path: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_known_periodic_job() {
        let engine = JobEngine::new(Context::new("test"));
        let job = Arc::new(NoopJob {
            runs: AtomicUsize::new(0),
        });
        engine.spawn_periodic(job.clone());
        let router = maintenance_router(engine.clone());

        let response = router
            .oneshot(post_to("/maintenance/periodic/noop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let engine = JobEngine::new(Context::new("test"));
        let router = maintenance_router(engine);

        for path in [
            "/maintenance/periodic/ghost",
            "/maintenance/oneoff/ghost",
        ] {
            let response = router.clone().oneshot(post_to(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }
}
