//! HTTP endpoints for starting, stopping, and inspecting the batch job.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::scheduler::BatchScheduler;

/// Snapshot returned by the status endpoint.
#[derive(Debug, Serialize)]
pub struct JobStatus {
    pub running: bool,
    pub poll_interval_ms: u64,
    pub chunk_size: u32,
    pub max_retry: u32,
}

/// POST /api/batch-job/start
async fn start_job(State(scheduler): State<Arc<BatchScheduler>>) -> &'static str {
    if scheduler.start().await {
        "Batch job started."
    } else {
        "Batch job is already running."
    }
}

/// POST /api/batch-job/stop
async fn stop_job(State(scheduler): State<Arc<BatchScheduler>>) -> &'static str {
    if scheduler.stop().await {
        "Batch job stopped."
    } else {
        "Batch job is not running."
    }
}

/// GET /api/batch-job/status
async fn job_status(State(scheduler): State<Arc<BatchScheduler>>) -> Json<JobStatus> {
    let config = scheduler.config();
    Json(JobStatus {
        running: scheduler.is_running().await,
        poll_interval_ms: config.poll_interval_ms,
        chunk_size: config.chunk_size,
        max_retry: config.max_retry,
    })
}

/// Build the batch-job admin routes.
pub fn admin_routes(scheduler: Arc<BatchScheduler>) -> Router {
    Router::new()
        .route("/api/batch-job/start", post(start_job))
        .route("/api/batch-job/stop", post(stop_job))
        .route("/api/batch-job/status", get(job_status))
        .with_state(scheduler)
}
