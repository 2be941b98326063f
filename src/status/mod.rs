use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::jobs::JobRunner;

/// Tracks the runner of the most recent RUN so it can be inspected while it
/// executes. Readers only ever see a whole runner or none.
#[derive(Debug, Default)]
pub struct RunMonitor {
    current: ArcSwapOption<JobRunner>,
    runs_started: AtomicU64,
}

impl RunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, runner: JobRunner) {
        self.runs_started.fetch_add(1, Ordering::SeqCst);
        self.current.store(Some(Arc::new(runner)));
    }

    pub fn current(&self) -> Option<Arc<JobRunner>> {
        self.current.load_full()
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct StatusState {
    pub monitor: Arc<RunMonitor>,
}

#[derive(Serialize)]
struct StatusResponse {
    runs_started: u64,
    running: bool,
    progress: f64,
    running_jobs: usize,
}

#[derive(Serialize)]
struct RunningJobResponse {
    id: String,
    name: String,
    manager: String,
    started_at: String,
}

/// Routes of the status endpoint.
pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(running_jobs_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_status_server(addr: SocketAddr, state: StatusState) {
    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let runner = state.monitor.current();
    Json(StatusResponse {
        runs_started: state.monitor.runs_started(),
        running: runner.as_ref().is_some_and(|r| r.is_running()),
        progress: runner.as_ref().map(|r| r.progress()).unwrap_or(0.0),
        running_jobs: runner.as_ref().map(|r| r.num_running()).unwrap_or(0),
    })
}

async fn running_jobs_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let jobs: Vec<RunningJobResponse> = state
        .monitor
        .current()
        .map(|runner| {
            runner
                .running_jobs()
                .iter()
                .map(|job| RunningJobResponse {
                    id: job.id.to_string(),
                    name: job.name.clone(),
                    manager: job.manager.clone(),
                    started_at: job.started_at.to_rfc3339(),
                })
                .collect()
        })
        .unwrap_or_default();

    Json(jobs)
}
