pub mod boundary;
pub mod config;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod pool;
pub mod upload;
pub mod worker;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use boundary::{InferencePayload, InferenceRequest, InferenceResponse, REJECTED_SENTINEL};
pub use error::{Result, ServerError};
pub use orchestrator::{InferenceOutcome, Orchestrator};
pub use pool::{PoolConfig, WorkerLease, WorkerPool};
pub use upload::{CloudinaryUploader, ImageUploader};
pub use worker::{FluxWorkerFactory, WorkerFactory, WorkerInstance};

/// Shared by every request handler.
pub struct AppState {
    pool: Arc<WorkerPool>,
    orchestrator: Orchestrator,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(pool: Arc<WorkerPool>, orchestrator: Orchestrator, request_timeout: Duration) -> Self {
        Self {
            pool,
            orchestrator,
            request_timeout,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(inference))
        .route("/inference", post(inference))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn inference(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<InferencePayload>, JsonRejection>,
) -> Result<Json<InferenceResponse>> {
    let Json(payload) = payload.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    let request = payload.into_request()?;

    tracing::info!(
        prompt = %request.prompt,
        compile = request.compile,
        height = request.height,
        width = request.width,
        override_safety = request.override_safety,
        "inference request"
    );

    let started = Instant::now();
    let outcome = tokio::time::timeout(state.request_timeout, async {
        let worker = state.pool.acquire(request.compile).await?;
        state.orchestrator.infer(&worker, &request).await
    })
    .await
    .map_err(|_| ServerError::Timeout(state.request_timeout))??;

    tracing::info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        rejected = outcome == InferenceOutcome::Rejected,
        "inference request completed"
    );

    Ok(Json(outcome.into()))
}
