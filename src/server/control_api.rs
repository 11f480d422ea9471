//! Control API.
//!
//! - GET /__offline/health
//! - GET /__offline/stats
//! - GET /__offline/metrics
//! - POST /__offline/message
//!
//! Everything else falls through to the proxy handler.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use url::Url;

use crate::cache::manager::CacheStoreManager;
use crate::metrics::Metrics;
use crate::net::fetcher::Fetcher;
use crate::router::Router;
use crate::server::proxy;
use crate::worker::{ControlMessage, Worker, WorkerState};

/// Application state shared across handlers.
pub struct AppState {
    pub worker: Arc<Worker>,
    pub router: Router,
    pub cache: Arc<CacheStoreManager>,
    pub fetcher: Arc<dyn Fetcher>,
    pub metrics: Metrics,
    pub origin: Url,
    pub start_time: Instant,
}

/// Build the axum router: control routes plus the proxy fallback.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/__offline/health", get(health))
        .route("/__offline/stats", get(stats))
        .route("/__offline/metrics", get(metrics))
        .route("/__offline/message", post(message))
        .fallback(proxy::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Response Types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub worker_state: String,
}

#[derive(Debug, Serialize)]
pub struct PartitionStats {
    pub name: String,
    pub entries: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub worker_state: String,
    pub skip_waiting: bool,
    pub static_partition: String,
    pub runtime_partition: String,
    pub max_runtime_entries: usize,
    pub partitions: Vec<PartitionStats>,
    pub pending_background_tasks: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub accepted: bool,
    pub worker_state: String,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        worker_state: state.worker.state().await.to_string(),
    })
}

async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let partitions = state
        .cache
        .partition_sizes()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .into_iter()
        .map(|(name, entries)| PartitionStats { name, entries })
        .collect();

    Ok(Json(StatsResponse {
        worker_state: state.worker.state().await.to_string(),
        skip_waiting: state.worker.skip_waiting_requested(),
        static_partition: state.cache.static_name().to_string(),
        runtime_partition: state.cache.runtime_name().to_string(),
        max_runtime_entries: state.cache.max_runtime_entries(),
        partitions,
        pending_background_tasks: state.router.background().pending(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn message(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    let accepted = state.worker.handle_message(&body);

    // An installed worker told to skip waiting activates right away.
    if accepted == Some(ControlMessage::SkipWaiting)
        && state.worker.state().await == WorkerState::Installed
    {
        match state.worker.activate().await {
            Ok(purged) => info!(purged = purged.len(), "Activated on skip-waiting"),
            Err(e) => error!(error = %e, "Activation after skip-waiting failed"),
        }
    }

    let status = if accepted.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::BAD_REQUEST
    };
    (
        status,
        Json(MessageResponse {
            accepted: accepted.is_some(),
            worker_state: state.worker.state().await.to_string(),
        }),
    )
}
