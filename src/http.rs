//! Operational HTTP surface: start/stop the batch processor and inspect its
//! state, modelled on the teacher's REST API server (§6).

use crate::batch::BatchProcessor;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
struct AppState {
    processor: Arc<BatchProcessor>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(body)).into_response()
}

/// Builds the router; call `axum::serve` on the result.
pub fn router(processor: Arc<BatchProcessor>) -> Router {
    let state = AppState { processor };
    Router::new()
        .route("/health", get(health))
        .route("/batch/start", post(start_batch))
        .route("/batch/stop", post(stop_batch))
        .route("/batch/status", get(batch_status))
        .route("/batch/memory-status", get(memory_status))
        .route("/batch/cache-cleanup", post(cache_cleanup))
        .with_state(state)
}

pub async fn serve(bind_address: &str, processor: Arc<BatchProcessor>) -> crate::error::Result<()> {
    let app = router(processor);
    info!("operational HTTP surface listening on http://{bind_address}");
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::IngestError::Internal(e.to_string()))?;
    Ok(())
}

async fn health() -> Response {
    json_response(StatusCode::OK, serde_json::json!({"status": "ok"}))
}

/// Kicks off exactly one batch and returns immediately; the batch itself
/// runs in the background so this handler never blocks on a full pre-fetch
/// window.
async fn start_batch(State(state): State<AppState>) -> Response {
    if state.processor.is_running() {
        return json_response(
            StatusCode::BAD_REQUEST,
            ApiResponse::<()>::error("a batch is already running"),
        );
    }
    let processor = state.processor.clone();
    tokio::spawn(async move {
        if let Err(e) = processor.process_batch().await {
            tracing::error!("batch triggered via HTTP failed: {e}");
        }
    });
    json_response(
        StatusCode::OK,
        ApiResponse::ok(serde_json::json!({"started": true})),
    )
}

async fn stop_batch(State(state): State<AppState>) -> Response {
    if !state.processor.is_running() {
        return json_response(
            StatusCode::BAD_REQUEST,
            ApiResponse::<()>::error("no batch is running"),
        );
    }
    state.processor.request_stop();
    json_response(
        StatusCode::OK,
        ApiResponse::ok(serde_json::json!({"stop_requested": true})),
    )
}

async fn batch_status(State(state): State<AppState>) -> Response {
    let snapshot = state.processor.metrics().snapshot().await;
    json_response(
        StatusCode::OK,
        ApiResponse::ok(serde_json::json!({
            "running": state.processor.is_running(),
            "stop_requested": state.processor.is_stop_requested(),
            "metrics": snapshot,
            "cache": state.processor.cache().stats_snapshot(),
        })),
    )
}

async fn memory_status(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        ApiResponse::ok(state.processor.cache().stats_snapshot()),
    )
}

async fn cache_cleanup(State(state): State<AppState>) -> Response {
    state.processor.cache().decay_and_evict();
    json_response(
        StatusCode::OK,
        ApiResponse::ok(state.processor.cache().stats_snapshot()),
    )
}
