//! Health and cache statistics handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::cache::CacheStats;
use crate::web::{
    AppState,
    responses::{ApiResponse, HealthResponse, handle_result, ok},
};

/// Health check endpoint
///
/// Healthy when the shared state store answers.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "State store unreachable", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let uptime_seconds = (chrono::Utc::now() - state.start_time).num_seconds();
    let progress_sessions = state.orchestrator.progress().session_count().await;

    match state.orchestrator.queue().stats().await {
        Ok(stats) => ok(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            pending_jobs: stats.pending,
            running_jobs: stats.running,
            progress_sessions,
            error: None,
        })
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::success(HealthResponse {
                status: "unhealthy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds,
                pending_jobs: 0,
                running_jobs: 0,
                progress_sessions,
                error: Some(e.to_string()),
            })),
        )
            .into_response(),
    }
}

/// Cache usage across both tiers
#[utoipa::path(
    get,
    path = "/api/v1/cache/stats",
    responses((status = 200, description = "Cache usage", body = CacheStats)),
    tag = "cache"
)]
pub async fn cache_stats(State(state): State<AppState>) -> Response {
    handle_result(
        state
            .orchestrator
            .cache()
            .stats()
            .await
            .map_err(Into::into),
    )
}
