//! Job submission and status handlers

use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use tracing::debug;
use uuid::Uuid;

use crate::job_scheduling::TileJobRequest;
use crate::progress::ProgressEvent;
use crate::services::SubmitOutcome;
use crate::web::{
    AppState,
    responses::{accepted, handle_error, handle_result},
};

/// Submit a tile preparation job
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    request_body = TileJobRequest,
    responses(
        (status = 202, description = "Job accepted, deduplicated or already ready", body = SubmitOutcome),
        (status = 400, description = "Invalid coordinates, identifiers or crop bounds"),
        (status = 503, description = "Job state store unavailable")
    ),
    tag = "jobs"
)]
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<TileJobRequest>,
) -> Response {
    debug!(
        "Job submission for parcel {} at ({}, {})",
        request.parcel_id, request.lat, request.lon
    );
    match state.orchestrator.submit(request).await {
        Ok(outcome) => accepted(outcome).into_response(),
        Err(e) => handle_error(e),
    }
}

/// Latest status of a job
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{job_id}",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Current job state", body = ProgressEvent),
        (status = 404, description = "Unknown or expired job")
    ),
    tag = "jobs"
)]
pub async fn get_job_status(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Response {
    handle_result(state.orchestrator.status(job_id).await)
}
