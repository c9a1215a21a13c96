//! OpenAPI documentation generation using utoipa

use axum::{Json, response::IntoResponse};
use utoipa::OpenApi;

use crate::cache::CacheStats;
use crate::job_scheduling::{JobStatus, TileJobRequest};
use crate::progress::ProgressEvent;
use crate::services::{SubmitOutcome, TileAvailability};
use crate::tiles::{GeoPoint, ProjectedBounds, Tile};
use crate::web::handlers;
use crate::web::responses::HealthResponse;

/// OpenAPI specification of the point-cloud proxy
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Point-cloud Proxy API",
        version = "0.1.0",
        description = "On-demand preparation of point-cloud tiles.

Submit a job for a coordinate, follow its progress over SSE or by polling,
then load the converted octree from the returned `result_url`."
    ),
    paths(
        handlers::jobs::submit_job,
        handlers::jobs::get_job_status,
        handlers::events::session_events,
        handlers::tiles::tile_availability,
        handlers::tiles::tiles_in_bbox,
        handlers::tiles::serve_tile_root,
        handlers::tiles::serve_tile_file,
        handlers::health::health_check,
        handlers::health::cache_stats,
    ),
    components(schemas(
        TileJobRequest,
        SubmitOutcome,
        JobStatus,
        ProgressEvent,
        TileAvailability,
        Tile,
        ProjectedBounds,
        GeoPoint,
        CacheStats,
        HealthResponse,
    )),
    tags(
        (name = "jobs", description = "Tile job submission and status"),
        (name = "progress", description = "Live job progress per session"),
        (name = "tiles", description = "Tile lookup and converted artifacts"),
        (name = "cache", description = "Cache usage"),
        (name = "health", description = "Service health"),
    )
)]
pub struct ApiDoc;

/// Serve the generated specification
pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
