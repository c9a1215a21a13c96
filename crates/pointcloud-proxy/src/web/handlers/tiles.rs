//! Tile lookup and converted artifact serving

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};
use utoipa::IntoParams;

use crate::errors::AppError;
use crate::services::TileAvailability;
use crate::tiles::{Tile, TileId};
use crate::web::{
    AppState,
    responses::{handle_error, handle_result, ok},
};

/// Largest number of tiles a bounding-box query may return.
pub const MAX_BBOX_TILES: u64 = 400;
/// Factor by which the corner estimate may exceed the limit before the
/// boundary is sampled for an exact answer.
const ESTIMATE_SLACK: u64 = 4;

#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct PointQuery {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct BboxQuery {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

/// Cache state of the tile containing a point
#[utoipa::path(
    get,
    path = "/api/v1/tiles/availability",
    params(PointQuery),
    responses(
        (status = 200, description = "Tile identity and cache tiers", body = TileAvailability),
        (status = 400, description = "Non-finite coordinates")
    ),
    tag = "tiles"
)]
pub async fn tile_availability(
    State(state): State<AppState>,
    Query(query): Query<PointQuery>,
) -> Response {
    handle_result(state.orchestrator.availability(query.lat, query.lon).await)
}

/// Every tile intersecting a geographic box
#[utoipa::path(
    get,
    path = "/api/v1/tiles/bbox",
    params(BboxQuery),
    responses(
        (status = 200, description = "Tiles row by row, south to north", body = Vec<Tile>),
        (status = 400, description = "Invalid box or too many tiles")
    ),
    tag = "tiles"
)]
pub async fn tiles_in_bbox(State(state): State<AppState>, Query(query): Query<BboxQuery>) -> Response {
    let corners = [query.min_lat, query.min_lon, query.max_lat, query.max_lon];
    if corners.iter().any(|c| !c.is_finite()) {
        return handle_error(AppError::validation("bounding box must be finite numbers"));
    }

    let grid = state.orchestrator.grid();
    let estimate =
        grid.estimate_tiles_for_bbox(query.min_lat, query.min_lon, query.max_lat, query.max_lon);
    if estimate > MAX_BBOX_TILES * ESTIMATE_SLACK {
        return too_many_tiles(estimate);
    }

    let tiles = grid.tiles_for_bbox(query.min_lat, query.min_lon, query.max_lat, query.max_lon);
    if tiles.len() as u64 > MAX_BBOX_TILES {
        return too_many_tiles(tiles.len() as u64);
    }
    ok(tiles).into_response()
}

fn too_many_tiles(count: u64) -> Response {
    handle_error(AppError::validation(format!(
        "bounding box covers {count} tiles, at most {MAX_BBOX_TILES} allowed"
    )))
}

/// Descriptor of a converted tile
#[utoipa::path(
    get,
    path = "/tiles/{tile_id}/",
    params(("tile_id" = String, Path, description = "Tile identifier, e.g. 2600_1199")),
    responses(
        (status = 200, description = "Descriptor file"),
        (status = 404, description = "Unknown tile or tile not converted")
    ),
    tag = "tiles"
)]
pub async fn serve_tile_root(
    State(state): State<AppState>,
    Path(tile_id): Path<String>,
    request: Request,
) -> Response {
    let descriptor = state.orchestrator.cache().descriptor_file().to_string();
    serve_artifact(&state, &tile_id, &descriptor, request).await
}

/// A file inside a converted tile
#[utoipa::path(
    get,
    path = "/tiles/{tile_id}/{path}",
    params(
        ("tile_id" = String, Path, description = "Tile identifier, e.g. 2600_1199"),
        ("path" = String, Path, description = "File path relative to the tile directory")
    ),
    responses(
        (status = 200, description = "Artifact file, range requests supported"),
        (status = 400, description = "Path escapes the tile directory"),
        (status = 404, description = "Unknown tile, tile not converted or file missing")
    ),
    tag = "tiles"
)]
pub async fn serve_tile_file(
    State(state): State<AppState>,
    Path((tile_id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    serve_artifact(&state, &tile_id, &path, request).await
}

async fn serve_artifact(state: &AppState, tile_id: &str, path: &str, request: Request) -> Response {
    let tile_id: TileId = match tile_id.parse() {
        Ok(id) => id,
        // No such tile can exist, so this is a miss like any other
        Err(_) => return handle_error(AppError::not_found("tile", tile_id)),
    };
    let cache = state.orchestrator.cache();

    // Only tiles whose conversion completed are served
    match cache.is_converted_ready(&tile_id).await {
        Ok(true) => {}
        Ok(false) => return handle_error(AppError::not_found("tile", tile_id.to_string())),
        Err(e) => return handle_error(e.into()),
    }

    let relative = format!("{}/{}", cache.converted_dir(&tile_id), path);
    let file = match cache.sandbox().resolve_existing(&relative).await {
        Ok(file) => file,
        Err(e) => return handle_error(e.into()),
    };
    let is_file = tokio::fs::metadata(&file)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        return handle_error(AppError::not_found("artifact", format!("{tile_id}/{path}")));
    }

    if let Err(e) = cache.touch(&tile_id).await {
        warn!("Failed to touch served tile {}: {}", tile_id, e);
    }
    debug!("Serving {}/{}", tile_id, path);

    match ServeFile::new(file).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}
