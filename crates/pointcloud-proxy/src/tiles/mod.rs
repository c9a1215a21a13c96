//! Tile addressing on a fixed projected grid.
//!
//! Geographic points are projected to LV95, floored by the cell edge length
//! into integer grid indices, and named `XXXX_YYYY`. The mapping is pure and
//! stable across restarts.

pub mod projection;
pub mod types;

pub use projection::{Projection, SwissApproximate, SwissObliqueMercator};
pub use types::{GeoPoint, ProjectedBounds, Tile, TileId};

use crate::config::{GridConfig, ProjectionKind, RegionBounds};
use std::sync::Arc;
use tracing::warn;

/// Slack added around a projected envelope so that boundary sampling never
/// loses a cell touching the edge.
const ENVELOPE_TOLERANCE_M: f64 = 0.01;

/// Maps geographic coordinates to grid cells and back.
#[derive(Debug, Clone)]
pub struct TileGrid {
    projection: Arc<dyn Projection>,
    fallback: SwissApproximate,
    cell_size: f64,
    origin_e: f64,
    origin_n: f64,
    region: RegionBounds,
}

impl TileGrid {
    pub fn new(
        projection: Arc<dyn Projection>,
        cell_size: f64,
        origin_e: f64,
        origin_n: f64,
        region: RegionBounds,
    ) -> Self {
        Self {
            projection,
            fallback: SwissApproximate,
            cell_size,
            origin_e,
            origin_n,
            region,
        }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        let projection: Arc<dyn Projection> = match config.projection {
            ProjectionKind::Precise => Arc::new(SwissObliqueMercator::new()),
            ProjectionKind::Approximate => Arc::new(SwissApproximate),
        };
        Self::new(
            projection,
            config.cell_size_m,
            config.origin_e,
            config.origin_n,
            config.region,
        )
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn region(&self) -> &RegionBounds {
        &self.region
    }

    /// Whether a point lies in the supported region.
    pub fn in_region(&self, lat: f64, lon: f64) -> bool {
        self.region.contains(lat, lon)
    }

    /// Project a point, falling back to the closed-form transform.
    pub fn project(&self, lat: f64, lon: f64) -> (f64, f64) {
        if let Some(projected) = self.projection.forward(lat, lon) {
            return projected;
        }
        warn!(
            "{} transform unavailable for ({}, {}), using {}",
            self.projection.name(),
            lat,
            lon,
            self.fallback.name()
        );
        self.fallback
            .forward(lat, lon)
            .unwrap_or((f64::NAN, f64::NAN))
    }

    /// Inverse of [`TileGrid::project`].
    pub fn unproject(&self, easting: f64, northing: f64) -> GeoPoint {
        let (lat, lon) = self
            .projection
            .inverse(easting, northing)
            .or_else(|| self.fallback.inverse(easting, northing))
            .unwrap_or((f64::NAN, f64::NAN));
        GeoPoint { lat, lon }
    }

    /// Grid indices of the cell containing a projected coordinate.
    pub fn indices_for(&self, easting: f64, northing: f64) -> (i64, i64) {
        (
            ((easting - self.origin_e) / self.cell_size).floor() as i64,
            ((northing - self.origin_n) / self.cell_size).floor() as i64,
        )
    }

    pub fn tile_for_indices(&self, grid_x: i64, grid_y: i64) -> Tile {
        let min_e = self.origin_e + grid_x as f64 * self.cell_size;
        let min_n = self.origin_n + grid_y as f64 * self.cell_size;
        let bounds = ProjectedBounds {
            min_e,
            min_n,
            max_e: min_e + self.cell_size,
            max_n: min_n + self.cell_size,
        };
        let (center_e, center_n) = bounds.center();
        Tile {
            tile_id: TileId::new(grid_x, grid_y),
            grid_x,
            grid_y,
            bounds,
            center: self.unproject(center_e, center_n),
        }
    }

    pub fn tile_for_id(&self, tile_id: &TileId) -> Tile {
        self.tile_for_indices(tile_id.grid_x(), tile_id.grid_y())
    }

    pub fn tile_for_point(&self, lat: f64, lon: f64) -> Tile {
        let (e, n) = self.project(lat, lon);
        let (x, y) = self.indices_for(e, n);
        self.tile_for_indices(x, y)
    }

    /// Every cell whose bounds intersect the geographic box, edges included.
    ///
    /// A lat/lon box is not axis-aligned once projected, so its boundary is
    /// sampled at sub-cell spacing and, row by row, only the cells between
    /// the westmost and eastmost boundary point inside that row are taken.
    /// Cells are returned row by row, south to north, west to east.
    pub fn tiles_for_bbox(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Vec<Tile> {
        let Some(ring) = self.boundary_ring(min_lat, min_lon, max_lat, max_lon) else {
            return Vec::new();
        };
        self.row_spans(&ring)
            .into_iter()
            .flat_map(|(y, min_x, max_x)| (min_x..=max_x).map(move |x| self.tile_for_indices(x, y)))
            .collect()
    }

    /// Cell count of the envelope of the four projected corners.
    ///
    /// Costs four projections, so oversized boxes can be turned away before
    /// their boundary is sampled. Within the region the grid is rotated by a
    /// few degrees at most, which keeps this close to the length of
    /// [`TileGrid::tiles_for_bbox`].
    pub fn estimate_tiles_for_bbox(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> u64 {
        let (min_lat, max_lat) = (min_lat.min(max_lat), min_lat.max(max_lat));
        let (min_lon, max_lon) = (min_lon.min(max_lon), min_lon.max(max_lon));
        let projected = [
            self.project(min_lat, min_lon),
            self.project(min_lat, max_lon),
            self.project(max_lat, max_lon),
            self.project(max_lat, min_lon),
        ];
        if projected.iter().any(|(e, n)| !e.is_finite() || !n.is_finite()) {
            return 0;
        }
        let (min_x, min_y) = self.indices_for(
            projected.iter().map(|p| p.0).fold(f64::INFINITY, f64::min),
            projected.iter().map(|p| p.1).fold(f64::INFINITY, f64::min),
        );
        let (max_x, max_y) = self.indices_for(
            projected.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max),
            projected.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max),
        );
        (max_x.saturating_sub(min_x).saturating_add(1) as u64)
            .saturating_mul(max_y.saturating_sub(min_y).saturating_add(1) as u64)
    }

    /// Projected boundary of a geographic box, sampled densely enough that
    /// straight segments between samples stay within a centimetre of it.
    fn boundary_ring(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Option<Vec<(f64, f64)>> {
        let (min_lat, max_lat) = (min_lat.min(max_lat), min_lat.max(max_lat));
        let (min_lon, max_lon) = (min_lon.min(max_lon), min_lon.max(max_lon));
        let corners = [
            (min_lat, min_lon),
            (min_lat, max_lon),
            (max_lat, max_lon),
            (max_lat, min_lon),
        ];
        let projected: Vec<(f64, f64)> = corners
            .iter()
            .map(|&(lat, lon)| self.project(lat, lon))
            .collect();
        if projected.iter().any(|(e, n)| !e.is_finite() || !n.is_finite()) {
            return None;
        }

        let mut ring = Vec::new();
        for i in 0..4 {
            let (lat_a, lon_a) = corners[i];
            let (lat_b, lon_b) = corners[(i + 1) % 4];
            let (ea, na) = projected[i];
            let (eb, nb) = projected[(i + 1) % 4];

            // A quarter cell between samples keeps edge curvature far below a centimetre
            let length = (eb - ea).hypot(nb - na);
            let steps = ((length / (self.cell_size / 4.0)).ceil() as usize).clamp(1, 100_000);
            // The closing sample is the next edge's first one
            for step in 0..steps {
                let t = step as f64 / steps as f64;
                let point = self.project(lat_a + (lat_b - lat_a) * t, lon_a + (lon_b - lon_a) * t);
                if point.0.is_finite() && point.1.is_finite() {
                    ring.push(point);
                }
            }
        }
        Some(ring)
    }

    /// `(grid_y, min_x, max_x)` for every row the ring passes through.
    fn row_spans(&self, ring: &[(f64, f64)]) -> Vec<(i64, i64, i64)> {
        if ring.is_empty() {
            return Vec::new();
        }
        let min_n = ring.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let max_n = ring.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
        let (_, min_y) = self.indices_for(self.origin_e, min_n - ENVELOPE_TOLERANCE_M);
        let (_, max_y) = self.indices_for(self.origin_e, max_n + ENVELOPE_TOLERANCE_M);

        let mut spans = Vec::new();
        for y in min_y..=max_y {
            let strip_low = self.origin_n + y as f64 * self.cell_size - ENVELOPE_TOLERANCE_M;
            let strip_high = strip_low + self.cell_size + 2.0 * ENVELOPE_TOLERANCE_M;

            let (mut west, mut east) = (f64::INFINITY, f64::NEG_INFINITY);
            for (i, &a) in ring.iter().enumerate() {
                let b = ring[(i + 1) % ring.len()];
                if let Some((e0, e1)) = clip_to_strip(a, b, strip_low, strip_high) {
                    west = west.min(e0.min(e1));
                    east = east.max(e0.max(e1));
                }
            }
            if west > east {
                continue;
            }
            let (min_x, _) = self.indices_for(west - ENVELOPE_TOLERANCE_M, strip_low);
            let (max_x, _) = self.indices_for(east + ENVELOPE_TOLERANCE_M, strip_low);
            spans.push((y, min_x, max_x));
        }
        spans
    }
}

/// Eastings where segment `a`-`b` enters and leaves the band `low..=high` of
/// northings, or `None` if it never touches the band.
fn clip_to_strip(a: (f64, f64), b: (f64, f64), low: f64, high: f64) -> Option<(f64, f64)> {
    let ((ea, na), (eb, nb)) = (a, b);
    if na.max(nb) < low || na.min(nb) > high {
        return None;
    }
    if nb == na {
        return Some((ea, eb));
    }
    let easting_at = |n: f64| {
        let t = ((n - na) / (nb - na)).clamp(0.0, 1.0);
        ea + (eb - ea) * t
    };
    Some((easting_at(low), easting_at(high)))
}
