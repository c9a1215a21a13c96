//! Tile addressing types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// A geographic point in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// An axis-aligned box in projected metres (easting/northing).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProjectedBounds {
    pub min_e: f64,
    pub min_n: f64,
    pub max_e: f64,
    pub max_n: f64,
}

impl ProjectedBounds {
    /// Build a box from two corners in any order.
    pub fn from_corners(e1: f64, n1: f64, e2: f64, n2: f64) -> Self {
        Self {
            min_e: e1.min(e2),
            min_n: n1.min(n2),
            max_e: e1.max(e2),
            max_n: n1.max(n2),
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.min_e, self.min_n, self.max_e, self.max_n]
            .iter()
            .all(|v| v.is_finite())
            && self.min_e <= self.max_e
            && self.min_n <= self.max_n
    }

    pub fn width(&self) -> f64 {
        self.max_e - self.min_e
    }

    pub fn height(&self) -> f64 {
        self.max_n - self.min_n
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_e + self.max_e) / 2.0,
            (self.min_n + self.max_n) / 2.0,
        )
    }

    /// Edge-inclusive containment.
    pub fn contains(&self, e: f64, n: f64) -> bool {
        e >= self.min_e && e <= self.max_e && n >= self.min_n && n <= self.max_n
    }

    /// Edge-inclusive intersection test.
    pub fn intersects(&self, other: &ProjectedBounds) -> bool {
        self.min_e <= other.max_e
            && other.min_e <= self.max_e
            && self.min_n <= other.max_n
            && other.min_n <= self.max_n
    }

    pub fn intersection(&self, other: &ProjectedBounds) -> Option<ProjectedBounds> {
        if !self.intersects(other) {
            return None;
        }
        Some(ProjectedBounds {
            min_e: self.min_e.max(other.min_e),
            min_n: self.min_n.max(other.min_n),
            max_e: self.max_e.min(other.max_e),
            max_n: self.max_n.min(other.max_n),
        })
    }

    /// Grow the box by `margin` metres on every side.
    pub fn expand(&self, margin: f64) -> ProjectedBounds {
        ProjectedBounds {
            min_e: self.min_e - margin,
            min_n: self.min_n - margin,
            max_e: self.max_e + margin,
            max_n: self.max_n + margin,
        }
    }
}

/// Identifier of a grid cell, `XXXX_YYYY` from the zero-padded grid indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileId {
    grid_x: i64,
    grid_y: i64,
}

impl TileId {
    pub fn new(grid_x: i64, grid_y: i64) -> Self {
        Self { grid_x, grid_y }
    }

    pub fn grid_x(&self) -> i64 {
        self.grid_x
    }

    pub fn grid_y(&self) -> i64 {
        self.grid_y
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}_{:04}", self.grid_x, self.grid_y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid tile id '{0}'")]
pub struct InvalidTileId(pub String);

impl FromStr for TileId {
    type Err = InvalidTileId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTileId(s.to_string());
        let (x, y) = s.split_once('_').ok_or_else(invalid)?;
        let parse = |part: &str| -> Result<i64, InvalidTileId> {
            let digits = part.strip_prefix('-').unwrap_or(part);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<i64>().map_err(|_| invalid())
        };
        let id = TileId::new(parse(x)?, parse(y)?);
        // Only the canonical spelling is accepted so that one cell has one id
        if id.to_string() != s {
            return Err(invalid());
        }
        Ok(id)
    }
}

impl TryFrom<String> for TileId {
    type Error = InvalidTileId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TileId> for String {
    fn from(id: TileId) -> Self {
        id.to_string()
    }
}

/// One grid cell with its projected bounds and geographic center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Tile {
    #[schema(value_type = String, example = "2600_1199")]
    pub tile_id: TileId,
    pub grid_x: i64,
    pub grid_y: i64,
    pub bounds: ProjectedBounds,
    pub center: GeoPoint,
}
