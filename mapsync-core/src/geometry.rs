//! Feature geometries.
//!
//! Positions are `[x, y]` pairs (`[lon, lat]` for geographic data). The
//! structural type of a geometry ([`GeometryKind`]) is part of a feature's
//! identity: edits may move coordinates but never change the kind.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

pub type Position = [f64; 2];

/// Structural geometry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
}

impl GeometryKind {
    /// GeoJSON `type` name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Point => "Point",
            Self::MultiPoint => "MultiPoint",
            Self::LineString => "LineString",
            Self::MultiLineString => "MultiLineString",
            Self::Polygon => "Polygon",
            Self::MultiPolygon => "MultiPolygon",
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    /// Exterior ring first, then holes.
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    pub fn kind(&self) -> GeometryKind {
        match self {
            Self::Point(_) => GeometryKind::Point,
            Self::MultiPoint(_) => GeometryKind::MultiPoint,
            Self::LineString(_) => GeometryKind::LineString,
            Self::MultiLineString(_) => GeometryKind::MultiLineString,
            Self::Polygon(_) => GeometryKind::Polygon,
            Self::MultiPolygon(_) => GeometryKind::MultiPolygon,
        }
    }

    /// Check the structural rules for this geometry type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Point(p) => check_position(p),
            Self::MultiPoint(points) => {
                non_empty(points, "MultiPoint")?;
                points.iter().try_for_each(check_position)
            }
            Self::LineString(line) => check_line(line),
            Self::MultiLineString(lines) => {
                non_empty(lines, "MultiLineString")?;
                lines.iter().try_for_each(|l| check_line(l))
            }
            Self::Polygon(rings) => check_polygon(rings),
            Self::MultiPolygon(polygons) => {
                non_empty(polygons, "MultiPolygon")?;
                polygons.iter().try_for_each(|p| check_polygon(p))
            }
        }
    }

    /// All positions of the geometry, flattened in document order.
    pub fn positions(&self) -> Vec<Position> {
        match self {
            Self::Point(p) => vec![*p],
            Self::MultiPoint(points) | Self::LineString(points) => points.clone(),
            Self::MultiLineString(lines) | Self::Polygon(lines) => {
                lines.iter().flatten().copied().collect()
            }
            Self::MultiPolygon(polygons) => polygons.iter().flatten().flatten().copied().collect(),
        }
    }

    /// `[min_x, min_y, max_x, max_y]`, or `None` for a geometry without
    /// positions.
    pub fn bbox(&self) -> Option<[f64; 4]> {
        let positions = self.positions();
        let first = positions.first()?;
        let init = [first[0], first[1], first[0], first[1]];
        Some(positions.iter().fold(init, |b, p| {
            [b[0].min(p[0]), b[1].min(p[1]), b[2].max(p[0]), b[3].max(p[1])]
        }))
    }
}

fn non_empty<T>(items: &[T], what: &str) -> Result<(), ValidationError> {
    if items.is_empty() {
        return Err(ValidationError::InvalidGeometry(format!("{what} has no members")));
    }
    Ok(())
}

fn check_position(p: &Position) -> Result<(), ValidationError> {
    if p[0].is_finite() && p[1].is_finite() {
        Ok(())
    } else {
        Err(ValidationError::InvalidGeometry(format!(
            "non-finite coordinate {p:?}"
        )))
    }
}

fn check_line(line: &[Position]) -> Result<(), ValidationError> {
    if line.len() < 2 {
        return Err(ValidationError::InvalidGeometry(format!(
            "line needs at least 2 positions, got {}",
            line.len()
        )));
    }
    line.iter().try_for_each(check_position)
}

fn check_polygon(rings: &[Vec<Position>]) -> Result<(), ValidationError> {
    non_empty(rings, "Polygon")?;
    for ring in rings {
        if ring.len() < 4 {
            return Err(ValidationError::InvalidGeometry(format!(
                "ring needs at least 4 positions, got {}",
                ring.len()
            )));
        }
        ring.iter().try_for_each(check_position)?;
        if ring.first() != ring.last() {
            return Err(ValidationError::InvalidGeometry("ring is not closed".to_string()));
        }
    }
    Ok(())
}
