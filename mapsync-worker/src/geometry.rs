//! The worker's geometry library.
//!
//! Planar math on raw coordinates. Buffers of non-point geometries are the
//! convex hull of the vertex circles, so concave inputs get a convex result.

use std::f64::consts::TAU;

use mapsync_core::{Feature, Geometry, Position};

use crate::ops::{BufferOptions, ComputationError, OperationName, OperationOptions};

/// Executes named operations on one feature. Implementations must be pure:
/// no access to documents or shared mutable state.
pub trait OperationExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        operation: OperationName,
        feature: &Feature,
        options: &OperationOptions,
    ) -> Result<Feature, ComputationError>;
}

/// The built-in operation set.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeometryLibrary;

impl OperationExecutor for GeometryLibrary {
    fn execute(
        &self,
        operation: OperationName,
        feature: &Feature,
        options: &OperationOptions,
    ) -> Result<Feature, ComputationError> {
        feature
            .geometry
            .validate()
            .map_err(|e| ComputationError::InvalidInput(e.to_string()))?;
        operation
            .check_options(options)
            .map_err(ComputationError::InvalidOptions)?;

        let geometry = match (operation, options) {
            (OperationName::BufferFeature, OperationOptions::Buffer(opts)) => {
                buffer(&feature.geometry, opts)?
            }
            (OperationName::BufferFeature, _) => {
                return Err(ComputationError::InvalidOptions(
                    "bufferFeature requires buffer options".to_string(),
                ))
            }
            (OperationName::CentroidFeature, _) => Geometry::Point(centroid(&feature.geometry)?),
            (OperationName::BoundingBoxFeature, _) => bounding_box(&feature.geometry)?,
        };

        let mut derived = Feature::with_generated_id(geometry);
        derived.properties = feature.properties.clone();
        Ok(derived)
    }
}

pub fn buffer(geometry: &Geometry, options: &BufferOptions) -> Result<Geometry, ComputationError> {
    let steps = options.steps as usize;
    let ring = match geometry {
        Geometry::Point(center) => close(circle(*center, options.distance, steps)),
        other => {
            let mut cloud = Vec::new();
            for vertex in other.positions() {
                cloud.extend(circle(vertex, options.distance, steps));
            }
            let hull = convex_hull(cloud);
            if hull.len() < 3 {
                return Err(ComputationError::Degenerate(
                    "buffer produced fewer than 3 hull vertices".to_string(),
                ));
            }
            close(hull)
        }
    };
    Ok(Geometry::Polygon(vec![ring]))
}

/// Area centroid for polygonal input, vertex average otherwise.
pub fn centroid(geometry: &Geometry) -> Result<Position, ComputationError> {
    let exteriors: Vec<&Vec<Position>> = match geometry {
        Geometry::Polygon(rings) => rings.first().into_iter().collect(),
        Geometry::MultiPolygon(polygons) => polygons.iter().filter_map(|p| p.first()).collect(),
        other => return vertex_average(&other.positions()),
    };

    let (mut area_sum, mut cx, mut cy) = (0.0, 0.0, 0.0);
    for ring in exteriors {
        let (area, c) = ring_area_centroid(ring);
        area_sum += area;
        cx += c[0] * area;
        cy += c[1] * area;
    }
    if area_sum.abs() < f64::EPSILON {
        return Err(ComputationError::Degenerate("polygon has zero area".to_string()));
    }
    Ok([cx / area_sum, cy / area_sum])
}

pub fn bounding_box(geometry: &Geometry) -> Result<Geometry, ComputationError> {
    let [min_x, min_y, max_x, max_y] = geometry
        .bbox()
        .ok_or_else(|| ComputationError::Degenerate("geometry has no positions".to_string()))?;
    if max_x - min_x <= 0.0 || max_y - min_y <= 0.0 {
        return Err(ComputationError::Degenerate(
            "bounding box has zero area".to_string(),
        ));
    }
    Ok(Geometry::Polygon(vec![vec![
        [min_x, min_y],
        [max_x, min_y],
        [max_x, max_y],
        [min_x, max_y],
        [min_x, min_y],
    ]]))
}

fn circle(center: Position, radius: f64, steps: usize) -> Vec<Position> {
    (0..steps)
        .map(|i| {
            let angle = TAU * i as f64 / steps as f64;
            [center[0] + radius * angle.cos(), center[1] + radius * angle.sin()]
        })
        .collect()
}

fn close(mut ring: Vec<Position>) -> Vec<Position> {
    if let Some(first) = ring.first().copied() {
        ring.push(first);
    }
    ring
}

fn vertex_average(points: &[Position]) -> Result<Position, ComputationError> {
    if points.is_empty() {
        return Err(ComputationError::Degenerate("geometry has no positions".to_string()));
    }
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(x, y), p| (x + p[0], y + p[1]));
    Ok([sx / n, sy / n])
}

/// Signed area and centroid of a closed ring (shoelace formula).
fn ring_area_centroid(ring: &[Position]) -> (f64, Position) {
    let (mut a, mut cx, mut cy) = (0.0, 0.0, 0.0);
    for pair in ring.windows(2) {
        let (p, q) = (pair[0], pair[1]);
        let cross = p[0] * q[1] - q[0] * p[1];
        a += cross;
        cx += (p[0] + q[0]) * cross;
        cy += (p[1] + q[1]) * cross;
    }
    let area = a / 2.0;
    if area.abs() < f64::EPSILON {
        return (0.0, [0.0, 0.0]);
    }
    (area, [cx / (6.0 * area), cy / (6.0 * area)])
}

/// Andrew's monotone chain. Returns the hull counter-clockwise, unclosed.
fn convex_hull(mut points: Vec<Position>) -> Vec<Position> {
    points.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    points.dedup();
    if points.len() < 3 {
        return points;
    }

    fn cross(o: Position, a: Position, b: Position) -> f64 {
        (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
    }

    let mut lower: Vec<Position> = Vec::new();
    for &p in &points {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<Position> = Vec::new();
    for &p in points.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}
