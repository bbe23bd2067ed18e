//! The operation surface shared by the dispatcher and the workers.
//!
//! Operation names and option shapes are the compatibility boundary between
//! the two sides. Any incompatible change bumps [`WORKER_API_VERSION`].

use mapsync_core::Feature;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const WORKER_API_VERSION: u32 = 1;

/// The fixed set of operations a worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationName {
    BufferFeature,
    CentroidFeature,
    BoundingBoxFeature,
}

impl OperationName {
    pub const ALL: [OperationName; 3] = [
        OperationName::BufferFeature,
        OperationName::CentroidFeature,
        OperationName::BoundingBoxFeature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BufferFeature => "bufferFeature",
            Self::CentroidFeature => "centroidFeature",
            Self::BoundingBoxFeature => "boundingBoxFeature",
        }
    }

    /// Check that `options` has the shape this operation expects.
    pub fn check_options(&self, options: &OperationOptions) -> Result<(), String> {
        match (self, options) {
            (Self::BufferFeature, OperationOptions::Buffer(buffer)) => buffer.validate(),
            (Self::BufferFeature, OperationOptions::None) => {
                Err("bufferFeature requires buffer options".to_string())
            }
            (_, OperationOptions::None) => Ok(()),
            (op, other) => Err(format!("{op} does not accept {other:?}")),
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationName {
    type Err = UnsupportedOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnsupportedOperationError(s.to_string()))
    }
}

pub const MIN_BUFFER_STEPS: u32 = 3;
pub const MAX_BUFFER_STEPS: u32 = 256;

/// Options for `bufferFeature`. `distance` is in coordinate units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferOptions {
    pub distance: f64,
    /// Segments used to approximate a full circle.
    pub steps: u32,
}

impl BufferOptions {
    pub fn new(distance: f64) -> Self {
        Self {
            distance,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.distance.is_finite() || self.distance <= 0.0 {
            return Err(format!("buffer distance must be positive, got {}", self.distance));
        }
        if !(MIN_BUFFER_STEPS..=MAX_BUFFER_STEPS).contains(&self.steps) {
            return Err(format!(
                "buffer steps must be within {MIN_BUFFER_STEPS}..={MAX_BUFFER_STEPS}, got {}",
                self.steps
            ));
        }
        Ok(())
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            distance: 1.0,
            steps: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum OperationOptions {
    #[default]
    None,
    Buffer(BufferOptions),
}

/// A correlation-tagged request crossing into a worker.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub id: u64,
    pub operation: OperationName,
    pub feature: Feature,
    pub options: OperationOptions,
}

/// A worker's answer, tagged with the id of the request it belongs to.
#[derive(Debug, Clone)]
pub struct OperationResponse {
    pub id: u64,
    pub result: Result<Feature, ComputationError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported operation: {0}")]
pub struct UnsupportedOperationError(pub String);

/// The worker rejected the input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputationError {
    #[error("invalid input geometry: {0}")]
    InvalidInput(String),
    #[error("degenerate geometry: {0}")]
    Degenerate(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("operation panicked: {0}")]
    Panicked(String),
}
