use thiserror::Error;
use uuid::Uuid;

use crate::geometry::GeometryKind;
use crate::id::FeatureId;

/// A mutation or identity that is malformed, caught before any network or
/// worker call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing document id")]
    MissingDocumentId,
    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),
    #[error("feature id must not be empty")]
    EmptyFeatureId,
    #[error("unknown feature: {0}")]
    UnknownFeature(FeatureId),
    #[error("feature already exists: {0}")]
    DuplicateFeature(FeatureId),
    #[error("geometry of feature {feature_id} cannot change from {from} to {to}")]
    GeometryTypeChanged {
        feature_id: FeatureId,
        from: GeometryKind,
        to: GeometryKind,
    },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("batch mutations cannot be nested")]
    NestedBatch,
    #[error("unsupported mutation version {0}")]
    UnsupportedMutationVersion(u32),
    #[error("invalid GeoJSON: {0}")]
    InvalidGeoJson(String),
}

/// Remote state diverged in a way optimistic replay cannot resolve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConflictError {
    #[error("mutation {mutation_id} targets feature {feature_id}, which was deleted remotely")]
    FeatureDeletedRemotely {
        mutation_id: Uuid,
        feature_id: FeatureId,
    },
    #[error("mutation {mutation_id} no longer applies to the remote document: {reason}")]
    Diverged { mutation_id: Uuid, reason: String },
    #[error("mutation {mutation_id} rejected by the authority: {reason}")]
    RejectedByAuthority { mutation_id: Uuid, reason: String },
}

impl ConflictError {
    /// Classify a replay failure of a pending mutation on top of fresh
    /// remote state.
    pub fn from_replay(mutation_id: Uuid, err: ValidationError) -> Self {
        match err {
            ValidationError::UnknownFeature(feature_id) => Self::FeatureDeletedRemotely {
                mutation_id,
                feature_id,
            },
            other => Self::Diverged {
                mutation_id,
                reason: other.to_string(),
            },
        }
    }

    pub fn mutation_id(&self) -> Uuid {
        match self {
            Self::FeatureDeletedRemotely { mutation_id, .. }
            | Self::Diverged { mutation_id, .. }
            | Self::RejectedByAuthority { mutation_id, .. } => *mutation_id,
        }
    }
}
