//! Mutations: named, versioned intents to change a document.
//!
//! Every mutation carries a client-generated [`Uuid`] so that the authority
//! can recognise a retried delivery and treat it as a no-op.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::feature::{Feature, PropertyValue};
use crate::geometry::Geometry;
use crate::id::FeatureId;

/// Schema version of [`MutationKind`]. Bumped on incompatible changes.
pub const MUTATION_VERSION: u32 = 1;

/// Property patch: `Some(value)` sets a key, `None` removes it.
pub type PropertyPatch = IndexMap<String, Option<PropertyValue>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    Create {
        feature: Feature,
    },
    Update {
        feature_id: FeatureId,
        /// Replacement geometry; must keep the feature's geometry kind.
        geometry: Option<Geometry>,
        properties: PropertyPatch,
    },
    Delete {
        feature_id: FeatureId,
    },
    /// Applied atomically, in order. Members may not be batches.
    Batch(Vec<MutationKind>),
}

impl MutationKind {
    /// Mutator name used in logs and on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "createFeature",
            Self::Update { .. } => "updateFeature",
            Self::Delete { .. } => "deleteFeature",
            Self::Batch(_) => "batch",
        }
    }

    fn validate(&self, nested: bool) -> Result<(), ValidationError> {
        match self {
            Self::Create { feature } => feature.validate(),
            Self::Update {
                feature_id,
                geometry,
                ..
            } => {
                if feature_id.is_empty() {
                    return Err(ValidationError::EmptyFeatureId);
                }
                match geometry {
                    Some(g) => g.validate(),
                    None => Ok(()),
                }
            }
            Self::Delete { feature_id } => {
                if feature_id.is_empty() {
                    return Err(ValidationError::EmptyFeatureId);
                }
                Ok(())
            }
            Self::Batch(kinds) => {
                if nested {
                    return Err(ValidationError::NestedBatch);
                }
                kinds.iter().try_for_each(|k| k.validate(true))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: Uuid,
    pub version: u32,
    pub kind: MutationKind,
}

impl Mutation {
    pub fn new(kind: MutationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: MUTATION_VERSION,
            kind,
        }
    }

    pub fn create(feature: Feature) -> Self {
        Self::new(MutationKind::Create { feature })
    }

    pub fn delete(feature_id: impl Into<FeatureId>) -> Self {
        Self::new(MutationKind::Delete {
            feature_id: feature_id.into(),
        })
    }

    pub fn set_geometry(feature_id: impl Into<FeatureId>, geometry: Geometry) -> Self {
        Self::new(MutationKind::Update {
            feature_id: feature_id.into(),
            geometry: Some(geometry),
            properties: PropertyPatch::new(),
        })
    }

    pub fn set_property(
        feature_id: impl Into<FeatureId>,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        let mut properties = PropertyPatch::new();
        properties.insert(key.into(), Some(value.into()));
        Self::new(MutationKind::Update {
            feature_id: feature_id.into(),
            geometry: None,
            properties,
        })
    }

    pub fn remove_property(feature_id: impl Into<FeatureId>, key: impl Into<String>) -> Self {
        let mut properties = PropertyPatch::new();
        properties.insert(key.into(), None);
        Self::new(MutationKind::Update {
            feature_id: feature_id.into(),
            geometry: None,
            properties,
        })
    }

    pub fn batch(kinds: Vec<MutationKind>) -> Self {
        Self::new(MutationKind::Batch(kinds))
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Structural checks that need no document: schema version, feature
    /// ids, geometry shape, batch nesting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.version != MUTATION_VERSION {
            return Err(ValidationError::UnsupportedMutationVersion(self.version));
        }
        self.kind.validate(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        let f = Feature::new("a", Geometry::Point([0.0, 0.0]));
        assert_eq!(Mutation::create(f).name(), "createFeature");
        assert_eq!(Mutation::delete("a").name(), "deleteFeature");
        assert_eq!(Mutation::set_property("a", "k", 1i64).name(), "updateFeature");
        assert_eq!(Mutation::batch(vec![]).name(), "batch");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Mutation::delete("a").id, Mutation::delete("a").id);
    }

    #[test]
    fn test_validate_nested_batch() {
        let inner = MutationKind::Batch(vec![]);
        let m = Mutation::batch(vec![inner]);
        assert_eq!(m.validate(), Err(ValidationError::NestedBatch));
    }

    #[test]
    fn test_validate_version() {
        let mut m = Mutation::delete("a");
        m.version = 99;
        assert_eq!(m.validate(), Err(ValidationError::UnsupportedMutationVersion(99)));
    }

    #[test]
    fn test_validate_geometry_in_update() {
        let m = Mutation::set_geometry("a", Geometry::LineString(vec![[0.0, 0.0]]));
        assert!(matches!(m.validate(), Err(ValidationError::InvalidGeometry(_))));
    }

    #[test]
    fn test_validate_empty_feature_id() {
        assert_eq!(Mutation::delete("").validate(), Err(ValidationError::EmptyFeatureId));
    }

    #[test]
    fn test_bincode_compatible() {
        let f = Feature::new("a", Geometry::Point([1.0, 2.0])).with_property("n", 1i64);
        let m = Mutation::batch(vec![
            MutationKind::Create { feature: f },
            Mutation::remove_property("a", "n").kind,
        ]);
        let bytes = bincode::serde::encode_to_vec(&m, bincode::config::standard()).unwrap();
        let (decoded, _): (Mutation, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, m);
    }
}
