//! Feature collection documents and mutation application.
//!
//! The same application code runs in three places, each with its own
//! [`ApplyPolicy`]:
//!
//! ```text
//!   mutate() on a client ──► Strict        (reject anything surprising)
//!   push on the authority ─► Authoritative (deleting a missing feature is a no-op)
//!   replay after a pull ───► Replay        (creates upsert, deletes are idempotent)
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::feature::Feature;
use crate::geometry::Geometry;
use crate::id::{FeatureId, WrappedFeatureCollectionId};
use crate::mutation::{Mutation, MutationKind, PropertyPatch};

/// How surprising preconditions are treated when applying a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Local submission: create on an existing id, update or delete of an
    /// unknown id all fail.
    Strict,
    /// Authority: like `Strict`, but deleting an already-deleted feature
    /// succeeds (remote delete wins).
    Authoritative,
    /// Replaying pending mutations on fresh remote state: create upserts,
    /// delete of a missing feature is a no-op, update of a missing feature
    /// fails (reported as a conflict by the caller).
    Replay,
}

/// Immutable-by-convention snapshot of a feature collection.
///
/// `version` is the authority version this state derives from; a brand-new
/// document has version 0 and no features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollectionDocument {
    pub id: WrappedFeatureCollectionId,
    pub version: u64,
    pub features: IndexMap<FeatureId, Feature>,
}

impl FeatureCollectionDocument {
    pub fn empty(id: WrappedFeatureCollectionId) -> Self {
        Self {
            id,
            version: 0,
            features: IndexMap::new(),
        }
    }

    pub fn get(&self, id: &FeatureId) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn contains(&self, id: &FeatureId) -> bool {
        self.features.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }

    /// Apply a mutation under `policy`. Batches are atomic: on error the
    /// document is left untouched.
    pub fn apply(&mut self, mutation: &Mutation, policy: ApplyPolicy) -> Result<(), ValidationError> {
        mutation.validate()?;
        match &mutation.kind {
            MutationKind::Batch(kinds) => {
                let mut scratch = self.features.clone();
                for kind in kinds {
                    apply_kind(&mut scratch, kind, policy)?;
                }
                self.features = scratch;
                Ok(())
            }
            kind => apply_kind(&mut self.features, kind, policy),
        }
    }
}

fn apply_kind(
    features: &mut IndexMap<FeatureId, Feature>,
    kind: &MutationKind,
    policy: ApplyPolicy,
) -> Result<(), ValidationError> {
    match kind {
        MutationKind::Create { feature } => {
            if features.contains_key(&feature.id) && policy != ApplyPolicy::Replay {
                return Err(ValidationError::DuplicateFeature(feature.id.clone()));
            }
            features.insert(feature.id.clone(), feature.clone());
            Ok(())
        }
        MutationKind::Update {
            feature_id,
            geometry,
            properties,
        } => {
            let feature = features
                .get_mut(feature_id)
                .ok_or_else(|| ValidationError::UnknownFeature(feature_id.clone()))?;
            update_feature(feature, geometry.as_ref(), properties)
        }
        MutationKind::Delete { feature_id } => {
            if features.shift_remove(feature_id).is_none() && policy == ApplyPolicy::Strict {
                return Err(ValidationError::UnknownFeature(feature_id.clone()));
            }
            Ok(())
        }
        MutationKind::Batch(_) => Err(ValidationError::NestedBatch),
    }
}

fn update_feature(
    feature: &mut Feature,
    geometry: Option<&Geometry>,
    patch: &PropertyPatch,
) -> Result<(), ValidationError> {
    if let Some(geometry) = geometry {
        let (from, to) = (feature.geometry.kind(), geometry.kind());
        if from != to {
            return Err(ValidationError::GeometryTypeChanged {
                feature_id: feature.id.clone(),
                from,
                to,
            });
        }
        feature.geometry = geometry.clone();
    }
    for (key, value) in patch {
        match value {
            Some(value) => {
                feature.properties.insert(key.clone(), value.clone());
            }
            None => {
                feature.properties.shift_remove(key);
            }
        }
    }
    Ok(())
}
