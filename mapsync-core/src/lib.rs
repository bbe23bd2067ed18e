//! # mapsync-core: Feature collection model
//!
//! Shared by every other crate in the workspace: the document model, the
//! mutation vocabulary, and the one place where mutations are applied.
//!
//! ```text
//! FeatureCollectionDocument ── id: WrappedFeatureCollectionId
//!        │                  └─ version: u64 (authority version)
//!        ▼
//!   Feature ── id: FeatureId
//!          ├── geometry: Geometry (kind is immutable)
//!          └── properties: key → PropertyValue
//! ```

pub mod document;
pub mod error;
pub mod feature;
pub mod geojson;
pub mod geometry;
pub mod id;
pub mod mutation;

pub use document::{ApplyPolicy, FeatureCollectionDocument};
pub use error::{ConflictError, ValidationError};
pub use feature::{Feature, Properties, PropertyValue};
pub use geometry::{Geometry, GeometryKind, Position};
pub use id::{FeatureId, WrappedFeatureCollectionId};
pub use mutation::{Mutation, MutationKind, PropertyPatch, MUTATION_VERSION};
