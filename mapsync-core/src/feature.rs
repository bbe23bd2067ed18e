use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::geometry::Geometry;
use crate::id::FeatureId;

/// Property bag of a feature. Keys are unique; insertion order is kept.
pub type Properties = IndexMap<String, PropertyValue>;

/// A property value.
///
/// Mirrors JSON values but keeps integers and floats apart so that values
/// round-trip through the binary wire format unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PropertyValue>),
    Map(IndexMap<String, PropertyValue>),
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A single geographic entity within a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: Geometry,
    pub properties: Properties,
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            geometry,
            properties: Properties::new(),
        }
    }

    /// New feature with a generated id.
    pub fn with_generated_id(geometry: Geometry) -> Self {
        Self::new(FeatureId::generate(), geometry)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyFeatureId);
        }
        self.geometry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let f = Feature::new("a", Geometry::Point([1.0, 2.0]))
            .with_property("name", "Dock")
            .with_property("depth", 4.5)
            .with_property("public", true);
        assert_eq!(f.property("name"), Some(&PropertyValue::Text("Dock".into())));
        assert_eq!(f.property("depth"), Some(&PropertyValue::Float(4.5)));
        assert_eq!(f.properties.len(), 3);
    }

    #[test]
    fn test_property_keys_unique() {
        let f = Feature::new("a", Geometry::Point([0.0, 0.0]))
            .with_property("k", 1i64)
            .with_property("k", 2i64);
        assert_eq!(f.properties.len(), 1);
        assert_eq!(f.property("k"), Some(&PropertyValue::Int(2)));
    }

    #[test]
    fn test_validate_empty_id() {
        let f = Feature::new("", Geometry::Point([0.0, 0.0]));
        assert_eq!(f.validate(), Err(ValidationError::EmptyFeatureId));
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = Feature::with_generated_id(Geometry::Point([0.0, 0.0]));
        let b = Feature::with_generated_id(Geometry::Point([0.0, 0.0]));
        assert_ne!(a.id, b.id);
    }
}
