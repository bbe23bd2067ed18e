//! GeoJSON import/export for features and documents.

use serde_json::{json, Map, Number, Value};

use crate::document::FeatureCollectionDocument;
use crate::error::ValidationError;
use crate::feature::{Feature, Properties, PropertyValue};
use crate::geometry::{Geometry, Position};
use crate::id::FeatureId;

fn invalid(msg: impl Into<String>) -> ValidationError {
    ValidationError::InvalidGeoJson(msg.into())
}

impl PropertyValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Non-finite floats have no JSON representation and become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

fn position(value: &Value) -> Result<Position, ValidationError> {
    let items = value.as_array().ok_or_else(|| invalid("position is not an array"))?;
    if items.len() < 2 {
        return Err(invalid("position needs at least 2 numbers"));
    }
    let x = items[0].as_f64().ok_or_else(|| invalid("x is not a number"))?;
    let y = items[1].as_f64().ok_or_else(|| invalid("y is not a number"))?;
    Ok([x, y])
}

fn positions(value: &Value) -> Result<Vec<Position>, ValidationError> {
    value
        .as_array()
        .ok_or_else(|| invalid("expected an array of positions"))?
        .iter()
        .map(position)
        .collect()
}

fn rings(value: &Value) -> Result<Vec<Vec<Position>>, ValidationError> {
    value
        .as_array()
        .ok_or_else(|| invalid("expected an array of rings"))?
        .iter()
        .map(positions)
        .collect()
}

impl Geometry {
    pub fn from_geojson(value: &Value) -> Result<Self, ValidationError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("geometry has no type"))?;
        let coords = value
            .get("coordinates")
            .ok_or_else(|| invalid("geometry has no coordinates"))?;
        let geometry = match kind {
            "Point" => Self::Point(position(coords)?),
            "MultiPoint" => Self::MultiPoint(positions(coords)?),
            "LineString" => Self::LineString(positions(coords)?),
            "MultiLineString" => Self::MultiLineString(rings(coords)?),
            "Polygon" => Self::Polygon(rings(coords)?),
            "MultiPolygon" => Self::MultiPolygon(
                coords
                    .as_array()
                    .ok_or_else(|| invalid("expected an array of polygons"))?
                    .iter()
                    .map(rings)
                    .collect::<Result<_, _>>()?,
            ),
            other => return Err(invalid(format!("unsupported geometry type {other}"))),
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn to_geojson(&self) -> Value {
        let coordinates = match self {
            Self::Point(p) => json!(p),
            Self::MultiPoint(ps) | Self::LineString(ps) => json!(ps),
            Self::MultiLineString(ls) | Self::Polygon(ls) => json!(ls),
            Self::MultiPolygon(mp) => json!(mp),
        };
        json!({ "type": self.kind().as_str(), "coordinates": coordinates })
    }
}

impl Feature {
    /// Parse a GeoJSON `Feature`. A missing id is replaced by a generated one;
    /// numeric ids are kept as their decimal string.
    pub fn from_geojson(value: &Value) -> Result<Self, ValidationError> {
        if value.get("type").and_then(Value::as_str) != Some("Feature") {
            return Err(invalid("not a Feature"));
        }
        let id = match value.get("id") {
            Some(Value::String(s)) if !s.is_empty() => FeatureId::new(s.clone()),
            Some(Value::Number(n)) => FeatureId::new(n.to_string()),
            _ => FeatureId::generate(),
        };
        let geometry = Geometry::from_geojson(
            value
                .get("geometry")
                .ok_or_else(|| invalid("feature has no geometry"))?,
        )?;
        let properties: Properties = match value.get("properties") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), PropertyValue::from_json(v)))
                .collect(),
            Some(Value::Null) | None => Properties::new(),
            Some(_) => return Err(invalid("properties must be an object")),
        };
        Ok(Self {
            id,
            geometry,
            properties,
        })
    }

    pub fn to_geojson(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        json!({
            "type": "Feature",
            "id": self.id.as_str(),
            "geometry": self.geometry.to_geojson(),
            "properties": properties,
        })
    }
}

impl FeatureCollectionDocument {
    pub fn to_geojson(&self) -> Value {
        json!({
            "type": "FeatureCollection",
            "features": self.iter().map(Feature::to_geojson).collect::<Vec<_>>(),
        })
    }

    /// Parse the features of a GeoJSON `FeatureCollection`.
    ///
    /// Returns the features rather than inserting them so that callers can
    /// submit them through a mutation.
    pub fn import_geojson(value: &Value) -> Result<Vec<Feature>, ValidationError> {
        if value.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
            return Err(invalid("not a FeatureCollection"));
        }
        value
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("FeatureCollection has no features array"))?
            .iter()
            .map(Feature::from_geojson)
            .collect()
    }
}
