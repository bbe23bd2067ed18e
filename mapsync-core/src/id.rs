//! Document and feature identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum accepted length of a document id, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Query parameter names that carry a document id.
const ID_PARAMS: &[&str] = &["id", "wrappedFeatureCollectionId"];

/// Opaque external identifier of a feature collection document.
///
/// Always validated: non-empty, at most [`MAX_DOCUMENT_ID_LEN`] bytes, and
/// limited to ASCII alphanumerics, `-` and `_`. Deserialization runs the same
/// check, so a malformed id can never reach a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WrappedFeatureCollectionId(String);

impl WrappedFeatureCollectionId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ValidationError::MissingDocumentId);
        }
        if raw.len() > MAX_DOCUMENT_ID_LEN {
            return Err(ValidationError::InvalidDocumentId(format!(
                "id is {} bytes, limit is {MAX_DOCUMENT_ID_LEN}",
                raw.len()
            )));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ValidationError::InvalidDocumentId(format!(
                "unexpected character {c:?}"
            )));
        }
        Ok(Self(raw))
    }

    /// Extract the document id from a URL query string such as
    /// `id=abc&client=...`. A leading `?` is tolerated.
    ///
    /// Missing or repeated-and-conflicting values are rejected.
    pub fn from_query(query: &str) -> Result<Self, ValidationError> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut found: Option<&str> = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if !ID_PARAMS.contains(&key) {
                continue;
            }
            match found {
                Some(prev) if prev != value => {
                    return Err(ValidationError::InvalidDocumentId(
                        "conflicting id parameters".to_string(),
                    ))
                }
                _ => found = Some(value),
            }
        }
        match found {
            Some(value) => Self::parse(value),
            None => Err(ValidationError::MissingDocumentId),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WrappedFeatureCollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WrappedFeatureCollectionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WrappedFeatureCollectionId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<WrappedFeatureCollectionId> for String {
    fn from(id: WrappedFeatureCollectionId) -> Self {
        id.0
    }
}

/// Stable id of a feature within one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random UUIDv4-based id for newly drawn features.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
