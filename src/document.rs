//! Entity documents and their two schema dialects.
//!
//! An entity document is a JSON object carrying its identity (either a combined
//! `uri` or the `namespace`/`version`/`name` triad), a `properties` field and an
//! optional `dimensions` field. Two historical shapes coexist in the same store:
//!
//! - **map-shaped** (current): `properties` and `dimensions` are objects keyed
//!   by name
//! - **list-shaped** (legacy): they are arrays of `{ "name": ..., ... }` objects
//!
//! There is no tag field. The shape of a field is resolved once into a
//! [`FieldShape`] and every consumer works from that.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::uri::{self, EntityUri, UriError};

const TRIAD: [&str; 3] = ["namespace", "version", "name"];

/// Errors raised while interpreting a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("Entity document must be a JSON object, got {found}")]
    NotAnObject { found: &'static str },

    #[error("Entity document carries no identity (expected 'uri' or 'namespace', 'version' and 'name')")]
    MissingIdentity,

    #[error("Field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error(transparent)]
    InvalidUri(#[from] UriError),

    #[error("Entity identity is inconsistent: uri={uri} but namespace/version/name give {composed}")]
    InconsistentIdentity { uri: String, composed: String },

    #[error("Field '{field}' is neither a mapping nor a list of named items")]
    InvalidShape { field: &'static str },
}

/// The named collections whose shape defines a document's dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapedField {
    /// The `properties` field.
    Properties,
    /// The `dimensions` field.
    Dimensions,
}

impl ShapedField {
    /// The JSON key of this field.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Properties => "properties",
            Self::Dimensions => "dimensions",
        }
    }
}

impl fmt::Display for ShapedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Schema dialect of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Named items are keys of an object.
    Map,
    /// Named items are elements of an array, each with a `name`.
    List,
}

/// Runtime shape of a [`ShapedField`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldShape<'a> {
    /// Object keyed by item name.
    Map(&'a Map<String, Value>),
    /// Array of named items.
    List(&'a [Value]),
    /// The field is not present.
    Absent,
    /// The field is present with an unrecognised shape (including `null`).
    Invalid,
}

impl<'a> FieldShape<'a> {
    /// The dialect implied by this shape, if any.
    #[must_use]
    pub const fn dialect(&self) -> Option<Dialect> {
        match self {
            Self::Map(_) => Some(Dialect::Map),
            Self::List(_) => Some(Dialect::List),
            Self::Absent | Self::Invalid => None,
        }
    }

    /// Iterates over the item names of this field.
    ///
    /// List elements without a string `name` are skipped.
    pub fn names(&self) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        match *self {
            Self::Map(map) => Box::new(map.keys().map(String::as_str)),
            Self::List(items) => Box::new(
                items
                    .iter()
                    .filter_map(|item| item.get("name").and_then(Value::as_str)),
            ),
            Self::Absent | Self::Invalid => Box::new(std::iter::empty()),
        }
    }

    /// Returns true if any of `wanted` names an item of this field.
    ///
    /// An absent field contains nothing.
    ///
    /// # Errors
    /// Returns [`DocumentError::InvalidShape`] for an unrecognised shape.
    pub fn contains_any<S: AsRef<str>>(
        &self,
        field: ShapedField,
        wanted: &[S],
    ) -> Result<bool, DocumentError> {
        match self {
            Self::Map(map) => Ok(wanted.iter().any(|w| map.contains_key(w.as_ref()))),
            Self::List(_) => Ok(self
                .names()
                .any(|name| wanted.iter().any(|w| w.as_ref() == name))),
            Self::Absent => Ok(false),
            Self::Invalid => Err(DocumentError::InvalidShape { field: field.key() }),
        }
    }
}

/// A versioned entity schema document.
///
/// # Examples
///
/// ```
/// use entities_registry::{Dialect, EntityDocument};
/// use serde_json::json;
///
/// let doc = EntityDocument::from_value(json!({
///     "uri": "http://x.org/0.1/Ball",
///     "properties": [{"name": "radius", "type": "float64"}],
/// }))
/// .unwrap();
/// assert_eq!(doc.identity().unwrap().name(), "Ball");
/// assert_eq!(doc.dialect(), Some(Dialect::List));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityDocument(Map<String, Value>);

impl EntityDocument {
    /// Wraps an existing JSON object.
    #[must_use]
    pub const fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wraps a JSON value, which must be an object.
    ///
    /// # Errors
    /// Returns [`DocumentError::NotAnObject`] for any other JSON type.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DocumentError::NotAnObject {
                found: json_type_name(&other),
            }),
        }
    }

    /// Borrows the underlying JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the document as a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Gets a top-level field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sets a top-level field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Returns true if the document has the top-level field.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The identity the document declares, if it declares one.
    ///
    /// A `uri` field takes precedence. Otherwise, if any of `namespace`,
    /// `version` or `name` is present, all three must be strings and are composed
    /// with trailing `/` stripped from the namespace.
    ///
    /// # Errors
    /// Returns an error when identity fields are present but malformed.
    pub fn declared_identity(&self) -> Result<Option<EntityUri>, DocumentError> {
        if let Some(raw) = self.0.get("uri") {
            let raw = raw.as_str().ok_or(DocumentError::InvalidField {
                field: "uri",
                expected: "a string",
            })?;
            return Ok(Some(EntityUri::parse(raw)?));
        }

        match self.composed_identity()? {
            Some(composed) => Ok(Some(EntityUri::parse(&composed)?)),
            None => Ok(None),
        }
    }

    /// Derives the canonical identity of the document.
    ///
    /// # Errors
    /// Returns [`DocumentError::MissingIdentity`] when no identity is declared, or
    /// the error of [`EntityDocument::declared_identity`].
    pub fn identity(&self) -> Result<EntityUri, DocumentError> {
        self.declared_identity()?
            .ok_or(DocumentError::MissingIdentity)
    }

    /// Compares every identity field the document carries with `target`.
    ///
    /// Each of `uri`, `namespace`, `version` and `name` that is present must
    /// agree with the corresponding part of `target`; absent fields are taken
    /// from `target`. Returns the first disagreeing identity: the raw `uri`, or
    /// the triad composed from the document's fields over `target`'s.
    ///
    /// # Errors
    /// Returns [`DocumentError::InvalidField`] if an identity field is not a
    /// string.
    pub fn identity_conflict(&self, target: &EntityUri) -> Result<Option<String>, DocumentError> {
        if let Some(raw) = self.0.get("uri") {
            let raw = raw.as_str().ok_or(DocumentError::InvalidField {
                field: "uri",
                expected: "a string",
            })?;
            if raw != target.as_str() {
                return Ok(Some(raw.to_string()));
            }
        }

        let mut parts = [target.namespace(), target.version(), target.name()];
        for (slot, field) in parts.iter_mut().zip(TRIAD) {
            if let Some(value) = self.0.get(field) {
                *slot = value.as_str().ok_or(DocumentError::InvalidField {
                    field,
                    expected: "a string",
                })?;
            }
        }
        let [namespace, version, name] = parts;
        let composed = uri::compose(namespace, version, name);
        Ok((composed != target.as_str()).then_some(composed))
    }

    fn composed_identity(&self) -> Result<Option<String>, DocumentError> {
        if !TRIAD.iter().any(|f| self.0.contains_key(*f)) {
            return Ok(None);
        }

        let mut parts = [""; 3];
        for (slot, field) in parts.iter_mut().zip(TRIAD) {
            *slot = self
                .0
                .get(field)
                .and_then(Value::as_str)
                .ok_or(DocumentError::InvalidField {
                    field,
                    expected: "a string",
                })?;
        }
        let [namespace, version, name] = parts;
        Ok(Some(uri::compose(namespace, version, name)))
    }

    /// Resolves the runtime shape of `field`.
    #[must_use]
    pub fn shape(&self, field: ShapedField) -> FieldShape<'_> {
        match self.0.get(field.key()) {
            None => FieldShape::Absent,
            Some(Value::Object(map)) => FieldShape::Map(map),
            Some(Value::Array(items)) => FieldShape::List(items),
            Some(_) => FieldShape::Invalid,
        }
    }

    /// The dialect of the document, decided by the shape of `properties`.
    #[must_use]
    pub fn dialect(&self) -> Option<Dialect> {
        self.shape(ShapedField::Properties).dialect()
    }

    /// Checks that the document is a well-formed entity and returns its identity.
    ///
    /// Requirements:
    /// - a derivable identity; when both `uri` and the triad are present they
    ///   must agree
    /// - `properties` present, as a mapping or a list of named items
    /// - `dimensions`, if present, likewise
    ///
    /// # Errors
    /// Returns the first violated requirement.
    pub fn validate(&self) -> Result<EntityUri, DocumentError> {
        let identity = self.identity()?;

        if self.0.contains_key("uri") {
            if let Some(composed) = self.composed_identity()? {
                if composed != identity.as_str() {
                    return Err(DocumentError::InconsistentIdentity {
                        uri: identity.into_string(),
                        composed,
                    });
                }
            }
        }

        match self.shape(ShapedField::Properties) {
            FieldShape::Absent => {
                return Err(DocumentError::InvalidField {
                    field: "properties",
                    expected: "present",
                })
            }
            shape => validate_shape(ShapedField::Properties, shape)?,
        }
        validate_shape(ShapedField::Dimensions, self.shape(ShapedField::Dimensions))?;

        Ok(identity)
    }

    /// Applies a partial document: every top-level field of `patch` replaces the
    /// field of the same name, other fields are kept.
    pub fn merge_from(&mut self, patch: &Self) {
        for (key, value) in &patch.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Returns a copy of the document identified under `version`.
    ///
    /// Whichever of `uri` and `version` the document carries is rewritten; the
    /// namespace and name are kept.
    ///
    /// # Errors
    /// Returns the document's identity error, or `InvalidUri` if the new
    /// identity does not parse.
    pub fn with_version(&self, version: &str) -> Result<(EntityUri, Self), DocumentError> {
        let current = self.identity()?;
        let uri = EntityUri::new(current.namespace(), version, current.name())?;

        let mut document = self.clone();
        if document.contains_key("uri") {
            document.insert("uri", Value::from(uri.as_str()));
        }
        if document.contains_key("version") {
            document.insert("version", Value::from(version));
        }
        Ok((uri, document))
    }

    /// Stable content digest (BLAKE3 over the key-sorted JSON encoding).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(&self.0).unwrap_or_default();
        blake3::hash(&encoded).to_hex().to_string()
    }
}

fn validate_shape(field: ShapedField, shape: FieldShape<'_>) -> Result<(), DocumentError> {
    match shape {
        FieldShape::Map(_) | FieldShape::Absent => Ok(()),
        FieldShape::List(items) => {
            if items
                .iter()
                .all(|item| item.get("name").is_some_and(Value::is_string))
            {
                Ok(())
            } else {
                Err(DocumentError::InvalidShape { field: field.key() })
            }
        }
        FieldShape::Invalid => Err(DocumentError::InvalidShape { field: field.key() }),
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl TryFrom<Value> for EntityDocument {
    type Error = DocumentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<EntityDocument> for Value {
    fn from(doc: EntityDocument) -> Self {
        doc.into_value()
    }
}
