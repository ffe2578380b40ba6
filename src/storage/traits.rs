//! Abstract storage contract for entity documents.
//!
//! The [`EntityStore`] trait is implemented once per storage technology. The
//! write coordinator and the search engine only ever talk to it through an
//! `Arc<dyn EntityStore>`, so backends can be swapped by configuration:
//! - In-memory backend for tests and embedded use
//! - Persistent backend for production

use std::io;

use thiserror::Error;

use crate::document::EntityDocument;
use crate::search::{RawQuery, SearchQuery};
use crate::uri::EntityUri;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An entity with this identity already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The identity carried by a document or request is malformed.
    #[error("Invalid entity URI: {0}")]
    InvalidIdentity(String),

    /// An update tried to change the identity of a stored entity.
    #[error("Entity identity cannot change: {target} -> {found}")]
    IdentityChange { target: EntityUri, found: EntityUri },

    /// A stored document has neither recognised dialect shape.
    #[error("Invalid entity {uri}: {reason}")]
    InvalidDocument { uri: String, reason: String },

    /// The query is not supported by this backend.
    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O failure in a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A lock was poisoned by a panicking writer.
    #[error("poisoned lock: {0}")]
    Poisoned(&'static str),
}

impl StorageError {
    /// Returns true if the same call might succeed later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendError(_) | Self::Io(_) | Self::Poisoned(_))
    }
}

/// Documents returned by [`EntityStore::create`].
///
/// The shape mirrors the request: one document in, [`Created::One`] out; several
/// in, [`Created::Many`] out; nothing in, [`Created::Nothing`] out. Callers use a
/// shape mismatch to detect a failed write.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Created {
    /// Nothing was requested.
    #[default]
    Nothing,
    /// Exactly one document was requested.
    One(EntityDocument),
    /// More than one document was requested.
    Many(Vec<EntityDocument>),
}

impl Created {
    /// Wraps written documents with the shape their count calls for.
    #[must_use]
    pub fn from_batch(mut documents: Vec<EntityDocument>) -> Self {
        match documents.len() {
            0 => Self::Nothing,
            1 => documents.pop().map_or(Self::Nothing, Self::One),
            _ => Self::Many(documents),
        }
    }

    /// Returns true if this shape is the one a request of `requested` documents
    /// must produce.
    #[must_use]
    pub fn mirrors(&self, requested: usize) -> bool {
        match self {
            Self::Nothing => requested == 0,
            Self::One(_) => requested == 1,
            Self::Many(docs) => requested > 1 && docs.len() == requested,
        }
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Nothing => 0,
            Self::One(_) => 1,
            Self::Many(docs) => docs.len(),
        }
    }

    /// Returns true if nothing was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens into a list of documents.
    #[must_use]
    pub fn into_vec(self) -> Vec<EntityDocument> {
        match self {
            Self::Nothing => Vec::new(),
            Self::One(doc) => vec![doc],
            Self::Many(docs) => docs,
        }
    }
}

/// Lazily produced search results.
pub type DocumentStream<'a> =
    Box<dyn Iterator<Item = Result<EntityDocument, StorageError>> + Send + 'a>;

/// Storage trait for entity documents.
///
/// # Safety Considerations
/// - Every single-document operation must be atomic
/// - Implementations must handle concurrent access across independent requests
pub trait EntityStore: Send + Sync {
    /// Short backend name used in log context.
    fn backend_name(&self) -> &'static str;

    /// Returns true if an entity with this exact identity is stored.
    fn contains(&self, uri: &EntityUri) -> Result<bool, StorageError>;

    /// Get an entity by identity.
    fn read(&self, uri: &EntityUri) -> Result<Option<EntityDocument>, StorageError>;

    /// Insert new entities.
    ///
    /// Fails with `DuplicateKey` if any identity already exists, in which case
    /// nothing is written.
    fn create(&self, documents: Vec<EntityDocument>) -> Result<Created, StorageError>;

    /// Apply `document` over the entity stored at `uri`.
    ///
    /// Top-level fields of `document` replace those of the stored record; other
    /// fields are kept. Updating an absent identity is a no-op.
    ///
    /// # Errors
    /// - `InvalidIdentity`: the document's own identity fields are malformed
    /// - `IdentityChange`: they name an identity other than `uri`
    fn update(&self, uri: &EntityUri, document: EntityDocument) -> Result<(), StorageError>;

    /// Remove entities. Absent identities are silently skipped.
    fn delete(&self, uris: &[EntityUri]) -> Result<(), StorageError>;

    /// Inclusive search; see [`SearchQuery`] for the union semantics.
    fn search(&self, query: &SearchQuery) -> Result<DocumentStream<'_>, StorageError>;

    /// Count stored entities, optionally restricted by a raw query.
    fn count(&self, raw: Option<&RawQuery>) -> Result<usize, StorageError>;
}

/// Checks the identity an update payload declares against its target.
///
/// Shared by the bundled backends so both reject identity changes the same way.
pub(crate) fn check_update_identity(
    target: &EntityUri,
    document: &EntityDocument,
) -> Result<(), StorageError> {
    let conflict = document
        .identity_conflict(target)
        .map_err(|e| StorageError::InvalidIdentity(e.to_string()))?;

    match conflict {
        None => Ok(()),
        Some(actual) => match EntityUri::parse(&actual) {
            Ok(found) => Err(StorageError::IdentityChange {
                target: target.clone(),
                found,
            }),
            Err(_) => Err(StorageError::InvalidIdentity(actual)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Compile-time test: ensure the trait is object-safe
    fn _assert_entity_store_object_safe(_: &dyn EntityStore) {}

    fn doc(name: &str) -> EntityDocument {
        EntityDocument::from_value(json!({
            "uri": format!("http://x.org/0.1/{name}"),
            "properties": {},
        }))
        .unwrap()
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::DuplicateKey("http://x.org/0.1/Box".to_string());
        assert!(err.to_string().contains("Duplicate key"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_created_mirrors_request_arity() {
        assert_eq!(Created::from_batch(Vec::new()), Created::Nothing);
        assert!(Created::Nothing.mirrors(0));

        let one = Created::from_batch(vec![doc("A")]);
        assert!(matches!(one, Created::One(_)));
        assert!(one.mirrors(1));
        assert!(!one.mirrors(2));

        let many = Created::from_batch(vec![doc("A"), doc("B")]);
        assert!(many.mirrors(2));
        assert!(!many.mirrors(1));
        assert!(!many.mirrors(3));
        assert_eq!(many.into_vec().len(), 2);
    }

    #[test]
    fn test_check_update_identity() {
        let target = EntityUri::parse("http://x.org/0.1/A").unwrap();
        assert!(check_update_identity(&target, &doc("A")).is_ok());
        assert!(matches!(
            check_update_identity(&target, &doc("B")),
            Err(StorageError::IdentityChange { .. })
        ));

        let anonymous = EntityDocument::from_value(json!({"description": "x"})).unwrap();
        assert!(check_update_identity(&target, &anonymous).is_ok());

        let malformed = EntityDocument::from_value(json!({"uri": "http://x.org/A/0.1"})).unwrap();
        assert!(matches!(
            check_update_identity(&target, &malformed),
            Err(StorageError::InvalidIdentity(_))
        ));

        let renamed = EntityDocument::from_value(json!({
            "uri": "http://x.org/0.1/A",
            "version": "0.2",
        }))
        .unwrap();
        assert!(matches!(
            check_update_identity(&target, &renamed),
            Err(StorageError::IdentityChange { ref found, .. }) if found.version() == "0.2"
        ));

        let same_version = EntityDocument::from_value(json!({"version": "0.1"})).unwrap();
        assert!(check_update_identity(&target, &same_version).is_ok());
    }
}
