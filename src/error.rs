//! Error types for the entities registry.
//!
//! All errors are strongly typed using thiserror. Local validation errors
//! (malformed identities, identity conflicts, missing targets) are raised before
//! any store call and therefore guarantee zero side effects. Failures at the
//! store boundary during a write are aggregated into one [`RegistryError::WriteFailure`]
//! per request.

use std::fmt;

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::document::DocumentError;
use crate::storage::StorageError;
use crate::uri::{EntityUri, UriError};

/// Client input that failed validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    InvalidUri(#[from] UriError),

    #[error("Invalid entity document{}: {source}", at_index(*index))]
    InvalidDocument {
        index: Option<usize>,
        source: DocumentError,
    },
}

fn at_index(index: Option<usize>) -> String {
    index.map_or_else(String::new, |i| format!(" at position {i}"))
}

impl From<DocumentError> for ValidationError {
    fn from(source: DocumentError) -> Self {
        Self::InvalidDocument {
            index: None,
            source,
        }
    }
}

/// Requests that contradict themselves.
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Entity identity mismatch: uri={expected} != {actual}")]
    IdentityMismatch { expected: EntityUri, actual: String },

    #[error("No entity identities provided")]
    EmptyIdentitySet,
}

/// The write operation a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOperation {
    /// Creation of new entities.
    Create,
    /// Create-or-replace.
    Replace,
    /// Partial update of existing entities.
    Patch,
    /// Removal of entities.
    Delete,
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Create => "create",
            Self::Replace => "put/update",
            Self::Patch => "patch/update",
            Self::Delete => "delete",
        };
        f.write_str(verb)
    }
}

/// What is known to have been applied when a batched write fails.
///
/// Batches are not transactional: a failure partway leaves earlier effects in
/// place. Callers should re-query the store to learn the actual state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Application {
    /// Nothing was written.
    NotApplied,
    /// At least these identities were written before the failure; the state of
    /// the failing identity is unknown.
    Partial {
        /// Identities known to have been written.
        applied: Vec<EntityUri>,
    },
    /// Any subset of the batch may have been written.
    Unknown,
}

/// Top-level error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Could not find entit{}: uri{}={}", plural_entity(uris.len()), plural_s(uris.len()), join(uris))]
    NotFound { uris: Vec<EntityUri> },

    #[error("Could not {operation} entit{} with uri{}: {}", plural_entity(uris.len()), plural_s(uris.len()), join(uris))]
    WriteFailure {
        operation: WriteOperation,
        uris: Vec<EntityUri>,
        applied: Application,
        #[source]
        source: Option<crate::storage::StorageError>,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

fn plural_entity(n: usize) -> &'static str {
    if n == 1 {
        "y"
    } else {
        "ies"
    }
}

fn plural_s(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

pub(crate) fn join(uris: &[EntityUri]) -> String {
    uris.iter()
        .map(EntityUri::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<UriError> for RegistryError {
    fn from(err: UriError) -> Self {
        Self::Validation(ValidationError::InvalidUri(err))
    }
}

impl From<DocumentError> for RegistryError {
    fn from(err: DocumentError) -> Self {
        Self::Validation(err.into())
    }
}

impl RegistryError {
    /// Creates a not-found error for a single identity.
    #[must_use]
    pub fn not_found(uri: EntityUri) -> Self {
        Self::NotFound { uris: vec![uri] }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a conflict error.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is an aggregated write failure.
    #[must_use]
    pub const fn is_write_failure(&self) -> bool {
        matches!(self, Self::WriteFailure { .. })
    }

    /// Returns true if the caller sent something wrong.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Conflict(_) | Self::NotFound { .. } | Self::Unauthorized(_)
        )
    }

    /// Returns true if retrying the same request might succeed.
    ///
    /// The registry itself never retries.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WriteFailure { source, .. } => source.as_ref().map_or(true, StorageError::is_transient),
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> EntityUri {
        EntityUri::parse(s).unwrap()
    }

    #[test]
    fn test_write_failure_message_single() {
        let err = RegistryError::WriteFailure {
            operation: WriteOperation::Create,
            uris: vec![uri("http://x.org/0.1/Box")],
            applied: Application::Unknown,
            source: None,
        };
        assert_eq!(
            err.to_string(),
            "Could not create entity with uri: http://x.org/0.1/Box"
        );
        assert!(err.is_write_failure());
        assert!(!err.is_client_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_write_failure_message_many() {
        let err = RegistryError::WriteFailure {
            operation: WriteOperation::Patch,
            uris: vec![uri("http://x.org/0.1/Box"), uri("http://x.org/0.1/Ball")],
            applied: Application::NotApplied,
            source: Some(StorageError::DuplicateKey("http://x.org/0.1/Box".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Could not patch/update entities with uris:"));
        assert!(msg.contains("http://x.org/0.1/Ball"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found() {
        let err = RegistryError::not_found(uri("http://x.org/0.1/Box"));
        assert!(err.is_not_found());
        assert!(err.is_client_error());
        assert!(err.to_string().contains("uri=http://x.org/0.1/Box"));
    }

    #[test]
    fn test_from_uri_error_is_validation() {
        let err: RegistryError = EntityUri::parse("nope").unwrap_err().into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_document_position() {
        let err = ValidationError::InvalidDocument {
            index: Some(2),
            source: DocumentError::MissingIdentity,
        };
        assert!(err.to_string().contains("at position 2"));
    }

    #[test]
    fn test_conflict_messages() {
        let err: RegistryError = ConflictError::IdentityMismatch {
            expected: uri("http://x.org/0.1/Box"),
            actual: "http://x.org/0.2/Box".to_string(),
        }
        .into();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("http://x.org/0.1/Box != http://x.org/0.2/Box"));

        let err: RegistryError = ConflictError::EmptyIdentitySet.into();
        assert!(err.is_client_error());
    }
}
