//! # Entities Registry
//!
//! A registry of versioned entity schema documents addressed by canonical URIs
//! of the form `<namespace>/<version>/<name>`.
//!
//! ## Core Concepts
//!
//! - **EntityUri**: the canonical identity, parsed with one strict grammar
//! - **EntityDocument**: a JSON entity in either dialect (property map or
//!   property list), told apart by the runtime shape of `properties`
//! - **EntityStore**: the storage contract, with in-memory and persistent
//!   backends
//! - **WriteCoordinator**: create/replace/patch/delete with pre-flight checks and
//!   aggregated write failures
//! - **SearchQuery**: inclusive (union) search by property, dimension and
//!   identity
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entities_registry::{Credentials, EntityDocument, Registry, SearchQuery};
//! use serde_json::json;
//!
//! let registry = Registry::in_memory();
//! let entity = EntityDocument::from_value(json!({
//!     "uri": "http://onto-ns.com/meta/0.1/Box",
//!     "properties": {"length": {"type": "float"}},
//! }))?;
//! registry.create(&Credentials::anonymous(), vec![entity])?;
//!
//! let boxes = registry.search(&SearchQuery::new().with_property("length"))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Identity and documents
pub mod document;
pub mod error;
pub mod uri;

// Storage, writes and search
pub mod coordinator;
pub mod search;
pub mod storage;

// Plumbing
pub mod auth;
pub mod config;
pub mod registry;
pub mod upload;

// Re-export primary types at crate root for convenience
pub use auth::{AccessVerifier, AllowAll, AuthError, Credentials, StaticTokenVerifier};
pub use config::{open_store, BackendKind, ConfigError, ConfigOverrides, RegistryConfig};
pub use coordinator::{parse_identities, Replaced, WriteCoordinator};
pub use document::{Dialect, DocumentError, EntityDocument, FieldShape, ShapedField};
pub use error::{
    Application, ConflictError, RegistryError, RegistryResult, ValidationError, WriteOperation,
};
pub use registry::Registry;
pub use search::{RawQuery, SearchEngine, SearchQuery, SearchResults, Snapshot};
pub use storage::memory::InMemoryEntityStore;
pub use storage::{Created, DocumentStream, EntityStore, StorageError};
pub use uri::{is_valid_uri, is_valid_version, EntityUri, UriError, URI_PATTERN};

#[cfg(feature = "persistent")]
pub use storage::persistent::{open_database, PersistentConfig, PersistentEntityStore};
