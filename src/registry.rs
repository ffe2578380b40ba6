//! The registry facade.
//!
//! [`Registry`] bundles one store with the write coordinator, the search engine
//! and an access verifier. Reads are open; every write verifies credentials
//! first. Entry points that take identities as strings parse them before doing
//! anything else.

use std::sync::Arc;

use tracing::warn;

use crate::auth::{AccessVerifier, AllowAll, Credentials};
use crate::config::{open_store, RegistryConfig};
use crate::coordinator::{parse_identities, Replaced, WriteCoordinator};
use crate::document::EntityDocument;
use crate::error::RegistryResult;
use crate::search::{RawQuery, SearchEngine, SearchQuery};
use crate::storage::memory::InMemoryEntityStore;
use crate::storage::{Created, DocumentStream, EntityStore};
use crate::uri::EntityUri;

/// A registry of entity documents over one store.
#[derive(Clone)]
pub struct Registry {
    verifier: Arc<dyn AccessVerifier>,
    coordinator: WriteCoordinator,
    search: SearchEngine,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.coordinator.store().backend_name())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates a registry over `store` guarded by `verifier`.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, verifier: Arc<dyn AccessVerifier>) -> Self {
        Self {
            verifier,
            coordinator: WriteCoordinator::new(store.clone()),
            search: SearchEngine::new(store),
        }
    }

    /// An unguarded registry over a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryEntityStore::new()), Arc::new(AllowAll))
    }

    /// Opens the configured store and verifier.
    ///
    /// # Errors
    /// Returns the error of [`open_store`].
    pub fn open(config: &RegistryConfig) -> RegistryResult<Self> {
        let store = open_store(config)?;
        Ok(Self::new(store, config.verifier()))
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        self.coordinator.store()
    }

    fn authorize(&self, credentials: &Credentials) -> RegistryResult<()> {
        self.verifier.verify(credentials).map_err(|err| {
            warn!(error = %err, "write access denied");
            err.into()
        })
    }

    fn parse(target: &str) -> RegistryResult<EntityUri> {
        Ok(EntityUri::parse(target)?)
    }

    // Reads

    /// Reads one entity.
    ///
    /// # Errors
    /// `Validation` for a malformed identity, `NotFound` if it is absent.
    pub fn get(&self, identity: &str) -> RegistryResult<EntityDocument> {
        self.search.get(&Self::parse(identity)?)
    }

    /// Collects every match of `query`; see [`SearchQuery`] for the semantics.
    ///
    /// # Errors
    /// `NotFound` if nothing matches, `Storage` on an invalid stored document.
    pub fn search(&self, query: &SearchQuery) -> RegistryResult<Vec<EntityDocument>> {
        self.search.search(query)
    }

    /// Lazily streams the matches of `query`.
    ///
    /// # Errors
    /// Returns the store's error for invalid queries.
    pub fn stream(&self, query: &SearchQuery) -> RegistryResult<DocumentStream<'_>> {
        self.search.stream(query)
    }

    /// Counts stored entities, optionally restricted by a raw query.
    ///
    /// # Errors
    /// Returns the store's error.
    pub fn count(&self, raw: Option<&RawQuery>) -> RegistryResult<usize> {
        self.search.count(raw)
    }

    // Writes

    /// See [`WriteCoordinator::create_many`].
    ///
    /// # Errors
    /// `Unauthorized`, or the coordinator's error.
    pub fn create(
        &self,
        credentials: &Credentials,
        documents: Vec<EntityDocument>,
    ) -> RegistryResult<Created> {
        self.authorize(credentials)?;
        self.coordinator.create_many(documents)
    }

    /// See [`WriteCoordinator::create_one`].
    ///
    /// # Errors
    /// `Unauthorized`, `Validation` for a malformed target, or the coordinator's
    /// error.
    pub fn create_one(
        &self,
        credentials: &Credentials,
        target: &str,
        document: EntityDocument,
    ) -> RegistryResult<EntityDocument> {
        self.authorize(credentials)?;
        self.coordinator.create_one(&Self::parse(target)?, document)
    }

    /// See [`WriteCoordinator::replace_many`].
    ///
    /// # Errors
    /// `Unauthorized`, or the coordinator's error.
    pub fn replace(
        &self,
        credentials: &Credentials,
        documents: Vec<EntityDocument>,
    ) -> RegistryResult<Replaced> {
        self.authorize(credentials)?;
        self.coordinator.replace_many(documents)
    }

    /// See [`WriteCoordinator::replace_one`].
    ///
    /// # Errors
    /// `Unauthorized`, `Validation` for a malformed target, or the coordinator's
    /// error.
    pub fn replace_one(
        &self,
        credentials: &Credentials,
        target: &str,
        document: EntityDocument,
    ) -> RegistryResult<Replaced> {
        self.authorize(credentials)?;
        self.coordinator.replace_one(&Self::parse(target)?, document)
    }

    /// See [`WriteCoordinator::patch_many`].
    ///
    /// # Errors
    /// `Unauthorized`, or the coordinator's error.
    pub fn patch(
        &self,
        credentials: &Credentials,
        patches: Vec<EntityDocument>,
    ) -> RegistryResult<()> {
        self.authorize(credentials)?;
        self.coordinator.patch_many(patches)
    }

    /// See [`WriteCoordinator::patch_one`].
    ///
    /// # Errors
    /// `Unauthorized`, `Validation` for a malformed target, or the coordinator's
    /// error.
    pub fn patch_one(
        &self,
        credentials: &Credentials,
        target: &str,
        patch: EntityDocument,
    ) -> RegistryResult<()> {
        self.authorize(credentials)?;
        self.coordinator.patch_one(&Self::parse(target)?, patch)
    }

    /// See [`WriteCoordinator::delete_many`].
    ///
    /// # Errors
    /// `Unauthorized`, `Validation` if any identity is malformed, or the
    /// coordinator's error.
    pub fn delete<I, S>(&self, credentials: &Credentials, identities: I) -> RegistryResult<Vec<EntityUri>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.authorize(credentials)?;
        self.coordinator.delete_many(parse_identities(identities)?)
    }

    /// See [`WriteCoordinator::delete_one`].
    ///
    /// # Errors
    /// `Unauthorized`, `Validation` for a malformed target, or the coordinator's
    /// error.
    pub fn delete_one(&self, credentials: &Credentials, target: &str) -> RegistryResult<EntityUri> {
        self.authorize(credentials)?;
        self.coordinator.delete_one(&Self::parse(target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, StaticTokenVerifier};
    use crate::error::RegistryError;
    use serde_json::json;

    fn entity(name: &str) -> EntityDocument {
        EntityDocument::from_value(json!({
            "uri": format!("http://x.org/0.1/{name}"),
            "properties": {"length": {"type": "float"}},
        }))
        .unwrap()
    }

    fn guarded() -> Registry {
        Registry::new(
            Arc::new(InMemoryEntityStore::new()),
            Arc::new(StaticTokenVerifier::new("s3cret")),
        )
    }

    #[test]
    fn test_writes_require_credentials() {
        let registry = guarded();

        let err = registry
            .create(&Credentials::anonymous(), vec![entity("A")])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Unauthorized(AuthError::MissingCredentials)
        ));

        let err = registry
            .delete(&Credentials::bearer("wrong"), ["http://x.org/0.1/A"])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Unauthorized(AuthError::InvalidCredentials)
        ));
        assert_eq!(registry.count(None).unwrap(), 0);

        registry
            .create(&Credentials::bearer("s3cret"), vec![entity("A")])
            .unwrap();
        assert_eq!(registry.count(None).unwrap(), 1);
    }

    #[test]
    fn test_reads_are_open() {
        let registry = guarded();
        registry
            .create(&Credentials::bearer("s3cret"), vec![entity("A")])
            .unwrap();

        assert_eq!(registry.get("http://x.org/0.1/A").unwrap(), entity("A"));
        assert!(registry.get("http://x.org/0.1/B").unwrap_err().is_not_found());
        assert!(registry.get("http://x.org/A").unwrap_err().is_validation());
    }

    #[test]
    fn test_string_targets_are_parsed() {
        let registry = Registry::in_memory();
        let creds = Credentials::anonymous();

        let err = registry
            .create_one(&creds, "not a uri", entity("A"))
            .unwrap_err();
        assert!(err.is_validation());

        registry
            .create_one(&creds, "http://x.org/0.1/A", entity("A"))
            .unwrap();
        registry
            .patch_one(
                &creds,
                "http://x.org/0.1/A",
                EntityDocument::from_value(json!({"description": "patched"})).unwrap(),
            )
            .unwrap();
        assert!(registry
            .replace_one(&creds, "http://x.org/0.1/A", entity("A"))
            .unwrap()
            .is_no_content());
        assert_eq!(
            registry.delete_one(&creds, "http://x.org/0.1/A").unwrap().as_str(),
            "http://x.org/0.1/A"
        );
    }
}
