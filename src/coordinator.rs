//! Create, replace, patch and delete against an injected store.
//!
//! Every operation validates its input completely before the first store call,
//! so a validation, conflict or not-found error means nothing was written. Once
//! the store has been touched, any failure is logged with every identity of the
//! request and reported as one [`RegistryError::WriteFailure`]. Batches are not
//! transactional; the failure carries an [`Application`] saying what is known to
//! have been applied.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::document::EntityDocument;
use crate::error::{
    join, Application, ConflictError, RegistryError, RegistryResult, ValidationError,
    WriteOperation,
};
use crate::storage::{Created, EntityStore, StorageError};
use crate::uri::{self, EntityUri};

/// Outcome of a create-or-replace request.
#[derive(Debug, Clone, PartialEq)]
pub enum Replaced {
    /// Some documents were new; these are the created ones.
    Created(Created),
    /// Every document replaced an existing entity.
    NoContent,
}

impl Replaced {
    /// Returns true if nothing was created.
    #[must_use]
    pub fn is_no_content(&self) -> bool {
        matches!(self, Self::NoContent)
    }
}

/// Parses caller-supplied identities, failing on the first malformed one.
///
/// # Errors
/// Returns `Validation(InvalidUri)` naming the offending string.
pub fn parse_identities<I, S>(candidates: I) -> RegistryResult<Vec<EntityUri>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Ok(uri::parse_all(candidates)?)
}

/// Store errors that mean the store refused the write before applying any of it.
fn rejected_outright(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::DuplicateKey(_)
            | StorageError::InvalidIdentity(_)
            | StorageError::IdentityChange { .. }
            | StorageError::InvalidDocument { .. }
            | StorageError::UnsupportedQuery(_)
    )
}

fn application_after(err: Option<&StorageError>, applied: Vec<EntityUri>) -> Application {
    if !applied.is_empty() {
        return Application::Partial { applied };
    }
    match err {
        Some(e) if rejected_outright(e) => Application::NotApplied,
        _ => Application::Unknown,
    }
}

fn validate_batch(documents: &[EntityDocument]) -> RegistryResult<Vec<EntityUri>> {
    documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            doc.validate().map_err(|source| {
                ValidationError::InvalidDocument {
                    index: Some(i),
                    source,
                }
                .into()
            })
        })
        .collect()
}

fn identify_batch(patches: &[EntityDocument]) -> RegistryResult<Vec<EntityUri>> {
    patches
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            doc.identity().map_err(|source| {
                ValidationError::InvalidDocument {
                    index: Some(i),
                    source,
                }
                .into()
            })
        })
        .collect()
}

fn mismatch(expected: &EntityUri, actual: EntityUri) -> RegistryError {
    ConflictError::IdentityMismatch {
        expected: expected.clone(),
        actual: actual.into_string(),
    }
    .into()
}

/// Rejects a patch whose identity fields would move the entity off `target`.
fn check_patch_identity(
    index: Option<usize>,
    target: &EntityUri,
    patch: &EntityDocument,
) -> RegistryResult<()> {
    let conflict = patch
        .identity_conflict(target)
        .map_err(|source| ValidationError::InvalidDocument { index, source })?;
    match conflict {
        None => Ok(()),
        Some(actual) => {
            warn!(uri = %target, %actual, "patch would change the identity of an entity");
            Err(ConflictError::IdentityMismatch {
                expected: target.clone(),
                actual,
            }
            .into())
        }
    }
}

/// Applies write requests to one store.
#[derive(Clone)]
pub struct WriteCoordinator {
    store: Arc<dyn EntityStore>,
}

impl std::fmt::Debug for WriteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoordinator")
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

impl WriteCoordinator {
    /// Creates a coordinator writing to `store`.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use entities_registry::{EntityStore, InMemoryEntityStore, WriteCoordinator};
    ///
    /// let writes = WriteCoordinator::new(Arc::new(InMemoryEntityStore::new()));
    /// assert_eq!(writes.store().backend_name(), "memory");
    /// ```
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// The store writes go to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    fn failure(
        &self,
        operation: WriteOperation,
        uris: Vec<EntityUri>,
        applied: Application,
        source: Option<StorageError>,
    ) -> RegistryError {
        error!(
            backend = self.store.backend_name(),
            %operation,
            uris = %join(&uris),
            applied = ?applied,
            error = ?source,
            "could not {operation} entities"
        );
        RegistryError::WriteFailure {
            operation,
            uris,
            applied,
            source,
        }
    }

    fn contains_all(
        &self,
        operation: WriteOperation,
        uris: &[EntityUri],
    ) -> RegistryResult<Vec<bool>> {
        uris.iter()
            .map(|uri| self.store.contains(uri))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.failure(operation, uris.to_vec(), Application::NotApplied, Some(e)))
    }

    /// Creates a batch of new entities.
    ///
    /// An empty batch returns [`Created::Nothing`] without calling the store.
    ///
    /// # Errors
    /// - `Validation` if any document is malformed (nothing is written)
    /// - `WriteFailure` if the store fails or returns a result whose arity does not
    ///   mirror the request
    pub fn create_many(&self, documents: Vec<EntityDocument>) -> RegistryResult<Created> {
        if documents.is_empty() {
            return Ok(Created::Nothing);
        }

        let uris = validate_batch(&documents)?;
        let requested = documents.len();

        match self.store.create(documents) {
            Ok(created) if created.mirrors(requested) => {
                debug!(count = requested, uris = %join(&uris), "created entities");
                Ok(created)
            }
            Ok(created) => {
                warn!(
                    requested,
                    returned = created.len(),
                    "store result does not mirror the create request"
                );
                Err(self.failure(WriteOperation::Create, uris, Application::Unknown, None))
            }
            Err(e) => {
                let applied = application_after(Some(&e), Vec::new());
                Err(self.failure(WriteOperation::Create, uris, applied, Some(e)))
            }
        }
    }

    /// Creates one entity addressed by `target`.
    ///
    /// The document is written as a batch of one; `target` is checked against
    /// what the store returns, so a document naming another identity is stored
    /// under that identity and reported as a failure.
    ///
    /// # Errors
    /// - `Validation` if the document is malformed
    /// - `WriteFailure` if the store fails or does not return an entity with
    ///   identity `target`
    pub fn create_one(
        &self,
        target: &EntityUri,
        document: EntityDocument,
    ) -> RegistryResult<EntityDocument> {
        let identity = document.validate()?;
        if &identity != target {
            debug!(uri = %target, found = %identity, "document names another identity");
        }
        self.create_single(WriteOperation::Create, target, document)
    }

    fn create_single(
        &self,
        operation: WriteOperation,
        target: &EntityUri,
        document: EntityDocument,
    ) -> RegistryResult<EntityDocument> {
        match self.store.create(vec![document]) {
            Ok(Created::One(created))
                if created.identity().is_ok_and(|found| &found == target) =>
            {
                debug!(uri = %target, "created entity");
                Ok(created)
            }
            Ok(_) => Err(self.failure(
                operation,
                vec![target.clone()],
                Application::Unknown,
                None,
            )),
            Err(e) => {
                let applied = application_after(Some(&e), Vec::new());
                Err(self.failure(operation, vec![target.clone()], applied, Some(e)))
            }
        }
    }

    /// Creates the documents that are new and replaces the ones that exist.
    ///
    /// New documents go through the create path in one call; existing ones are
    /// updated one at a time in request order. The first failure stops the batch.
    ///
    /// # Errors
    /// - `Validation` if any document is malformed (nothing is written)
    /// - `WriteFailure` naming every identity of the request
    pub fn replace_many(&self, documents: Vec<EntityDocument>) -> RegistryResult<Replaced> {
        if documents.is_empty() {
            return Ok(Replaced::NoContent);
        }

        let uris = validate_batch(&documents)?;
        let present = self.contains_all(WriteOperation::Replace, &uris)?;

        let mut fresh = Vec::new();
        let mut fresh_uris = Vec::new();
        let mut existing = Vec::new();
        for ((uri, doc), exists) in uris.iter().zip(documents).zip(present) {
            if exists {
                existing.push((uri.clone(), doc));
            } else {
                fresh_uris.push(uri.clone());
                fresh.push(doc);
            }
        }

        let created = if fresh.is_empty() {
            None
        } else {
            let requested = fresh.len();
            match self.store.create(fresh) {
                Ok(created) if created.mirrors(requested) => Some(created),
                Ok(_) => {
                    return Err(self.failure(
                        WriteOperation::Replace,
                        uris,
                        Application::Unknown,
                        None,
                    ))
                }
                Err(e) => {
                    let applied = application_after(Some(&e), Vec::new());
                    return Err(self.failure(WriteOperation::Replace, uris, applied, Some(e)));
                }
            }
        };

        let mut applied = fresh_uris;
        for (uri, doc) in existing {
            if let Err(e) = self.store.update(&uri, doc) {
                let applied = application_after(Some(&e), applied);
                return Err(self.failure(WriteOperation::Replace, uris, applied, Some(e)));
            }
            applied.push(uri);
        }

        debug!(count = applied.len(), uris = %join(&applied), "replaced entities");
        Ok(created.map_or(Replaced::NoContent, Replaced::Created))
    }

    /// Creates or replaces the entity addressed by `target`.
    ///
    /// # Errors
    /// - `Validation` if the document is malformed
    /// - `Conflict(IdentityMismatch)` before any store call if the document names
    ///   another identity
    /// - `WriteFailure` if the store fails
    pub fn replace_one(
        &self,
        target: &EntityUri,
        document: EntityDocument,
    ) -> RegistryResult<Replaced> {
        let identity = document.validate()?;
        if &identity != target {
            return Err(mismatch(target, identity));
        }

        let exists = self
            .store
            .contains(target)
            .map_err(|e| {
                self.failure(
                    WriteOperation::Replace,
                    vec![target.clone()],
                    Application::NotApplied,
                    Some(e),
                )
            })?;

        if !exists {
            let created = self.create_single(WriteOperation::Replace, target, document)?;
            return Ok(Replaced::Created(Created::One(created)));
        }

        self.store.update(target, document).map_err(|e| {
            let applied = application_after(Some(&e), Vec::new());
            self.failure(WriteOperation::Replace, vec![target.clone()], applied, Some(e))
        })?;
        debug!(uri = %target, "replaced entity");
        Ok(Replaced::NoContent)
    }

    /// Merges each partial document into the entity it names.
    ///
    /// All targets must exist; if any is missing nothing is patched. Identity
    /// fields of a payload must all agree with the identity it declares.
    ///
    /// # Errors
    /// - `Validation` if a payload has no derivable identity
    /// - `Conflict(IdentityMismatch)` if a payload's `uri` and triad disagree
    /// - `NotFound` listing the missing targets
    /// - `WriteFailure` naming every identity of the request
    pub fn patch_many(&self, patches: Vec<EntityDocument>) -> RegistryResult<()> {
        if patches.is_empty() {
            return Ok(());
        }

        let uris = identify_batch(&patches)?;
        for (i, (uri, patch)) in uris.iter().zip(&patches).enumerate() {
            check_patch_identity(Some(i), uri, patch)?;
        }
        let present = self.contains_all(WriteOperation::Patch, &uris)?;

        let missing: Vec<EntityUri> = uris
            .iter()
            .zip(&present)
            .filter(|(_, exists)| !**exists)
            .map(|(uri, _)| uri.clone())
            .collect();
        if !missing.is_empty() {
            warn!(uris = %join(&missing), "cannot patch entities that do not exist");
            return Err(RegistryError::NotFound { uris: missing });
        }

        let mut applied = Vec::with_capacity(uris.len());
        for (uri, patch) in uris.iter().zip(patches) {
            if let Err(e) = self.store.update(uri, patch) {
                let applied = application_after(Some(&e), applied);
                return Err(self.failure(WriteOperation::Patch, uris.clone(), applied, Some(e)));
            }
            applied.push(uri.clone());
        }

        debug!(count = applied.len(), uris = %join(&applied), "patched entities");
        Ok(())
    }

    /// Merges `patch` into the entity addressed by `target`.
    ///
    /// # Errors
    /// - `Conflict(IdentityMismatch)` if any of `uri`, `namespace`, `version` or
    ///   `name` in the payload differs from `target`
    /// - `Validation` if one of those fields is not a string
    /// - `NotFound` if `target` does not exist
    /// - `WriteFailure` if the store fails
    pub fn patch_one(&self, target: &EntityUri, patch: EntityDocument) -> RegistryResult<()> {
        check_patch_identity(None, target, &patch)?;

        let exists = self.store.contains(target).map_err(|e| {
            self.failure(
                WriteOperation::Patch,
                vec![target.clone()],
                Application::NotApplied,
                Some(e),
            )
        })?;
        if !exists {
            warn!(uri = %target, "cannot patch an entity that does not exist");
            return Err(RegistryError::not_found(target.clone()));
        }

        self.store.update(target, patch).map_err(|e| {
            let applied = application_after(Some(&e), Vec::new());
            self.failure(WriteOperation::Patch, vec![target.clone()], applied, Some(e))
        })?;
        debug!(uri = %target, "patched entity");
        Ok(())
    }

    /// Deletes a set of entities and returns their identities in sorted order.
    ///
    /// Duplicates collapse. Identities that are not stored are skipped by the
    /// store but still listed.
    ///
    /// # Errors
    /// - `Conflict(EmptyIdentitySet)` if no identity is given
    /// - `WriteFailure` if the store fails
    pub fn delete_many<I>(&self, identities: I) -> RegistryResult<Vec<EntityUri>>
    where
        I: IntoIterator<Item = EntityUri>,
    {
        let sorted: Vec<EntityUri> = identities
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if sorted.is_empty() {
            return Err(ConflictError::EmptyIdentitySet.into());
        }

        if let Err(e) = self.store.delete(&sorted) {
            let applied = application_after(Some(&e), Vec::new());
            return Err(self.failure(WriteOperation::Delete, sorted, applied, Some(e)));
        }

        debug!(count = sorted.len(), uris = %join(&sorted), "deleted entities");
        Ok(sorted)
    }

    /// [`Self::delete_many`] over unparsed identities.
    ///
    /// # Errors
    /// `Validation(InvalidUri)` before any store call if a string is malformed,
    /// otherwise as [`Self::delete_many`].
    pub fn delete_many_str<I, S>(&self, identities: I) -> RegistryResult<Vec<EntityUri>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.delete_many(parse_identities(identities)?)
    }

    /// Deletes the entity addressed by `target`.
    ///
    /// # Errors
    /// - `NotFound` if `target` does not exist
    /// - `WriteFailure` if the store fails
    pub fn delete_one(&self, target: &EntityUri) -> RegistryResult<EntityUri> {
        let exists = self.store.contains(target).map_err(|e| {
            self.failure(
                WriteOperation::Delete,
                vec![target.clone()],
                Application::NotApplied,
                Some(e),
            )
        })?;
        if !exists {
            return Err(RegistryError::not_found(target.clone()));
        }

        self.store.delete(std::slice::from_ref(target)).map_err(|e| {
            let applied = application_after(Some(&e), Vec::new());
            self.failure(WriteOperation::Delete, vec![target.clone()], applied, Some(e))
        })?;
        debug!(uri = %target, "deleted entity");
        Ok(target.clone())
    }
}
