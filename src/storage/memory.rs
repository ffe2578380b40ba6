//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of [`EntityStore`].
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::document::EntityDocument;
use crate::search::{RawQuery, SearchQuery, Snapshot};
use crate::storage::traits::{
    check_update_identity, Created, DocumentStream, EntityStore, StorageError,
};
use crate::uri::EntityUri;

/// Records in insertion order plus an index by canonical identity.
///
/// Shared with the persistent backend, which keeps the same structure in memory
/// and replays its log into it.
#[derive(Debug, Default, Clone)]
pub(crate) struct EntityIndex {
    records: Vec<(EntityUri, Arc<EntityDocument>)>,
    by_uri: HashMap<EntityUri, usize>,
}

impl EntityIndex {
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn contains(&self, uri: &EntityUri) -> bool {
        self.by_uri.contains_key(uri)
    }

    pub(crate) fn get(&self, uri: &EntityUri) -> Option<&EntityDocument> {
        self.by_uri
            .get(uri)
            .and_then(|&i| self.records.get(i))
            .map(|(_, doc)| doc.as_ref())
    }

    pub(crate) fn documents(&self) -> impl Iterator<Item = &EntityDocument> {
        self.records.iter().map(|(_, doc)| doc.as_ref())
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.records.clone())
    }

    /// Derives identities for a create batch and rejects duplicates, both
    /// against stored records and within the batch.
    pub(crate) fn prepare_create(
        &self,
        documents: &[EntityDocument],
    ) -> Result<Vec<EntityUri>, StorageError> {
        let mut seen = HashSet::with_capacity(documents.len());
        documents
            .iter()
            .map(|doc| {
                let uri = doc
                    .identity()
                    .map_err(|e| StorageError::InvalidIdentity(e.to_string()))?;
                if self.contains(&uri) || !seen.insert(uri.clone()) {
                    return Err(StorageError::DuplicateKey(uri.into_string()));
                }
                Ok(uri)
            })
            .collect()
    }

    pub(crate) fn insert_all(&mut self, uris: Vec<EntityUri>, documents: Vec<EntityDocument>) {
        for (uri, doc) in uris.into_iter().zip(documents) {
            self.by_uri.insert(uri.clone(), self.records.len());
            self.records.push((uri, Arc::new(doc)));
        }
    }

    /// Merges `patch` over the record at `uri`. Returns false if absent.
    pub(crate) fn apply_update(&mut self, uri: &EntityUri, patch: &EntityDocument) -> bool {
        let Some(&i) = self.by_uri.get(uri) else {
            return false;
        };
        let Some((_, slot)) = self.records.get_mut(i) else {
            return false;
        };

        let mut merged = slot.as_ref().clone();
        merged.merge_from(patch);
        *slot = Arc::new(merged);
        true
    }

    /// Removes every listed identity. Returns how many were present.
    pub(crate) fn remove_all(&mut self, uris: &[EntityUri]) -> usize {
        let doomed: HashSet<&EntityUri> = uris.iter().filter(|u| self.contains(u)).collect();
        if doomed.is_empty() {
            return 0;
        }

        self.records.retain(|(uri, _)| !doomed.contains(uri));
        self.by_uri = self
            .records
            .iter()
            .enumerate()
            .map(|(i, (uri, _))| (uri.clone(), i))
            .collect();
        doomed.len()
    }
}

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Poisoned(context)
}

/// Thread-safe in-memory entity store.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    state: RwLock<EntityIndex>,
}

impl InMemoryEntityStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `documents`, in order.
    ///
    /// # Errors
    /// Fails like [`EntityStore::create`] on malformed or duplicate identities.
    pub fn with_documents(documents: Vec<EntityDocument>) -> Result<Self, StorageError> {
        let store = Self::new();
        store.create(documents)?;
        Ok(store)
    }

    /// Number of stored entities.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("entity.len"))?.len())
    }

    /// Returns true if nothing is stored.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Clones every stored document, in store order.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn documents(&self) -> Result<Vec<EntityDocument>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.documents"))?;
        Ok(state.documents().cloned().collect())
    }
}

impl EntityStore for InMemoryEntityStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn contains(&self, uri: &EntityUri) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.contains"))?;
        Ok(state.contains(uri))
    }

    fn read(&self, uri: &EntityUri) -> Result<Option<EntityDocument>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.read"))?;
        Ok(state.get(uri).cloned())
    }

    fn create(&self, documents: Vec<EntityDocument>) -> Result<Created, StorageError> {
        if documents.is_empty() {
            return Ok(Created::Nothing);
        }

        let mut state = self.state.write().map_err(|_| lock_err("entity.create"))?;
        let uris = state.prepare_create(&documents)?;
        state.insert_all(uris, documents.clone());
        Ok(Created::from_batch(documents))
    }

    fn update(&self, uri: &EntityUri, document: EntityDocument) -> Result<(), StorageError> {
        check_update_identity(uri, &document)?;

        let mut state = self.state.write().map_err(|_| lock_err("entity.update"))?;
        state.apply_update(uri, &document);
        Ok(())
    }

    fn delete(&self, uris: &[EntityUri]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.delete"))?;
        state.remove_all(uris);
        Ok(())
    }

    fn search(&self, query: &SearchQuery) -> Result<DocumentStream<'_>, StorageError> {
        let snapshot = self
            .state
            .read()
            .map_err(|_| lock_err("entity.search"))?
            .snapshot();
        Ok(Box::new(snapshot.search(query)?))
    }

    fn count(&self, raw: Option<&RawQuery>) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.count"))?;
        Ok(state.snapshot().count(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc(value: Value) -> EntityDocument {
        EntityDocument::from_value(value).unwrap()
    }

    fn uri(s: &str) -> EntityUri {
        EntityUri::parse(s).unwrap()
    }

    fn box_doc() -> EntityDocument {
        doc(json!({
            "namespace": "http://x.org",
            "version": "0.1",
            "name": "Box",
            "description": "A box",
            "properties": {"length": {"type": "float"}},
        }))
    }

    #[test]
    fn test_create_and_read() {
        let store = InMemoryEntityStore::new();
        let created = store.create(vec![box_doc()]).unwrap();
        assert_eq!(created, Created::One(box_doc()));

        let read = store.read(&uri("http://x.org/0.1/Box")).unwrap();
        assert_eq!(read, Some(box_doc()));
        assert!(store.contains(&uri("http://x.org/0.1/Box")).unwrap());
        assert!(!store.contains(&uri("http://x.org/0.2/Box")).unwrap());
    }

    #[test]
    fn test_create_arity() {
        let store = InMemoryEntityStore::new();
        assert_eq!(store.create(Vec::new()).unwrap(), Created::Nothing);

        let many = store
            .create(vec![
                doc(json!({"uri": "http://x.org/0.1/A", "properties": {}})),
                doc(json!({"uri": "http://x.org/0.1/B", "properties": {}})),
            ])
            .unwrap();
        assert!(many.mirrors(2));
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_create_rejects_duplicates_atomically() {
        let store = InMemoryEntityStore::with_documents(vec![box_doc()]).unwrap();

        let err = store
            .create(vec![
                doc(json!({"uri": "http://x.org/0.1/New", "properties": {}})),
                box_doc(),
            ])
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
        assert_eq!(store.len().unwrap(), 1);

        let err = store
            .create(vec![
                doc(json!({"uri": "http://x.org/0.1/Twin", "properties": {}})),
                doc(json!({"uri": "http://x.org/0.1/Twin", "properties": {}})),
            ])
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[test]
    fn test_create_rejects_missing_identity() {
        let store = InMemoryEntityStore::new();
        let err = store.create(vec![doc(json!({"properties": {}}))]).unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentity(_)));
    }

    #[test]
    fn test_update_merges_top_level_fields() {
        let store = InMemoryEntityStore::with_documents(vec![box_doc()]).unwrap();
        let target = uri("http://x.org/0.1/Box");

        store
            .update(&target, doc(json!({"description": "A sturdy box"})))
            .unwrap();

        let stored = store.read(&target).unwrap().unwrap();
        assert_eq!(stored.get("description"), Some(&json!("A sturdy box")));
        assert_eq!(stored.get("properties"), Some(&json!({"length": {"type": "float"}})));
        assert_eq!(stored.identity().unwrap(), target);
    }

    #[test]
    fn test_update_rejects_identity_change() {
        let store = InMemoryEntityStore::with_documents(vec![box_doc()]).unwrap();
        let target = uri("http://x.org/0.1/Box");

        let err = store
            .update(&target, doc(json!({"uri": "http://x.org/0.2/Box"})))
            .unwrap_err();
        assert!(matches!(err, StorageError::IdentityChange { .. }));

        let err = store
            .update(&target, doc(json!({"uri": "http://x.org/Box"})))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentity(_)));

        let err = store
            .update(
                &target,
                doc(json!({"uri": "http://x.org/0.1/Box", "name": "Crate"})),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::IdentityChange { .. }));

        assert_eq!(store.read(&target).unwrap(), Some(box_doc()));
    }

    #[test]
    fn test_update_absent_is_noop() {
        let store = InMemoryEntityStore::new();
        store
            .update(&uri("http://x.org/0.1/Ghost"), doc(json!({"description": "x"})))
            .unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_delete_skips_absent_and_reindexes() {
        let store = InMemoryEntityStore::with_documents(vec![
            doc(json!({"uri": "http://x.org/0.1/A", "properties": {}})),
            doc(json!({"uri": "http://x.org/0.1/B", "properties": {}})),
            doc(json!({"uri": "http://x.org/0.1/C", "properties": {}})),
        ])
        .unwrap();

        store
            .delete(&[uri("http://x.org/0.1/A"), uri("http://x.org/0.1/Ghost")])
            .unwrap();

        assert_eq!(store.len().unwrap(), 2);
        assert!(store.read(&uri("http://x.org/0.1/A")).unwrap().is_none());
        assert!(store.read(&uri("http://x.org/0.1/C")).unwrap().is_some());

        let order: Vec<String> = store
            .documents()
            .unwrap()
            .iter()
            .map(|d| d.identity().unwrap().name().to_string())
            .collect();
        assert_eq!(order, vec!["B", "C"]);
    }

    #[test]
    fn test_search_sees_snapshot() {
        let store = InMemoryEntityStore::with_documents(vec![box_doc()]).unwrap();
        let stream = store.search(&SearchQuery::new()).unwrap();

        // Writes after the search started do not show up in its results.
        store
            .create(vec![doc(json!({"uri": "http://x.org/0.1/Late", "properties": {}}))])
            .unwrap();
        assert_eq!(stream.count(), 1);
        assert_eq!(store.count(None).unwrap(), 2);
    }
}
