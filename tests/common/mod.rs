//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use entities_registry::{
    Created, DocumentStream, EntityDocument, EntityStore, EntityUri, InMemoryEntityStore,
    RawQuery, SearchQuery, StorageError,
};
use serde_json::{json, Value};

pub fn doc(value: Value) -> EntityDocument {
    EntityDocument::from_value(value).unwrap()
}

pub fn uri(s: &str) -> EntityUri {
    EntityUri::parse(s).unwrap()
}

/// Map dialect: `properties` is an object keyed by property name.
pub fn box_entity() -> EntityDocument {
    doc(json!({
        "uri": "http://x.org/0.1/Box",
        "description": "A box",
        "dimensions": {"n": "Number of sides"},
        "properties": {"length": {"type": "float", "shape": ["n"], "unit": "m"}},
    }))
}

/// List dialect: `properties` is a list of named items.
pub fn ball_entity() -> EntityDocument {
    doc(json!({
        "namespace": "http://x.org",
        "version": "0.1",
        "name": "Ball",
        "description": "A ball",
        "dimensions": [],
        "properties": [{"name": "radius", "type": "float", "unit": "m"}],
    }))
}

pub fn named(name: &str) -> EntityDocument {
    doc(json!({
        "uri": format!("http://x.org/0.1/{name}"),
        "properties": {"value": {"type": "int"}},
    }))
}

pub fn names(documents: &[EntityDocument]) -> Vec<String> {
    documents
        .iter()
        .map(|d| d.identity().unwrap().name().to_string())
        .collect()
}

/// Per-method call counters.
#[derive(Debug, Default)]
pub struct Calls {
    pub contains: AtomicUsize,
    pub read: AtomicUsize,
    pub create: AtomicUsize,
    pub update: AtomicUsize,
    pub delete: AtomicUsize,
    pub search: AtomicUsize,
}

impl Calls {
    pub fn writes(&self) -> usize {
        self.create.load(Ordering::SeqCst)
            + self.update.load(Ordering::SeqCst)
            + self.delete.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.writes()
            + self.contains.load(Ordering::SeqCst)
            + self.read.load(Ordering::SeqCst)
            + self.search.load(Ordering::SeqCst)
    }
}

/// In-memory store that counts calls and can be told to fail writes.
#[derive(Default)]
pub struct InstrumentedStore {
    pub inner: InMemoryEntityStore,
    pub calls: Calls,
    pub fail_creates: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Updates succeed this many times, then fail. `usize::MAX` never fails.
    pub updates_allowed: AtomicUsize,
}

impl InstrumentedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updates_allowed: AtomicUsize::new(usize::MAX),
            ..Self::default()
        })
    }

    pub fn seeded(documents: Vec<EntityDocument>) -> Arc<Self> {
        let store = Self::new();
        store.inner.create(documents).unwrap();
        store
    }

    fn outage() -> StorageError {
        StorageError::BackendError("connection refused".to_string())
    }
}

impl EntityStore for InstrumentedStore {
    fn backend_name(&self) -> &'static str {
        "instrumented"
    }

    fn contains(&self, uri: &EntityUri) -> Result<bool, StorageError> {
        self.calls.contains.fetch_add(1, Ordering::SeqCst);
        self.inner.contains(uri)
    }

    fn read(&self, uri: &EntityUri) -> Result<Option<EntityDocument>, StorageError> {
        self.calls.read.fetch_add(1, Ordering::SeqCst);
        self.inner.read(uri)
    }

    fn create(&self, documents: Vec<EntityDocument>) -> Result<Created, StorageError> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.create(documents)
    }

    fn update(&self, uri: &EntityUri, document: EntityDocument) -> Result<(), StorageError> {
        self.calls.update.fetch_add(1, Ordering::SeqCst);
        let allowed = self.updates_allowed.load(Ordering::SeqCst);
        if allowed == 0 {
            return Err(Self::outage());
        }
        if allowed != usize::MAX {
            self.updates_allowed.store(allowed - 1, Ordering::SeqCst);
        }
        self.inner.update(uri, document)
    }

    fn delete(&self, uris: &[EntityUri]) -> Result<(), StorageError> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.delete(uris)
    }

    fn search(&self, query: &SearchQuery) -> Result<DocumentStream<'_>, StorageError> {
        self.calls.search.fetch_add(1, Ordering::SeqCst);
        self.inner.search(query)
    }

    fn count(&self, raw: Option<&RawQuery>) -> Result<usize, StorageError> {
        self.inner.count(raw)
    }
}
