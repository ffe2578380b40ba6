//! Inclusive multi-criteria search over both document dialects.
//!
//! # Union, not intersection
//!
//! When several criteria are given, the result is the **union** of the
//! documents matching any property name, any dimension name, or any identity.
//! It is not the set of documents matching all of them. Results come in three
//! passes, in this order:
//!
//! 1. documents with a requested property (store order)
//! 2. documents with a requested dimension (store order)
//! 3. documents with a requested identity (request order)
//!
//! The union is not de-duplicated: a document matching in two passes appears
//! twice. No criteria at all selects every document.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::document::{EntityDocument, ShapedField};
use crate::error::{RegistryError, RegistryResult};
use crate::storage::{DocumentStream, EntityStore, StorageError};
use crate::uri::EntityUri;

/// A backend-native query: a JSON object matched field-by-field.
///
/// A document matches when every top-level key of the query is present in the
/// document with an equal value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawQuery(Map<String, Value>);

impl RawQuery {
    /// Builds a raw query from a JSON value, which must be an object.
    ///
    /// # Errors
    /// Returns [`StorageError::UnsupportedQuery`] for non-object values.
    pub fn new(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StorageError::UnsupportedQuery(format!(
                "raw queries must be JSON objects, got {other}"
            ))),
        }
    }

    /// Returns true if `document` satisfies every clause.
    #[must_use]
    pub fn matches(&self, document: &EntityDocument) -> bool {
        self.0
            .iter()
            .all(|(key, expected)| document.get(key) == Some(expected))
    }
}

/// Search criteria.
///
/// Empty criteria lists count as "not given".
///
/// # Examples
///
/// ```
/// use entities_registry::SearchQuery;
///
/// let query = SearchQuery::new().with_property("mass").with_dimension("n_atoms");
/// assert!(!query.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Identities to look up directly.
    #[serde(default)]
    pub identities: Vec<EntityUri>,
    /// Property names, any of which selects a document.
    #[serde(default)]
    pub properties: Vec<String>,
    /// Dimension names, any of which selects a document.
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// Backend-native query; exclusive with the structured criteria.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawQuery>,
}

impl SearchQuery {
    /// A query selecting every document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A raw backend query.
    #[must_use]
    pub fn raw(raw: RawQuery) -> Self {
        Self {
            raw: Some(raw),
            ..Self::default()
        }
    }

    /// Adds an identity.
    #[must_use]
    pub fn with_identity(mut self, uri: EntityUri) -> Self {
        self.identities.push(uri);
        self
    }

    /// Adds a property name.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    /// Adds a dimension name.
    #[must_use]
    pub fn with_dimension(mut self, name: impl Into<String>) -> Self {
        self.dimensions.push(name.into());
        self
    }

    /// Returns true if no criteria at all are given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_structured_filters() && self.raw.is_none()
    }

    fn has_structured_filters(&self) -> bool {
        !self.identities.is_empty() || !self.properties.is_empty() || !self.dimensions.is_empty()
    }

    /// Rejects a query mixing raw and structured criteria.
    ///
    /// # Errors
    /// Returns [`StorageError::UnsupportedQuery`].
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.raw.is_some() && self.has_structured_filters() {
            return Err(StorageError::UnsupportedQuery(
                "raw queries cannot be combined with identity, property or dimension filters"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn passes(&self) -> Vec<Pass> {
        if self.raw.is_some() {
            return vec![Pass::Raw];
        }
        if !self.has_structured_filters() {
            return vec![Pass::All];
        }

        let mut passes = Vec::with_capacity(3);
        if !self.properties.is_empty() {
            passes.push(Pass::Field(ShapedField::Properties));
        }
        if !self.dimensions.is_empty() {
            passes.push(Pass::Field(ShapedField::Dimensions));
        }
        if !self.identities.is_empty() {
            passes.push(Pass::Identities);
        }
        passes
    }

    fn names(&self, field: ShapedField) -> &[String] {
        match field {
            ShapedField::Properties => &self.properties,
            ShapedField::Dimensions => &self.dimensions,
        }
    }
}

/// Point-in-time view of a store's records, in store order.
///
/// Records are shared, so taking a snapshot does not copy documents and no store
/// lock is held while results are consumed.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Vec<(EntityUri, Arc<EntityDocument>)>,
}

impl Snapshot {
    /// Creates a snapshot from records in store order.
    #[must_use]
    pub fn new(records: Vec<(EntityUri, Arc<EntityDocument>)>) -> Self {
        Self { records }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Counts records, optionally restricted by a raw query.
    #[must_use]
    pub fn count(&self, raw: Option<&RawQuery>) -> usize {
        match raw {
            None => self.records.len(),
            Some(raw) => self
                .records
                .iter()
                .filter(|(_, doc)| raw.matches(doc))
                .count(),
        }
    }

    /// Starts a lazy search over this snapshot.
    ///
    /// # Errors
    /// Returns [`StorageError::UnsupportedQuery`] for invalid queries.
    pub fn search(self, query: &SearchQuery) -> Result<SearchResults, StorageError> {
        query.validate()?;
        Ok(SearchResults {
            passes: query.passes(),
            query: query.clone(),
            snapshot: self,
            pass: 0,
            cursor: 0,
            by_uri: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    All,
    Raw,
    Field(ShapedField),
    Identities,
}

/// Lazy iterator over search results.
///
/// An invalid document ends the iteration after yielding its error.
#[derive(Debug)]
pub struct SearchResults {
    query: SearchQuery,
    snapshot: Snapshot,
    passes: Vec<Pass>,
    pass: usize,
    cursor: usize,
    by_uri: Option<HashMap<EntityUri, usize>>,
}

impl SearchResults {
    fn next_pass(&mut self) {
        self.pass += 1;
        self.cursor = 0;
    }

    fn finish(&mut self) {
        self.pass = self.passes.len();
    }

    fn next_identity(&mut self) -> Option<Option<EntityDocument>> {
        let uri = self.query.identities.get(self.cursor)?;
        self.cursor += 1;

        let records = &self.snapshot.records;
        let index = self.by_uri.get_or_insert_with(|| {
            records
                .iter()
                .enumerate()
                .map(|(i, (uri, _))| (uri.clone(), i))
                .collect()
        });

        Some(
            index
                .get(uri)
                .and_then(|&i| records.get(i))
                .map(|(_, doc)| (**doc).clone()),
        )
    }

    fn next_scanned(&mut self, pass: Pass) -> Option<Result<Option<EntityDocument>, StorageError>> {
        let (uri, doc) = self.snapshot.records.get(self.cursor)?;
        self.cursor += 1;

        let selected = match pass {
            Pass::All => Ok(true),
            Pass::Raw => Ok(self.query.raw.as_ref().is_some_and(|raw| raw.matches(doc))),
            Pass::Field(field) => doc
                .shape(field)
                .contains_any(field, self.query.names(field))
                .map_err(|e| StorageError::InvalidDocument {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                }),
            Pass::Identities => Ok(false),
        };

        Some(selected.map(|hit| hit.then(|| (**doc).clone())))
    }
}

impl Iterator for SearchResults {
    type Item = Result<EntityDocument, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&pass) = self.passes.get(self.pass) {
            let step = if pass == Pass::Identities {
                self.next_identity().map(Ok)
            } else {
                self.next_scanned(pass)
            };

            match step {
                None => self.next_pass(),
                Some(Ok(None)) => {}
                Some(Ok(Some(doc))) => return Some(Ok(doc)),
                Some(Err(err)) => {
                    self.finish();
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Read-side front of the registry.
///
/// Wraps an injected store and turns empty results and absent identities into
/// [`RegistryError::NotFound`].
#[derive(Clone)]
pub struct SearchEngine {
    store: Arc<dyn EntityStore>,
}

impl SearchEngine {
    /// Creates a search engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Lazily searches the store.
    ///
    /// # Errors
    /// Returns the store's error for invalid queries.
    pub fn stream(&self, query: &SearchQuery) -> RegistryResult<DocumentStream<'_>> {
        Ok(self.store.search(query)?)
    }

    /// Runs a search and collects every result.
    ///
    /// # Errors
    /// - [`RegistryError::NotFound`] when nothing matches
    /// - [`RegistryError::Storage`] when a stored document has an invalid shape
    pub fn search(&self, query: &SearchQuery) -> RegistryResult<Vec<EntityDocument>> {
        let found = self
            .stream(query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                error!(backend = self.store.backend_name(), error = %err, "entity search failed");
                RegistryError::Storage(err)
            })?;

        if found.is_empty() {
            error!(
                identities = %join_or_none(query.identities.iter().map(EntityUri::as_str)),
                properties = %join_or_none(query.properties.iter().map(String::as_str)),
                dimensions = %join_or_none(query.dimensions.iter().map(String::as_str)),
                "could not find entities"
            );
            return Err(RegistryError::NotFound {
                uris: query.identities.clone(),
            });
        }

        debug!(hits = found.len(), "entity search complete");
        Ok(found)
    }

    /// Reads a single entity.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] when it is absent.
    pub fn get(&self, uri: &EntityUri) -> RegistryResult<EntityDocument> {
        self.store
            .read(uri)?
            .ok_or_else(|| RegistryError::not_found(uri.clone()))
    }

    /// Counts stored entities, optionally restricted by a raw query.
    ///
    /// # Errors
    /// Returns the store's error.
    pub fn count(&self, raw: Option<&RawQuery>) -> RegistryResult<usize> {
        Ok(self.store.count(raw)?)
    }
}

fn join_or_none<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let joined = items.collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "None".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> (EntityUri, Arc<EntityDocument>) {
        let doc = EntityDocument::from_value(value).unwrap();
        (doc.identity().unwrap(), Arc::new(doc))
    }

    fn corpus() -> Snapshot {
        Snapshot::new(vec![
            record(json!({
                "uri": "http://x.org/0.1/Box",
                "properties": {"length": {"type": "float"}},
                "dimensions": {"n": "count"},
            })),
            record(json!({
                "uri": "http://x.org/0.1/Ball",
                "properties": [{"name": "radius"}],
            })),
        ])
    }

    fn names(results: SearchResults) -> Vec<String> {
        results
            .map(|doc| doc.unwrap().identity().unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_no_criteria_returns_everything() {
        let found = names(corpus().search(&SearchQuery::new()).unwrap());
        assert_eq!(found, vec!["Box", "Ball"]);
    }

    #[test]
    fn test_property_across_dialects() {
        let found = names(corpus().search(&SearchQuery::new().with_property("radius")).unwrap());
        assert_eq!(found, vec!["Ball"]);

        let query = SearchQuery::new().with_property("length").with_property("radius");
        assert_eq!(names(corpus().search(&query).unwrap()), vec!["Box", "Ball"]);
    }

    #[test]
    fn test_union_keeps_duplicates() {
        let box_uri = EntityUri::parse("http://x.org/0.1/Box").unwrap();
        let query = SearchQuery::new()
            .with_property("radius")
            .with_dimension("n")
            .with_identity(box_uri);
        assert_eq!(names(corpus().search(&query).unwrap()), vec!["Ball", "Box", "Box"]);
    }

    #[test]
    fn test_identity_lookup_preserves_request_order() {
        let query = SearchQuery::new()
            .with_identity(EntityUri::parse("http://x.org/0.1/Ball").unwrap())
            .with_identity(EntityUri::parse("http://x.org/0.1/Missing").unwrap())
            .with_identity(EntityUri::parse("http://x.org/0.1/Box").unwrap());
        assert_eq!(names(corpus().search(&query).unwrap()), vec!["Ball", "Box"]);
    }

    #[test]
    fn test_invalid_shape_is_an_error() {
        let snapshot = Snapshot::new(vec![
            record(json!({"uri": "http://x.org/0.1/Box", "properties": {"length": {}}})),
            record(json!({"uri": "http://x.org/0.1/Bad", "properties": 42})),
            record(json!({"uri": "http://x.org/0.1/Late", "properties": {"length": {}}})),
        ]);
        let results: Vec<_> = snapshot
            .search(&SearchQuery::new().with_property("length"))
            .unwrap()
            .collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(StorageError::InvalidDocument { uri, .. }) if uri == "http://x.org/0.1/Bad"
        ));
    }

    #[test]
    fn test_invalid_shape_ignored_without_field_filter() {
        let snapshot = Snapshot::new(vec![record(json!({
            "uri": "http://x.org/0.1/Bad",
            "properties": "nope",
        }))]);
        assert_eq!(snapshot.search(&SearchQuery::new()).unwrap().count(), 1);
    }

    #[test]
    fn test_raw_query() {
        let raw = RawQuery::new(json!({"uri": "http://x.org/0.1/Ball"})).unwrap();
        assert_eq!(names(corpus().search(&SearchQuery::raw(raw.clone())).unwrap()), vec!["Ball"]);
        assert_eq!(corpus().count(Some(&raw)), 1);
        assert_eq!(corpus().count(None), 2);

        assert!(RawQuery::new(json!(["uri"])).is_err());
    }

    #[test]
    fn test_raw_query_is_exclusive() {
        let raw = RawQuery::new(json!({})).unwrap();
        let query = SearchQuery {
            properties: vec!["length".to_string()],
            ..SearchQuery::raw(raw)
        };
        assert!(matches!(
            corpus().search(&query),
            Err(StorageError::UnsupportedQuery(_))
        ));
    }
}
