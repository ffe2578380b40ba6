//! Search semantics through the registry facade.

mod common;

use std::sync::Arc;

use common::{ball_entity, box_entity, doc, names, named, uri, InstrumentedStore};
use entities_registry::{
    AllowAll, Credentials, EntityStore, InMemoryEntityStore, RawQuery, Registry, RegistryError,
    SearchQuery, StorageError,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn box_and_ball() -> Registry {
    let registry = Registry::in_memory();
    registry
        .create(&Credentials::anonymous(), vec![box_entity(), ball_entity()])
        .unwrap();
    registry
}

#[test]
fn test_property_search_over_both_dialects() {
    let registry = box_and_ball();

    let found = registry
        .search(&SearchQuery::new().with_property("length"))
        .unwrap();
    assert_eq!(names(&found), vec!["Box"]);

    let found = registry
        .search(&SearchQuery::new().with_property("radius"))
        .unwrap();
    assert_eq!(names(&found), vec!["Ball"]);

    let found = registry
        .search(&SearchQuery::new().with_property("radius").with_property("length"))
        .unwrap();
    assert_eq!(names(&found), vec!["Box", "Ball"]);
}

#[test]
fn test_search_is_a_union_with_observable_duplicates() {
    let registry = box_and_ball();
    let query = SearchQuery::new()
        .with_property("radius")
        .with_dimension("n")
        .with_identity(uri("http://x.org/0.1/Box"))
        .with_identity(uri("http://x.org/0.1/Ball"));

    let found = registry.search(&query).unwrap();
    // properties pass, then dimensions, then identities in input order
    assert_eq!(names(&found), vec!["Ball", "Box", "Box", "Ball"]);
}

#[test]
fn test_unknown_identities_are_skipped() {
    let registry = box_and_ball();
    let query = SearchQuery::new()
        .with_identity(uri("http://x.org/0.1/Missing"))
        .with_identity(uri("http://x.org/0.1/Ball"));

    let found = registry.search(&query).unwrap();
    assert_eq!(names(&found), vec!["Ball"]);
}

#[test]
fn test_empty_query_returns_everything_in_store_order() {
    let registry = box_and_ball();
    let found = registry.search(&SearchQuery::new()).unwrap();
    assert_eq!(names(&found), vec!["Box", "Ball"]);
}

#[test]
fn test_no_hits_is_not_found() {
    let registry = box_and_ball();

    let err = registry
        .search(&SearchQuery::new().with_property("mass"))
        .unwrap_err();
    assert!(err.is_not_found());

    let missing = uri("http://x.org/0.1/Missing");
    let err = registry
        .search(&SearchQuery::new().with_identity(missing.clone()))
        .unwrap_err();
    match err {
        RegistryError::NotFound { uris } => assert_eq!(uris, vec![missing]),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn test_invalid_stored_shape_surfaces_as_storage_error() {
    let store = Arc::new(InMemoryEntityStore::new());
    store
        .create(vec![
            named("A"),
            doc(json!({"uri": "http://x.org/0.1/Broken", "properties": 42})),
        ])
        .unwrap();
    let registry = Registry::new(store, Arc::new(AllowAll));

    let err = registry
        .search(&SearchQuery::new().with_property("value"))
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Storage(StorageError::InvalidDocument { .. })
    ));

    // the lazy stream yields the match before the broken record
    let mut stream = registry
        .stream(&SearchQuery::new().with_property("value"))
        .unwrap();
    assert_eq!(stream.next().unwrap().unwrap(), named("A"));
    assert!(stream.next().unwrap().is_err());
    assert!(stream.next().is_none());
}

#[test]
fn test_raw_queries_are_exclusive_with_filters() {
    let registry = box_and_ball();
    let raw = RawQuery::new(json!({"description": "A ball"})).unwrap();

    let found = registry.search(&SearchQuery::raw(raw.clone())).unwrap();
    assert_eq!(names(&found), vec!["Ball"]);
    assert_eq!(registry.count(Some(&raw)).unwrap(), 1);

    let mut mixed = SearchQuery::raw(raw);
    mixed.properties.push("length".to_string());
    let err = registry.search(&mixed).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Storage(StorageError::UnsupportedQuery(_))
    ));
}

#[test]
fn test_reads_go_through_the_injected_store() {
    let store = InstrumentedStore::seeded(vec![box_entity()]);
    let registry = Registry::new(store.clone(), Arc::new(AllowAll));

    registry.get("http://x.org/0.1/Box").unwrap();
    registry
        .search(&SearchQuery::new().with_dimension("n"))
        .unwrap();

    assert_eq!(store.calls.read.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(store.calls.search.load(std::sync::atomic::Ordering::SeqCst), 1);
}
