//! Bulk-load lifecycle: exclusive loader state, connection pinning, and
//! commit/abort teardown.

use serde_json::json;
use std::sync::Arc;

use galena_core::collection::map::CollectionMap;
use galena_core::gtid::{Gtid, GtidManager};
use galena_core::storage::{DictionaryEngine, MemEngine};
use galena_core::txn::{ConnectionId, Transaction};
use galena_core::{GalenaError, IndexKey};

fn test_map(engine: &Arc<MemEngine>) -> CollectionMap {
    let engine: Arc<dyn DictionaryEngine> = engine.clone();
    CollectionMap::new(engine, "test", Arc::new(GtidManager::new(Gtid::ZERO)))
}

fn setup_empty(map: &CollectionMap, ns: &str) {
    let txn = Transaction::begin(ConnectionId(1));
    map.create_collection(&txn, ns, json!({})).unwrap();
    txn.commit();
}

#[test]
fn test_bulk_load_round_trip() {
    let engine = MemEngine::new();
    let map = test_map(&engine);
    setup_empty(&map, "test.loaded");

    let loader_conn = ConnectionId(7);
    map.begin_bulk_load(
        "test.loaded",
        &[json!({"key": {"a": 1}})],
        &json!({}),
        loader_conn,
    )
    .unwrap();

    let cl = map.collection("test.loaded").unwrap().unwrap();
    assert!(cl.bulk_loading());

    let txn = Transaction::begin(loader_conn);
    for i in 0..1000 {
        cl.insert_object(&txn, json!({"_id": i, "a": i % 10}), 0)
            .unwrap();
    }
    txn.commit();

    // Another connection cannot touch the namespace mid-load.
    let other = Transaction::begin(ConnectionId(8));
    let err = cl
        .insert_object(&other, json!({"_id": 5000}), 0)
        .unwrap_err();
    assert!(matches!(err, GalenaError::BulkLoadConflict(_)));
    other.commit();

    // Deletes and updates are not bulk-loadable operations at all.
    let txn = Transaction::begin(loader_conn);
    let err = cl
        .delete_object(&txn, &IndexKey::Int(0), &json!({"_id": 0}), 0)
        .unwrap_err();
    assert!(matches!(err, GalenaError::OperationNotAllowed(_)));
    let err = cl
        .update_object_mods(
            &txn,
            &IndexKey::Int(0),
            &json!({"$inc": {"a": 1}}),
            false,
            false,
            0,
        )
        .unwrap_err();
    assert!(matches!(err, GalenaError::OperationNotAllowed(_)));
    txn.commit();

    // Rows are invisible until the loader closes.
    assert_eq!(cl.index_entry_count(0), 0);

    map.commit_bulk_load("test.loaded").unwrap();
    let reopened = map.collection("test.loaded").unwrap().unwrap();
    assert!(!reopened.bulk_loading());
    assert_eq!(reopened.n_indexes(), 2);
    assert_eq!(reopened.index_entry_count(0), 1000);
    assert_eq!(reopened.index_entry_count(1), 1000);

    let found = reopened.find_one(&json!({"_id": 123}), false).unwrap().unwrap();
    assert_eq!(found["a"], 3);
}

#[test]
fn test_bulk_load_requires_existing_empty_namespace() {
    let engine = MemEngine::new();
    let map = test_map(&engine);

    let err = map
        .begin_bulk_load("test.missing", &[], &json!({}), ConnectionId(1))
        .unwrap_err();
    assert!(matches!(err, GalenaError::NamespaceMissing(_)));

    setup_empty(&map, "test.full");
    let cl = map.collection("test.full").unwrap().unwrap();
    let txn = Transaction::begin(ConnectionId(1));
    cl.insert_object(&txn, json!({"_id": 1}), 0).unwrap();
    txn.commit();

    let err = map
        .begin_bulk_load("test.full", &[], &json!({}), ConnectionId(1))
        .unwrap_err();
    assert!(matches!(err, GalenaError::OperationNotAllowed(_)));
}

#[test]
fn test_double_begin_conflicts() {
    let engine = MemEngine::new();
    let map = test_map(&engine);
    setup_empty(&map, "test.loaded");

    map.begin_bulk_load("test.loaded", &[], &json!({}), ConnectionId(1))
        .unwrap();
    let err = map
        .begin_bulk_load("test.loaded", &[], &json!({}), ConnectionId(2))
        .unwrap_err();
    assert!(matches!(err, GalenaError::BulkLoadConflict(_)));
    map.abort_bulk_load("test.loaded").unwrap();
}

#[test]
fn test_abort_discards_loaded_rows() {
    let engine = MemEngine::new();
    let map = test_map(&engine);
    setup_empty(&map, "test.loaded");

    let conn = ConnectionId(3);
    map.begin_bulk_load("test.loaded", &[json!({"key": {"a": 1}})], &json!({}), conn)
        .unwrap();
    let cl = map.collection("test.loaded").unwrap().unwrap();
    let txn = Transaction::begin(conn);
    for i in 0..10 {
        cl.insert_object(&txn, json!({"_id": i, "a": i}), 0).unwrap();
    }
    txn.commit();

    map.abort_bulk_load("test.loaded").unwrap();
    let reopened = map.collection("test.loaded").unwrap().unwrap();
    assert!(!reopened.bulk_loading());
    assert_eq!(reopened.index_entry_count(0), 0);
    // The index created for the load survives, empty.
    assert_eq!(reopened.n_indexes(), 2);
}

#[test]
fn test_bulk_load_duplicate_unique_key_fails_commit() {
    let engine = MemEngine::new();
    let map = test_map(&engine);
    setup_empty(&map, "test.loaded");

    let conn = ConnectionId(4);
    map.begin_bulk_load(
        "test.loaded",
        &[json!({"key": {"a": 1}, "unique": true})],
        &json!({}),
        conn,
    )
    .unwrap();
    let cl = map.collection("test.loaded").unwrap().unwrap();
    let txn = Transaction::begin(conn);
    cl.insert_object(&txn, json!({"_id": 1, "a": 7}), 0).unwrap();
    cl.insert_object(&txn, json!({"_id": 2, "a": 7}), 0).unwrap();
    txn.commit();

    let err = map.commit_bulk_load("test.loaded").unwrap_err();
    assert!(matches!(err, GalenaError::DuplicateKey { .. }));
}

#[test]
fn test_multikey_documents_through_loader() {
    let engine = MemEngine::new();
    let map = test_map(&engine);
    setup_empty(&map, "test.loaded");

    let conn = ConnectionId(5);
    map.begin_bulk_load("test.loaded", &[json!({"key": {"tags": 1}})], &json!({}), conn)
        .unwrap();
    let cl = map.collection("test.loaded").unwrap().unwrap();
    let txn = Transaction::begin(conn);
    cl.insert_object(&txn, json!({"_id": 1, "tags": ["x", "y"]}), 0)
        .unwrap();
    txn.commit();
    map.commit_bulk_load("test.loaded").unwrap();

    let reopened = map.collection("test.loaded").unwrap().unwrap();
    let idx_no = reopened.find_index_by_name("tags_1").unwrap();
    assert!(reopened.is_multikey(idx_no));
    let found = reopened.find_one(&json!({"tags": "y"}), true).unwrap().unwrap();
    assert_eq!(found["_id"], 1);
}

#[test]
fn test_bulk_loading_namespace_rejects_ddl() {
    let engine = MemEngine::new();
    let map = test_map(&engine);
    setup_empty(&map, "test.loaded");
    map.begin_bulk_load("test.loaded", &[], &json!({}), ConnectionId(1))
        .unwrap();
    let cl = map.collection("test.loaded").unwrap().unwrap();

    assert!(cl.ensure_index(&json!({"key": {"z": 1}})).is_err());
    assert!(cl.drop_indexes("*", false).is_err());

    let txn = Transaction::begin(ConnectionId(1));
    let err = map.drop_collection(&txn, "test.loaded", false).unwrap_err();
    assert!(matches!(err, GalenaError::BulkLoadConflict(_)));
    txn.commit();

    map.abort_bulk_load("test.loaded").unwrap();
}
