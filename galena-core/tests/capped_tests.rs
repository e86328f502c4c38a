//! Capped-collection behavior: trim on gorge, rollback accounting, and
//! tailable visibility across concurrent inserts and aborts.

use serde_json::json;
use std::sync::Arc;
use std::thread;

use galena_core::collection::map::CollectionMap;
use galena_core::document::doc_size;
use galena_core::gtid::{Gtid, GtidManager};
use galena_core::storage::{DictionaryEngine, MemEngine};
use galena_core::txn::{ConnectionId, Transaction};
use galena_core::{Collection, GalenaError, IndexKey};

fn test_map(engine: &Arc<MemEngine>, db: &str) -> CollectionMap {
    let engine: Arc<dyn DictionaryEngine> = engine.clone();
    CollectionMap::new(engine, db, Arc::new(GtidManager::new(Gtid::ZERO)))
}

fn capped_collection(map: &CollectionMap, ns: &str, size: i64, max: i64) -> Arc<Collection> {
    let txn = Transaction::begin(ConnectionId(1));
    let cl = map
        .create_collection(&txn, ns, json!({"capped": true, "size": size, "max": max}))
        .unwrap();
    txn.commit();
    cl
}

/// The number of documents visible in the primary index must always match
/// the in-memory counter, and sizes must add up.
fn assert_counters_match(cl: &Collection) {
    let (objects, size) = cl.capped_stats().unwrap();
    let rows = cl.index_snapshot(0);
    assert_eq!(objects, rows.len() as i64, "object counter out of sync");
    let actual: i64 = rows.iter().map(|(_, doc)| doc_size(doc)).sum();
    assert_eq!(size, actual, "size counter out of sync");
}

#[test]
fn test_max_object_trim() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 100, 3);

    for i in 0..4 {
        let txn = Transaction::begin(ConnectionId(1));
        cl.insert_object(&txn, json!({"_id": i, "v": i}), 0).unwrap();
        txn.commit();
    }

    let (objects, _) = cl.capped_stats().unwrap();
    assert_eq!(objects, 3);
    // The first inserted row (pk 1) was trimmed.
    assert!(cl.find_by_pk(&IndexKey::Int(1)).unwrap().is_none());
    assert!(cl.find_by_pk(&IndexKey::Int(4)).unwrap().is_some());
    assert_counters_match(&cl);
}

#[test]
fn test_max_size_trim() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    // No max count; trimming is driven purely by size.
    let cl = capped_collection(&map, "test.capped", 60, 0);

    for i in 0..5 {
        let txn = Transaction::begin(ConnectionId(1));
        cl.insert_object(&txn, json!({"_id": i, "pad": "xxxxxxxx"}), 0)
            .unwrap();
        txn.commit();
    }

    let (_, size) = cl.capped_stats().unwrap();
    assert!(size <= 60, "size {} exceeds cap", size);
    assert_counters_match(&cl);
    // Newest row always survives.
    assert!(cl.find_by_pk(&IndexKey::Int(5)).unwrap().is_some());
}

#[test]
fn test_abort_restores_counters() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 10_000, 100);

    let txn = Transaction::begin(ConnectionId(1));
    cl.insert_object(&txn, json!({"_id": 1}), 0).unwrap();
    txn.commit();
    let committed = cl.capped_stats().unwrap();

    let txn = Transaction::begin(ConnectionId(1));
    cl.insert_object(&txn, json!({"_id": 2}), 0).unwrap();
    cl.insert_object(&txn, json!({"_id": 3}), 0).unwrap();
    txn.abort();

    assert_eq!(cl.capped_stats().unwrap(), committed);
    assert_counters_match(&cl);
}

#[test]
fn test_min_unsafe_key_tracks_uncommitted_transactions() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 10_000, 100);

    let t1 = Transaction::begin(ConnectionId(1));
    let t2 = Transaction::begin(ConnectionId(2));

    cl.insert_object(&t1, json!({"n": "a"}), 0).unwrap(); // pk 1
    cl.insert_object(&t2, json!({"n": "b"}), 0).unwrap(); // pk 2

    // Both in flight: nothing at or past pk 1 is safe.
    assert_eq!(cl.min_unsafe_key(), Some(IndexKey::Int(1)));

    t1.abort();
    // T2's first insert is now the boundary.
    assert_eq!(cl.min_unsafe_key(), Some(IndexKey::Int(2)));

    t2.commit();
    // Nothing in flight: the boundary is the next pk to be assigned.
    assert_eq!(cl.min_unsafe_key(), Some(IndexKey::Int(3)));
}

#[test]
fn test_tailing_below_min_unsafe_never_sees_rollback() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 1_000_000, 10_000);

    let t1 = Transaction::begin(ConnectionId(1));
    cl.insert_object(&t1, json!({"n": "doomed"}), 0).unwrap();
    let t2 = Transaction::begin(ConnectionId(2));
    cl.insert_object(&t2, json!({"n": "kept"}), 0).unwrap();
    t2.commit();

    // A tailing cursor reads strictly below the unsafe boundary.
    let unsafe_key = cl.min_unsafe_key().unwrap();
    let visible: Vec<String> = cl
        .index_snapshot(0)
        .into_iter()
        .filter(|(pk, _)| pk < &unsafe_key)
        .map(|(_, doc)| doc["n"].as_str().unwrap().to_string())
        .collect();
    // T1 is still in flight, so nothing it wrote is below the boundary.
    assert!(visible.is_empty());

    t1.abort();
    let unsafe_key = cl.min_unsafe_key().unwrap();
    let visible: Vec<String> = cl
        .index_snapshot(0)
        .into_iter()
        .filter(|(pk, _)| pk < &unsafe_key)
        .map(|(_, doc)| doc["n"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(visible, vec!["kept".to_string()]);
}

#[test]
fn test_trim_never_crosses_uncommitted_rows() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 1_000_000, 2);

    // An open transaction holds the oldest rows.
    let t1 = Transaction::begin(ConnectionId(1));
    cl.insert_object(&t1, json!({"n": 1}), 0).unwrap();
    cl.insert_object(&t1, json!({"n": 2}), 0).unwrap();

    // Another transaction gorges the collection; trimming must stop at the
    // uncommitted boundary, leaving it over its max.
    for i in 3..6 {
        let txn = Transaction::begin(ConnectionId(2));
        cl.insert_object(&txn, json!({"n": i}), 0).unwrap();
        txn.commit();
    }
    assert!(cl.find_by_pk(&IndexKey::Int(1)).unwrap().is_some());
    assert!(cl.find_by_pk(&IndexKey::Int(2)).unwrap().is_some());

    t1.commit();
    // The next committed insert can trim past the now-committed rows.
    let txn = Transaction::begin(ConnectionId(2));
    cl.insert_object(&txn, json!({"n": 6}), 0).unwrap();
    txn.commit();
    let (objects, _) = cl.capped_stats().unwrap();
    assert_eq!(objects, 2);
    assert!(cl.find_by_pk(&IndexKey::Int(1)).unwrap().is_none());
    assert_counters_match(&cl);
}

#[test]
fn test_concurrent_inserts_and_aborts_keep_counters_consistent() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", i64::MAX, 0);

    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let cl = cl.clone();
        handles.push(thread::spawn(move || {
            for i in 0..50u64 {
                let txn = Transaction::begin(ConnectionId(worker));
                cl.insert_object(&txn, json!({"w": worker, "i": i}), 0)
                    .unwrap();
                if (worker + i) % 3 == 0 {
                    txn.abort();
                } else {
                    txn.commit();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_counters_match(&cl);
    // Nothing in flight: the tail boundary equals the next pk.
    let (objects, _) = cl.capped_stats().unwrap();
    assert!(objects > 0);
    assert_eq!(cl.min_unsafe_key(), Some(IndexKey::Int(401)));
}

#[test]
fn test_capped_update_cannot_grow() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 10_000, 100);

    let txn = Transaction::begin(ConnectionId(1));
    let stored = cl
        .insert_object(&txn, json!({"_id": 1, "pad": "aaaa"}), 0)
        .unwrap();
    let pk = IndexKey::Int(1);
    let err = cl
        .update_object(
            &txn,
            &pk,
            &stored,
            &json!({"_id": 1, "pad": "aaaaaaaaaaaaaaaa"}),
            false,
            false,
            0,
        )
        .unwrap_err();
    assert!(matches!(err, GalenaError::CappedSizeViolation { .. }));

    // Shrinking is fine.
    cl.update_object(&txn, &pk, &stored, &json!({"_id": 1, "pad": "a"}), false, false, 0)
        .unwrap();
    txn.commit();
    assert_counters_match(&cl);
}

#[test]
fn test_delete_cannot_cross_trimmed_region() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 1_000_000, 2);

    for i in 0..4 {
        let txn = Transaction::begin(ConnectionId(1));
        cl.insert_object(&txn, json!({"n": i}), 0).unwrap();
        txn.commit();
    }
    // pks 1 and 2 are trimmed by now.
    let txn = Transaction::begin(ConnectionId(1));
    let err = cl
        .delete_object(&txn, &IndexKey::Int(1), &json!({"n": 0}), 0)
        .unwrap_err();
    assert!(matches!(err, GalenaError::OperationNotAllowed(_)));

    // Deleting a live row works and accounts correctly.
    let doc = cl.find_by_pk(&IndexKey::Int(4)).unwrap().unwrap();
    cl.delete_object(&txn, &IndexKey::Int(4), &doc, 0).unwrap();
    txn.commit();
    assert_counters_match(&cl);
}

#[test]
fn test_capped_unique_secondary_checked_before_insert() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let txn = Transaction::begin(ConnectionId(1));
    let cl = map
        .create_collection(
            &txn,
            "test.capped",
            json!({"capped": true, "size": 100_000, "autoIndexId": true}),
        )
        .unwrap();
    txn.commit();

    let txn = Transaction::begin(ConnectionId(1));
    cl.insert_object(&txn, json!({"_id": "k"}), 0).unwrap();
    let err = cl.insert_object(&txn, json!({"_id": "k"}), 0).unwrap_err();
    assert!(matches!(err, GalenaError::DuplicateKey { .. }));
    txn.commit();
    assert_counters_match(&cl);
}

#[test]
fn test_insert_with_pk_replay() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 1_000_000, 0);

    let txn = Transaction::begin(ConnectionId(1));
    cl.insert_object_with_pk(&txn, 7, &json!({"n": "replayed"}), 0)
        .unwrap();
    txn.commit();

    assert!(cl.find_by_pk(&IndexKey::Int(7)).unwrap().is_some());
    // The pk counter moved past the replayed key.
    let txn = Transaction::begin(ConnectionId(1));
    cl.insert_object(&txn, json!({"n": "next"}), 0).unwrap();
    txn.commit();
    assert!(cl.find_by_pk(&IndexKey::Int(8)).unwrap().is_some());
    assert_counters_match(&cl);
}

#[test]
fn test_empty_resets_collection() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let cl = capped_collection(&map, "test.capped", 1_000_000, 0);

    let txn = Transaction::begin(ConnectionId(1));
    for i in 0..5 {
        cl.insert_object(&txn, json!({"n": i}), 0).unwrap();
    }
    txn.commit();

    let txn = Transaction::begin(ConnectionId(1));
    cl.empty(&txn).unwrap();
    txn.commit();
    assert_eq!(cl.capped_stats().unwrap().0, 0);
    assert_eq!(cl.index_entry_count(0), 0);
    assert_counters_match(&cl);
}

#[test]
fn test_profile_collection_rejects_updates_and_logops() {
    let engine = MemEngine::new();
    let map = test_map(&engine, "test");
    let txn = Transaction::begin(ConnectionId(1));
    let profile = map
        .get_or_create(&txn, "test.system.profile", false)
        .unwrap();

    // Profile inserts keep the document as-is: no _id is added.
    let stored = profile
        .insert_object(&txn, json!({"op": "query", "millis": 5}), 0)
        .unwrap();
    assert!(stored.get("_id").is_none());

    let err = profile
        .update_object(
            &txn,
            &IndexKey::Int(1),
            &stored,
            &json!({"op": "query", "millis": 6}),
            false,
            false,
            0,
        )
        .unwrap_err();
    assert!(matches!(err, GalenaError::OperationNotAllowed(_)));

    let err = profile
        .insert_object_and_log_ops(&txn, json!({"op": "x"}), 0)
        .unwrap_err();
    assert!(matches!(err, GalenaError::OperationNotAllowed(_)));
    txn.commit();

    assert!(profile.is_capped());
}

#[test]
fn test_reopen_restores_capped_state() {
    let engine = MemEngine::new();
    {
        let map = test_map(&engine, "test");
        let cl = capped_collection(&map, "test.capped", 1_000_000, 10);
        let txn = Transaction::begin(ConnectionId(1));
        for i in 0..4 {
            cl.insert_object(&txn, json!({"n": i}), 0).unwrap();
        }
        txn.commit();
        map.close_all();
    }

    let map = test_map(&engine, "test");
    let cl = map.collection("test.capped").unwrap().unwrap();
    assert!(cl.is_capped());
    assert_counters_match(&cl);
    // The pk counter resumes after the highest stored key.
    let txn = Transaction::begin(ConnectionId(1));
    cl.insert_object(&txn, json!({"n": 99}), 0).unwrap();
    txn.commit();
    assert!(cl.find_by_pk(&IndexKey::Int(5)).unwrap().is_some());
}
