//! Replication wiring: oplog entries keyed by GTID, commit-time flushes,
//! and the tailable watermark over the oplog.

use serde_json::json;
use std::sync::Arc;

use galena_core::collection::map::CollectionMap;
use galena_core::gtid::{Gtid, GtidManager};
use galena_core::storage::{DictionaryEngine, MemEngine};
use galena_core::txn::{ConnectionId, Transaction};
use galena_core::{Collection, IndexKey};

struct Repl {
    map: CollectionMap,
    local: CollectionMap,
    oplog: Arc<Collection>,
    gtids: Arc<GtidManager>,
}

fn repl_setup(engine: &Arc<MemEngine>) -> Repl {
    let engine: Arc<dyn DictionaryEngine> = engine.clone();
    let gtids = Arc::new(GtidManager::new(Gtid::ZERO));
    let local = CollectionMap::new(engine.clone(), "local", gtids.clone());
    let txn = Transaction::begin(ConnectionId(0));
    let oplog = local.get_or_create(&txn, "local.oplog.rs", false).unwrap();
    txn.commit();

    let map = CollectionMap::new(engine, "test", gtids.clone());
    map.set_oplog(oplog.clone());
    Repl {
        map,
        local,
        oplog,
        gtids,
    }
}

#[test]
fn test_commit_flushes_ops_under_fresh_gtid() {
    let engine = MemEngine::new();
    let repl = repl_setup(&engine);

    let txn = Transaction::begin(ConnectionId(1));
    let cl = repl.map.get_or_create(&txn, "test.things", true).unwrap();
    cl.insert_object_and_log_ops(&txn, json!({"_id": 1, "a": 10}), 0)
        .unwrap();
    cl.insert_object_and_log_ops(&txn, json!({"_id": 2, "a": 20}), 0)
        .unwrap();
    repl.map.commit_txn(txn).unwrap();

    assert_eq!(repl.oplog.index_entry_count(0), 1);
    let (_, entry) = &repl.oplog.index_snapshot(0)[0];
    assert_eq!(entry["_id"], json!({"p": 0, "t": 1}));
    let ops = entry["ops"].as_array().unwrap();
    // get_or_create logged a comment, then two inserts.
    assert_eq!(ops.len(), 3);
    assert_eq!(ops[0]["op"], "n");
    assert_eq!(ops[1]["op"], "i");
    assert_eq!(ops[1]["ns"], "test.things");
    assert_eq!(ops[1]["o"], json!({"_id": 1, "a": 10}));
    assert_eq!(ops[2]["o"]["_id"], 2);

    // The GTID was completed: nothing is in flight.
    let (min_live, _) = repl.gtids.get_mins();
    assert_eq!(min_live, Gtid::new(0, 2));
}

#[test]
fn test_abort_discards_buffered_ops() {
    let engine = MemEngine::new();
    let repl = repl_setup(&engine);

    let txn = Transaction::begin(ConnectionId(1));
    let cl = repl.map.get_or_create(&txn, "test.things", false).unwrap();
    cl.insert_object_and_log_ops(&txn, json!({"_id": 1}), 0).unwrap();
    repl.map.abort_txn(txn);

    assert_eq!(repl.oplog.index_entry_count(0), 0);
    assert_eq!(cl.index_entry_count(0), 0);
}

#[test]
fn test_oplog_writes_are_never_relogged() {
    let engine = MemEngine::new();
    let repl = repl_setup(&engine);

    let txn = Transaction::begin(ConnectionId(1));
    let cl = repl.map.get_or_create(&txn, "test.things", false).unwrap();
    cl.insert_object_and_log_ops(&txn, json!({"_id": 1}), 0).unwrap();
    repl.map.commit_txn(txn).unwrap();

    // The oplog collection lives under local.*; writing the entry must not
    // have buffered further ops anywhere.
    assert_eq!(repl.oplog.index_entry_count(0), 1);

    let txn = Transaction::begin(ConnectionId(1));
    let cl2 = repl.local.get_or_create(&txn, "local.me", false).unwrap();
    cl2.insert_object_and_log_ops(&txn, json!({"_id": "host"}), 0)
        .unwrap();
    assert!(!txn.has_repl_ops());
    repl.local.commit_txn(txn).unwrap();
    assert_eq!(repl.oplog.index_entry_count(0), 1);
}

#[test]
fn test_oplog_entries_order_by_gtid_bytes() {
    let engine = MemEngine::new();
    let repl = repl_setup(&engine);

    for i in 0..5 {
        let txn = Transaction::begin(ConnectionId(1));
        let cl = repl.map.get_or_create(&txn, "test.things", false).unwrap();
        cl.insert_object_and_log_ops(&txn, json!({"_id": i}), 0).unwrap();
        repl.map.commit_txn(txn).unwrap();
    }

    let entries = repl.oplog.index_snapshot(0);
    assert_eq!(entries.len(), 5);
    let gtids: Vec<u64> = entries
        .iter()
        .map(|(_, doc)| doc["_id"]["t"].as_u64().unwrap())
        .collect();
    assert_eq!(gtids, vec![1, 2, 3, 4, 5]);
    // Bytewise pk order equals numeric GTID order.
    let pks: Vec<&IndexKey> = entries.iter().map(|(k, _)| k).collect();
    for pair in pks.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn test_oplog_min_unsafe_key_follows_min_live() {
    let engine = MemEngine::new();
    let repl = repl_setup(&engine);

    // Nothing in flight: the watermark is the next GTID to hand out.
    assert_eq!(
        repl.oplog.min_unsafe_key(),
        Some(IndexKey::Bytes(Gtid::new(0, 1).to_bytes().to_vec()))
    );

    let a = repl.gtids.get_gtid_for_primary();
    let b = repl.gtids.get_gtid_for_primary();
    assert_eq!(
        repl.oplog.min_unsafe_key(),
        Some(IndexKey::Bytes(a.to_bytes().to_vec()))
    );

    repl.gtids.note_live_gtid_done(a);
    assert_eq!(
        repl.oplog.min_unsafe_key(),
        Some(IndexKey::Bytes(b.to_bytes().to_vec()))
    );
    repl.gtids.note_live_gtid_done(b);
}

#[test]
fn test_optimize_pk_over_trimmed_range() {
    let engine = MemEngine::new();
    let repl = repl_setup(&engine);

    for i in 0..10 {
        let txn = Transaction::begin(ConnectionId(1));
        let cl = repl.map.get_or_create(&txn, "test.things", false).unwrap();
        cl.insert_object_and_log_ops(&txn, json!({"_id": i}), 0).unwrap();
        repl.map.commit_txn(txn).unwrap();
    }

    let loops = repl
        .oplog
        .optimize_pk(Gtid::ZERO, Gtid::new(0, 5), 1000)
        .unwrap();
    assert_eq!(loops, 5);

    // Only the oplog supports pk-range optimization.
    let cl = repl.map.collection("test.things").unwrap().unwrap();
    assert!(cl.optimize_pk(Gtid::ZERO, Gtid::new(0, 5), 1000).is_err());
}

#[test]
fn test_oplog_is_tailable_but_not_capped() {
    let engine = MemEngine::new();
    let repl = repl_setup(&engine);
    assert!(!repl.oplog.is_capped());
    assert!(!repl.oplog.bulk_loading());
    assert!(repl.oplog.min_unsafe_key().is_some());
}
