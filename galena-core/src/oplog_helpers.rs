// galena-core/src/oplog_helpers.rs
// Builders for replication log entries. Ops buffer on the transaction and
// are flushed to the oplog under a fresh GTID at commit (see
// CollectionMap::commit_txn). Writes to local.* namespaces are never logged.

use serde_json::{json, Value};

use crate::txn::Transaction;

pub const OP_INSERT: &str = "i";
pub const OP_CAPPED_INSERT: &str = "ci";
pub const OP_UPDATE: &str = "u";
pub const OP_UPDATE_MODS: &str = "um";
pub const OP_DELETE: &str = "d";
pub const OP_CAPPED_DELETE: &str = "cd";
pub const OP_COMMENT: &str = "n";

fn is_local_ns(ns: &str) -> bool {
    ns.starts_with("local.")
}

pub fn log_comment(txn: &Transaction, comment: &Value) {
    txn.log_op_for_replication(json!({
        "op": OP_COMMENT,
        "o": comment,
    }));
}

pub fn log_insert(txn: &Transaction, ns: &str, row: &Value) {
    if is_local_ns(ns) {
        return;
    }
    txn.log_op_for_replication(json!({
        "op": OP_INSERT,
        "ns": ns,
        "o": row,
    }));
}

pub fn log_insert_for_capped(txn: &Transaction, ns: &str, pk: &Value, row: &Value) {
    if is_local_ns(ns) {
        return;
    }
    txn.log_op_for_replication(json!({
        "op": OP_CAPPED_INSERT,
        "ns": ns,
        "pk": pk,
        "o": row,
    }));
}

pub fn log_update(
    txn: &Transaction,
    ns: &str,
    pk: &Value,
    old_row: &Value,
    new_row: &Value,
    from_migrate: bool,
) {
    if is_local_ns(ns) {
        return;
    }
    let mut entry = json!({
        "op": OP_UPDATE,
        "ns": ns,
        "pk": pk,
        "o": old_row,
        "o2": new_row,
    });
    if from_migrate {
        entry["fromMigrate"] = Value::Bool(true);
    }
    txn.log_op_for_replication(entry);
}

pub fn log_update_mods(
    txn: &Transaction,
    ns: &str,
    pk: &Value,
    mods: &Value,
    from_migrate: bool,
) {
    if is_local_ns(ns) {
        return;
    }
    let mut entry = json!({
        "op": OP_UPDATE_MODS,
        "ns": ns,
        "pk": pk,
        "m": mods,
    });
    if from_migrate {
        entry["fromMigrate"] = Value::Bool(true);
    }
    txn.log_op_for_replication(entry);
}

pub fn log_delete(txn: &Transaction, ns: &str, row: &Value, from_migrate: bool) {
    if is_local_ns(ns) {
        return;
    }
    let mut entry = json!({
        "op": OP_DELETE,
        "ns": ns,
        "o": row,
    });
    if from_migrate {
        entry["fromMigrate"] = Value::Bool(true);
    }
    txn.log_op_for_replication(entry);
}

pub fn log_delete_for_capped(txn: &Transaction, ns: &str, pk: &Value, row: &Value) {
    if is_local_ns(ns) {
        return;
    }
    txn.log_op_for_replication(json!({
        "op": OP_CAPPED_DELETE,
        "ns": ns,
        "pk": pk,
        "o": row,
    }));
}
