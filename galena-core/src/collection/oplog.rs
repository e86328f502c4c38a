// galena-core/src/collection/oplog.rs
// Oplog primary keys are GTIDs: the entry document carries {_id: {p, t}}
// and the dictionary key is the 16-byte big-endian encoding, so bytewise
// key order equals replication order.

use serde_json::{json, Value};

use crate::error::{GalenaError, Result};
use crate::gtid::Gtid;
use crate::key::IndexKey;

pub(crate) fn pk_for_gtid(gtid: Gtid) -> IndexKey {
    IndexKey::Bytes(gtid.to_bytes().to_vec())
}

/// Build the oplog entry for one committed transaction's buffered ops.
pub(crate) fn entry_for_txn(gtid: Gtid, ops: Vec<Value>) -> Value {
    json!({
        "_id": {"p": gtid.primary_seq(), "t": gtid.gt_seq()},
        "ops": ops,
    })
}

/// Extract the GTID primary key from an oplog entry document.
pub(crate) fn pk_from_entry(entry: &Value) -> Result<IndexKey> {
    let id = entry.get("_id").ok_or_else(|| GalenaError::InvalidPKField {
        field: "_id".to_string(),
        reason: "oplog entries carry a GTID _id".to_string(),
    })?;
    let (Some(p), Some(t)) = (
        id.get("p").and_then(|v| v.as_u64()),
        id.get("t").and_then(|v| v.as_u64()),
    ) else {
        return Err(GalenaError::InvalidPKField {
            field: "_id".to_string(),
            reason: "oplog _id must be {p, t}".to_string(),
        });
    };
    Ok(pk_for_gtid(Gtid::new(p, t)))
}

/// Recover the GTID from an oplog primary key.
pub fn gtid_from_pk(pk: &IndexKey) -> Option<Gtid> {
    match pk {
        IndexKey::Bytes(bytes) if bytes.len() == crate::gtid::GTID_BINARY_SIZE => {
            Some(Gtid::from_bytes(bytes))
        }
        _ => None,
    }
}
