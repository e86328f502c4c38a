// galena-core/src/collection/bulk.rs
// Bulk-loaded collections: a write-only facade over an indexed collection
// whose rows flow through the engine's bulk loader. The namespace is pinned
// to the connection that began the load until commit or abort.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::collection::base::CollectionBase;
use crate::collection::indexer::check_index_uniqueness;
use crate::error::{GalenaError, Result};
use crate::key::IndexKey;
use crate::log_debug;
use crate::storage::BulkLoader;
use crate::txn::ConnectionId;
use serde_json::Value;

pub(crate) struct BulkLoadDetails {
    connection: ConnectionId,
    // Torn down before dictionary handles on close; see close().
    loader: Mutex<Option<Box<dyn BulkLoader>>>,
    multikey_trackers: Vec<AtomicBool>,
}

impl BulkLoadDetails {
    pub(crate) fn new(
        base: &CollectionBase,
        connection: ConnectionId,
    ) -> Result<BulkLoadDetails> {
        let indexes = base.indexes.read().clone();
        for idx in &indexes {
            if !idx.dict().is_empty() {
                return Err(GalenaError::OperationNotAllowed(format!(
                    "cannot bulk load {}: index {} is not empty",
                    base.ns,
                    idx.name()
                )));
            }
        }
        let dicts = indexes.iter().map(|i| i.dict().clone()).collect();
        let loader = base.engine.begin_load(dicts)?;
        Ok(BulkLoadDetails {
            connection,
            loader: Mutex::new(Some(loader)),
            multikey_trackers: indexes.iter().map(|_| AtomicBool::new(false)).collect(),
        })
    }

    /// Every operation on a bulk-loaded namespace must come from the
    /// connection that began the load.
    pub(crate) fn validate_connection(&self, ns: &str, conn: ConnectionId) -> Result<()> {
        if conn != self.connection {
            return Err(GalenaError::BulkLoadConflict(ns.to_string()));
        }
        Ok(())
    }
}

/// Push one document through the loader: the primary row plus every
/// secondary entry, tracking multikey per index.
pub(crate) fn insert_object(
    base: &CollectionBase,
    bulk: &BulkLoadDetails,
    pk_key: &IndexKey,
    obj: &Value,
) -> Result<()> {
    let indexes = base.indexes.read().clone();
    let mut loader = bulk.loader.lock();
    let loader = loader
        .as_mut()
        .ok_or_else(|| GalenaError::OperationNotAllowed(format!("{} load is closed", base.ns)))?;

    loader.put(0, pk_key.clone(), obj.clone())?;
    for (i, idx) in indexes.iter().enumerate().skip(1) {
        let keys = idx.generate_keys(obj)?;
        if keys.len() > 1 {
            bulk.multikey_trackers[i].store(true, Ordering::SeqCst);
        }
        for key in keys {
            loader.put(i, key.with_pk(pk_key), Value::Null)?;
        }
    }
    Ok(())
}

/// Close the load. The loader goes first (it references the dictionaries),
/// then, on commit, uniqueness is verified and multikey bits land.
pub(crate) fn close(
    base: &CollectionBase,
    bulk: &BulkLoadDetails,
    aborting: bool,
) -> Result<()> {
    let Some(loader) = bulk.loader.lock().take() else {
        return Ok(());
    };
    if aborting {
        log_debug!("aborting bulk load of {}", base.ns);
        loader.abort();
        return Ok(());
    }

    loader.close()?;
    let indexes = base.indexes.read().clone();
    for (i, idx) in indexes.iter().enumerate() {
        if i > 0 && idx.is_unique() {
            check_index_uniqueness(idx)?;
        }
        if bulk.multikey_trackers[i].load(Ordering::SeqCst) {
            base.set_index_is_multikey(i);
        }
    }
    base.persist_metadata()?;
    log_debug!("committed bulk load of {}", base.ns);
    Ok(())
}
