// galena-core/src/collection/map.rs
// Per-database namespace -> collection registry. Threads obtain collections
// here; creation is serialized by the map's write lock and idempotent.
// DDL (create, drop, rename), the namespaces/indexes catalogs, the bulk-load
// control surface and transaction commit (with oplog flush) all live here.

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::collection::{oplog, system, Collection};
use crate::error::{GalenaError, Result};
use crate::gtid::GtidManager;
use crate::key::IndexKey;
use crate::log_info;
use crate::oplog_helpers;
use crate::storage::DictionaryEngine;
use crate::txn::{ConnectionId, Transaction};

pub struct CollectionMap {
    engine: Arc<dyn DictionaryEngine>,
    db: String,
    gtids: Arc<GtidManager>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    // The replication oplog this database's committed ops flush into.
    oplog: RwLock<Option<Arc<Collection>>>,
}

impl CollectionMap {
    pub fn new(
        engine: Arc<dyn DictionaryEngine>,
        db: &str,
        gtids: Arc<GtidManager>,
    ) -> CollectionMap {
        CollectionMap {
            engine,
            db: db.to_string(),
            gtids,
            collections: RwLock::new(HashMap::new()),
            oplog: RwLock::new(None),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn gtid_manager(&self) -> &Arc<GtidManager> {
        &self.gtids
    }

    /// Wire the oplog collection committed ops should flush into.
    pub fn set_oplog(&self, oplog: Arc<Collection>) {
        *self.oplog.write() = Some(oplog);
    }

    fn check_ns(&self, ns: &str) -> Result<()> {
        let prefix = format!("{}.", self.db);
        if !ns.starts_with(&prefix) {
            return Err(GalenaError::OperationNotAllowed(format!(
                "namespace {} does not belong to database {}",
                ns, self.db
            )));
        }
        Ok(())
    }

    /// Get a collection, opening it from serialized metadata if necessary.
    /// Does not create.
    pub fn collection(&self, ns: &str) -> Result<Option<Arc<Collection>>> {
        self.check_ns(ns)?;
        if let Some(cl) = self.collections.read().get(ns) {
            return Ok(Some(cl.clone()));
        }
        let Some(serialized) = self.engine.get_metadata(ns)? else {
            return Ok(None);
        };
        let mut map = self.collections.write();
        if let Some(cl) = map.get(ns) {
            return Ok(Some(cl.clone()));
        }
        let bulk_load = serialized
            .get("bulkLoad")
            .and_then(|b| b.as_bool())
            .unwrap_or(false);
        if bulk_load {
            return Err(GalenaError::BulkLoadConflict(ns.to_string()));
        }
        let cl = Collection::open(
            self.engine.clone(),
            self.gtids.clone(),
            &serialized,
            false,
            None,
        )?;
        map.insert(ns.to_string(), cl.clone());
        Ok(Some(cl))
    }

    /// Get a collection, creating it with default options on first use.
    /// Inserts, upsert-style updates and ensure_index go through this.
    pub fn get_or_create(
        &self,
        txn: &Transaction,
        ns: &str,
        logop: bool,
    ) -> Result<Arc<Collection>> {
        if let Some(cl) = self.collection(ns)? {
            return Ok(cl);
        }
        self.create_ns(txn, ns, json!({}), logop, true)
    }

    /// User-visible DDL create. Fails if the namespace exists or is a
    /// protected system namespace.
    pub fn create_collection(
        &self,
        txn: &Transaction,
        ns: &str,
        options: Value,
    ) -> Result<Arc<Collection>> {
        self.check_ns(ns)?;
        if ns.contains(".system.") && !system::legal_client_system_ns(ns) {
            return Err(GalenaError::SystemNamespaceProtected(ns.to_string()));
        }
        if self.collection(ns)?.is_some() {
            return Err(GalenaError::NamespaceExists(ns.to_string()));
        }
        self.create_ns(txn, ns, options, true, false)
    }

    fn create_ns(
        &self,
        txn: &Transaction,
        ns: &str,
        options: Value,
        logop: bool,
        if_missing: bool,
    ) -> Result<Arc<Collection>> {
        self.check_ns(ns)?;
        let cl = {
            let mut map = self.collections.write();
            if let Some(existing) = map.get(ns) {
                if if_missing {
                    return Ok(existing.clone());
                }
                return Err(GalenaError::NamespaceExists(ns.to_string()));
            }
            let cl = Collection::create(
                self.engine.clone(),
                self.gtids.clone(),
                ns,
                options.clone(),
            )?;
            map.insert(ns.to_string(), cl.clone());
            cl
        };
        log_info!("created collection {}", ns);

        // System catalogs do not list themselves.
        if !system::is_system_catalog_collection(ns) {
            self.add_to_namespaces_catalog(txn, ns, &options)?;
            self.add_default_indexes_to_catalog(txn, &cl)?;
        }
        if logop {
            oplog_helpers::log_comment(txn, &json!({"create": ns}));
        }
        Ok(cl)
    }

    // ========== CATALOG MAINTENANCE ==========

    fn namespaces_catalog_ns(&self) -> String {
        format!("{}.system.namespaces", self.db)
    }

    fn indexes_catalog_ns(&self) -> String {
        format!("{}.system.indexes", self.db)
    }

    /// Add an entry to the namespaces catalog.
    pub fn add_to_namespaces_catalog(
        &self,
        txn: &Transaction,
        name: &str,
        options: &Value,
    ) -> Result<()> {
        let catalog = self.get_or_create(txn, &self.namespaces_catalog_ns(), false)?;
        let mut entry = json!({"name": name});
        if options.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            entry["options"] = options.clone();
        }
        catalog.insert_object(txn, entry, 0)?;
        Ok(())
    }

    /// Add an index spec to the indexes catalog.
    pub fn add_to_indexes_catalog(&self, txn: &Transaction, info: &Value) -> Result<()> {
        let catalog = self.get_or_create(txn, &self.indexes_catalog_ns(), false)?;
        catalog.insert_object(txn, info.clone(), 0)?;
        Ok(())
    }

    /// Record a new collection's primary key (and automatic _id) index in
    /// the indexes catalog. Secondary builds go through the normal insert
    /// path instead.
    fn add_default_indexes_to_catalog(
        &self,
        txn: &Transaction,
        cl: &Arc<Collection>,
    ) -> Result<()> {
        for idx_no in 0..cl.n_indexes() {
            let info = cl.serialize(false)["indexes"][idx_no].clone();
            self.add_to_indexes_catalog(txn, &info)?;
        }
        Ok(())
    }

    /// Delete every row of a catalog whose `field` equals `value`.
    fn scrub_catalog(
        &self,
        txn: &Transaction,
        catalog_ns: &str,
        field: &str,
        value: &str,
    ) -> Result<()> {
        let Some(catalog) = self.collection(catalog_ns)? else {
            return Ok(());
        };
        let rows: Vec<(IndexKey, Value)> = catalog
            .find_rows(|doc| doc.get(field).and_then(|v| v.as_str()) == Some(value))?;
        for (pk_key, doc) in rows {
            catalog.delete_object(txn, &pk_key, &doc, 0)?;
        }
        Ok(())
    }

    // ========== DDL ==========

    /// Drop a collection: its storage, catalog rows and map entry.
    pub fn drop_collection(
        &self,
        txn: &Transaction,
        ns: &str,
        may_drop_system: bool,
    ) -> Result<()> {
        self.check_ns(ns)?;
        if ns.contains(".system.") && !may_drop_system {
            return Err(GalenaError::SystemNamespaceProtected(ns.to_string()));
        }
        let cl = self
            .collection(ns)?
            .ok_or_else(|| GalenaError::NamespaceMissing(ns.to_string()))?;
        if cl.bulk_loading() {
            return Err(GalenaError::BulkLoadConflict(ns.to_string()));
        }

        self.scrub_catalog(txn, &self.indexes_catalog_ns(), "ns", ns)?;
        self.scrub_catalog(txn, &self.namespaces_catalog_ns(), "name", ns)?;
        cl.drop_storage()?;
        self.collections.write().remove(ns);
        log_info!("dropped collection {}", ns);
        Ok(())
    }

    /// Rename a namespace within this database. Storage moves by dictionary
    /// rename; catalog rows are rewritten.
    pub fn rename_collection(&self, txn: &Transaction, from: &str, to: &str) -> Result<()> {
        self.check_ns(from)?;
        self.check_ns(to)?;
        let cl = self
            .collection(from)?
            .ok_or_else(|| GalenaError::NamespaceMissing(from.to_string()))?;
        if cl.bulk_loading() {
            return Err(GalenaError::BulkLoadConflict(from.to_string()));
        }
        if self.collection(to)?.is_some() {
            return Err(GalenaError::NamespaceExists(to.to_string()));
        }

        let mut serialized = cl.serialize(false);
        cl.close(false)?;
        self.collections.write().remove(from);

        serialized["ns"] = Value::String(to.to_string());
        let index_names: Vec<String> = serialized["indexes"]
            .as_array()
            .map(|infos| {
                infos
                    .iter()
                    .filter_map(|i| i["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(infos) = serialized["indexes"].as_array_mut() {
            for info in infos {
                info["ns"] = Value::String(to.to_string());
            }
        }
        for name in &index_names {
            self.engine.rename_dictionary(
                &format!("{}.${}", from, name),
                &format!("{}.${}", to, name),
            )?;
        }
        self.engine.delete_metadata(from)?;
        self.engine.put_metadata(to, serialized.clone())?;

        self.scrub_catalog(txn, &self.indexes_catalog_ns(), "ns", from)?;
        self.scrub_catalog(txn, &self.namespaces_catalog_ns(), "name", from)?;
        let reopened = Collection::open(
            self.engine.clone(),
            self.gtids.clone(),
            &serialized,
            false,
            None,
        )?;
        self.collections
            .write()
            .insert(to.to_string(), reopened.clone());
        self.add_to_namespaces_catalog(txn, to, reopened.options())?;
        self.add_default_indexes_to_catalog(txn, &reopened)?;
        log_info!("renamed {} to {}", from, to);
        Ok(())
    }

    // ========== BULK LOAD ==========

    /// Begin a bulk load: the namespace must exist and be empty. The
    /// reopened instance is pinned to `connection` until commit or abort.
    pub fn begin_bulk_load(
        &self,
        ns: &str,
        indexes: &[Value],
        _options: &Value,
        connection: ConnectionId,
    ) -> Result<()> {
        let cl = self
            .collection(ns)?
            .ok_or_else(|| GalenaError::NamespaceMissing(ns.to_string()))?;
        if cl.bulk_loading() {
            return Err(GalenaError::BulkLoadConflict(ns.to_string()));
        }
        if cl.is_capped() {
            return Err(GalenaError::OperationNotAllowed(format!(
                "cannot bulk load capped collection {}",
                ns
            )));
        }
        if cl.stats().count > 0 {
            return Err(GalenaError::OperationNotAllowed(format!(
                "cannot bulk load {}: namespace is not empty",
                ns
            )));
        }
        for info in indexes {
            cl.ensure_index(info)?;
        }

        let serialized = cl.serialize(false);
        cl.close(false)?;
        let loaded = Collection::open(
            self.engine.clone(),
            self.gtids.clone(),
            &serialized,
            true,
            Some(connection),
        )?;
        self.engine.put_metadata(ns, loaded.serialize(false))?;
        self.collections.write().insert(ns.to_string(), loaded);
        log_info!("began bulk load of {}", ns);
        Ok(())
    }

    pub fn commit_bulk_load(&self, ns: &str) -> Result<()> {
        self.finish_bulk_load(ns, false)
    }

    pub fn abort_bulk_load(&self, ns: &str) -> Result<()> {
        self.finish_bulk_load(ns, true)
    }

    fn finish_bulk_load(&self, ns: &str, aborting: bool) -> Result<()> {
        self.check_ns(ns)?;
        let cl = self
            .collections
            .read()
            .get(ns)
            .cloned()
            .ok_or_else(|| GalenaError::NamespaceMissing(ns.to_string()))?;
        if !cl.bulk_loading() {
            return Err(GalenaError::OperationNotAllowed(format!(
                "{} is not being bulk loaded",
                ns
            )));
        }
        // close() tears the loader down first and, on commit, persists the
        // final metadata (multikey bits included).
        let fallback = cl.serialize(false);
        cl.close(aborting)?;
        let mut serialized = self.engine.get_metadata(ns)?.unwrap_or(fallback);
        serialized.as_object_mut().and_then(|o| o.remove("bulkLoad"));
        self.engine.put_metadata(ns, serialized.clone())?;
        let reopened = Collection::open(
            self.engine.clone(),
            self.gtids.clone(),
            &serialized,
            false,
            None,
        )?;
        self.collections.write().insert(ns.to_string(), reopened);
        log_info!(
            "{} bulk load of {}",
            if aborting { "aborted" } else { "committed" },
            ns
        );
        Ok(())
    }

    // ========== TRANSACTIONS ==========

    /// Commit a transaction. Buffered replication ops flush to the oplog
    /// under a freshly allocated GTID, which is completed once the commit
    /// (or the failure path) settles.
    pub fn commit_txn(&self, txn: Transaction) -> Result<()> {
        let ops = txn.take_repl_ops();
        if !ops.is_empty() {
            if let Some(oplog_cl) = self.oplog.read().clone() {
                let gtid = self.gtids.get_gtid_for_primary();
                let entry = oplog::entry_for_txn(gtid, ops);
                match oplog_cl.insert_object(&txn, entry, 0) {
                    Ok(_) => {
                        txn.commit();
                        self.gtids.note_live_gtid_done(gtid);
                        return Ok(());
                    }
                    Err(e) => {
                        txn.abort();
                        self.gtids.note_live_gtid_done(gtid);
                        return Err(e);
                    }
                }
            }
        }
        txn.commit();
        Ok(())
    }

    pub fn abort_txn(&self, txn: Transaction) {
        txn.abort();
    }

    // ========== LIFECYCLE ==========

    /// Close every open collection, aborting any in-flight bulk load.
    pub fn close_all(&self) {
        let mut map = self.collections.write();
        for (ns, cl) in map.drain() {
            let aborting = cl.bulk_loading();
            if let Err(e) = cl.close(aborting) {
                log_info!("error closing {}: {}", ns, e);
            }
        }
    }
}
