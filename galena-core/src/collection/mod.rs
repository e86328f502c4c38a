// galena-core/src/collection/mod.rs
// The collection facade: one struct, one flavor tag. All flavors share the
// CollectionBase write path; the tag carries per-flavor state (natural-order
// counters, capped accounting, the bulk loader, the GTID manager link) and
// decides pk strategy, insert policy, update allowance and tailability.

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub mod base;
pub mod bulk;
pub mod capped;
pub mod indexer;
pub mod map;
pub mod oplog;
pub mod system;

use crate::document::new_object_id;
use crate::error::{GalenaError, Result};
use crate::gtid::{Gtid, GtidManager};
use crate::index_details::normalize_info;
use crate::key::IndexKey;
use crate::log_warn;
use crate::oplog_helpers;
use crate::query_cache::QueryCache;
use crate::storage::DictionaryEngine;
use crate::txn::{ConnectionId, Transaction};

use base::{CollectionBase, CollectionStats, N_INDEXES_MAX};
use bulk::BulkLoadDetails;
use capped::CappedDetails;
use indexer::Indexer;

// Write flags. Performance knobs; use with caution.
/// Skip row locks in the engine.
pub const NO_LOCKTREE: u64 = 1;
/// Skip uniqueness checks on all keys.
pub const NO_UNIQUE_CHECKS: u64 = 2;
/// Caller asserts an update leaves every secondary index untouched.
pub const KEYS_UNAFFECTED_HINT: u64 = 4;
/// Skip uniqueness checks on the primary key only.
pub const NO_PK_UNIQUE_CHECKS: u64 = 8;

struct NaturalDetails {
    next_pk: AtomicI64,
}

impl NaturalDetails {
    fn new(next_pk: i64) -> NaturalDetails {
        NaturalDetails {
            next_pk: AtomicI64::new(next_pk),
        }
    }

    fn next(&self) -> i64 {
        self.next_pk.fetch_add(1, Ordering::SeqCst)
    }
}

enum Flavor {
    Indexed { id_pk: bool },
    SystemUsers { id_pk: bool },
    SystemCatalog(NaturalDetails),
    NaturalOrder(NaturalDetails),
    Capped(Arc<CappedDetails>),
    Profile(Arc<CappedDetails>),
    Oplog(Arc<GtidManager>),
    BulkLoad(BulkLoadDetails),
}

pub struct Collection {
    base: CollectionBase,
    flavor: Flavor,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("ns", &self.base.ns).finish()
    }
}

fn id_pk_pattern() -> Value {
    json!({"_id": 1})
}

fn natural_pk_pattern() -> Value {
    json!({"$": 1})
}

fn pk_pattern_from_options(options: &Value) -> Value {
    options
        .get("primaryKey")
        .cloned()
        .unwrap_or_else(id_pk_pattern)
}

impl Collection {
    /// Create a collection from user DDL (or auto-creation). The flavor is
    /// chosen from the namespace and options.
    pub fn create(
        engine: Arc<dyn DictionaryEngine>,
        gtids: Arc<GtidManager>,
        ns: &str,
        options: Value,
    ) -> Result<Arc<Collection>> {
        if !ns.contains('.') {
            return Err(GalenaError::InvalidOptions(format!(
                "namespace {} is not of the form db.collection",
                ns
            )));
        }
        let capped = options
            .get("capped")
            .and_then(|c| c.as_bool())
            .unwrap_or(false);

        let collection = if system::is_oplog_collection(ns) {
            let base = CollectionBase::new(engine, ns, id_pk_pattern(), options)?;
            Collection {
                base,
                flavor: Flavor::Oplog(gtids),
            }
        } else if system::is_system_catalog_collection(ns) {
            let base = CollectionBase::new(engine, ns, natural_pk_pattern(), options)?;
            Collection {
                base,
                flavor: Flavor::SystemCatalog(NaturalDetails::new(1)),
            }
        } else if system::is_profile_collection(ns) {
            let (base, cap) = Self::new_capped_parts(engine, ns, options)?;
            Collection {
                base,
                flavor: Flavor::Profile(cap),
            }
        } else if capped {
            let auto_index_id = options
                .get("autoIndexId")
                .and_then(|a| a.as_bool())
                .unwrap_or(false);
            let (base, cap) = Self::new_capped_parts(engine, ns, options)?;
            let collection = Collection {
                base,
                flavor: Flavor::Capped(cap),
            };
            if auto_index_id {
                collection.build_index_cold(&json!({
                    "key": id_pk_pattern(),
                    "unique": true,
                    "name": "_id_",
                }))?;
            }
            collection
        } else if options
            .get("natural")
            .and_then(|n| n.as_bool())
            .unwrap_or(false)
        {
            let base = CollectionBase::new(engine, ns, natural_pk_pattern(), options)?;
            Collection {
                base,
                flavor: Flavor::NaturalOrder(NaturalDetails::new(1)),
            }
        } else if system::is_system_users_collection(ns) {
            let pk = pk_pattern_from_options(&options);
            let id_pk = pk == id_pk_pattern();
            let base = CollectionBase::new(engine, ns, pk, options)?;
            let collection = Collection {
                base,
                flavor: Flavor::SystemUsers { id_pk },
            };
            collection.build_index_cold(&system::extended_system_users_index_info(ns))?;
            collection
        } else {
            let pk = pk_pattern_from_options(&options);
            let id_pk = pk == id_pk_pattern();
            let base = CollectionBase::new(engine, ns, pk, options)?;
            Collection {
                base,
                flavor: Flavor::Indexed { id_pk },
            }
        };

        collection.base.persist_metadata()?;
        Ok(Arc::new(collection))
    }

    fn new_capped_parts(
        engine: Arc<dyn DictionaryEngine>,
        ns: &str,
        options: Value,
    ) -> Result<(CollectionBase, Arc<CappedDetails>)> {
        let max_size = options.get("size").and_then(|s| s.as_i64()).unwrap_or(i64::MAX);
        let max_objects = options.get("max").and_then(|m| m.as_i64()).unwrap_or(0);
        if max_size <= 0 {
            return Err(GalenaError::InvalidOptions(
                "capped collections need a positive size".to_string(),
            ));
        }
        let base = CollectionBase::new(engine, ns, natural_pk_pattern(), options)?;
        Ok((base, CappedDetails::new(max_size, max_objects, 1)))
    }

    /// Reopen from serialized metadata. `bulk_load` promotes the instance to
    /// a bulk-loaded facade pinned to `connection`.
    pub fn open(
        engine: Arc<dyn DictionaryEngine>,
        gtids: Arc<GtidManager>,
        serialized: &Value,
        bulk_load: bool,
        connection: Option<ConnectionId>,
    ) -> Result<Arc<Collection>> {
        let base = CollectionBase::open_serialized(engine, serialized)?;
        let ns = base.ns.clone();
        let options = base.options.clone();
        let capped = options
            .get("capped")
            .and_then(|c| c.as_bool())
            .unwrap_or(false);

        if bulk_load {
            let connection = connection.ok_or_else(|| {
                GalenaError::InvalidOptions("bulk load needs a connection id".to_string())
            })?;
            let details = BulkLoadDetails::new(&base, connection)?;
            return Ok(Arc::new(Collection {
                base,
                flavor: Flavor::BulkLoad(details),
            }));
        }

        let flavor = if system::is_oplog_collection(&ns) {
            Flavor::Oplog(gtids)
        } else if system::is_system_catalog_collection(&ns) {
            Flavor::SystemCatalog(NaturalDetails::new(Self::restore_next_pk(&base)))
        } else if system::is_profile_collection(&ns) || capped {
            let max_size = options.get("size").and_then(|s| s.as_i64()).unwrap_or(i64::MAX);
            let max_objects = options.get("max").and_then(|m| m.as_i64()).unwrap_or(0);
            let cap = CappedDetails::new(max_size, max_objects, Self::restore_next_pk(&base));
            let mut objects = 0i64;
            let mut size = 0i64;
            for (_pk, doc) in base.pk_index().dict().snapshot() {
                objects += 1;
                size += crate::document::doc_size(&doc);
            }
            cap.restore_counters(objects, size);
            if system::is_profile_collection(&ns) {
                Flavor::Profile(cap)
            } else {
                Flavor::Capped(cap)
            }
        } else if options
            .get("natural")
            .and_then(|n| n.as_bool())
            .unwrap_or(false)
        {
            Flavor::NaturalOrder(NaturalDetails::new(Self::restore_next_pk(&base)))
        } else if system::is_system_users_collection(&ns) {
            let id_pk = base.pk_pattern == id_pk_pattern();
            if base
                .find_index_by_key_pattern(&system::extended_system_users_key_pattern())
                .is_none()
            {
                // Older metadata may predate the extended index; tolerate it
                // but say so.
                log_warn!(
                    "{} is missing the extended {} index",
                    ns,
                    system::extended_system_users_index_name()
                );
            }
            Flavor::SystemUsers { id_pk }
        } else {
            let id_pk = base.pk_pattern == id_pk_pattern();
            Flavor::Indexed { id_pk }
        };
        Ok(Arc::new(Collection { base, flavor }))
    }

    fn restore_next_pk(base: &CollectionBase) -> i64 {
        base.pk_index()
            .dict()
            .snapshot()
            .last()
            .and_then(|(k, _)| match k {
                IndexKey::Int(pk) => Some(pk + 1),
                _ => None,
            })
            .unwrap_or(1)
    }

    // ========== METADATA ==========

    pub fn ns(&self) -> &str {
        &self.base.ns
    }

    pub fn options(&self) -> &Value {
        &self.base.options
    }

    pub fn pk_pattern(&self) -> &Value {
        &self.base.pk_pattern
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.base.query_cache
    }

    pub fn notify_of_write(&self) {
        self.base.query_cache.notify_of_write();
    }

    pub fn n_indexes(&self) -> usize {
        self.base.n_indexes()
    }

    pub fn n_indexes_being_built(&self) -> usize {
        self.base.n_indexes_being_built()
    }

    pub fn index_build_in_progress(&self) -> bool {
        self.base
            .index_build_in_progress
            .load(Ordering::SeqCst)
    }

    pub fn is_multikey(&self, idx_no: usize) -> bool {
        self.base.is_multikey(idx_no)
    }

    pub fn find_index_by_name(&self, name: &str) -> Option<usize> {
        self.base.find_index_by_name(name)
    }

    pub fn find_index_by_key_pattern(&self, pattern: &Value) -> Option<usize> {
        self.base.find_index_by_key_pattern(pattern)
    }

    pub fn find_id_index(&self) -> Option<usize> {
        self.base.find_id_index()
    }

    pub fn index_key_pattern(&self, idx_no: usize) -> Value {
        self.base.idx(idx_no).key_pattern().clone()
    }

    pub fn index_name(&self, idx_no: usize) -> String {
        self.base.idx(idx_no).name().to_string()
    }

    pub fn index_entry_count(&self, idx_no: usize) -> u64 {
        self.base.idx(idx_no).dict().count()
    }

    /// Ordered snapshot of one index's entries.
    pub fn index_snapshot(&self, idx_no: usize) -> Vec<(IndexKey, Value)> {
        self.base.idx(idx_no).dict().snapshot()
    }

    pub fn serialize(&self, include_hot_index: bool) -> Value {
        let mut serialized = self.base.serialize(include_hot_index);
        if matches!(self.flavor, Flavor::BulkLoad(_)) {
            serialized["bulkLoad"] = Value::Bool(true);
        }
        serialized
    }

    pub fn stats(&self) -> CollectionStats {
        self.base.stats()
    }

    // ========== CAPABILITIES ==========

    pub fn is_capped(&self) -> bool {
        matches!(self.flavor, Flavor::Capped(_) | Flavor::Profile(_))
    }

    pub fn bulk_loading(&self) -> bool {
        matches!(self.flavor, Flavor::BulkLoad(_))
    }

    /// Tailable collections bound what a tailing cursor may read: no key at
    /// or beyond the returned one is safe. None for untailable flavors.
    pub fn min_unsafe_key(&self) -> Option<IndexKey> {
        match &self.flavor {
            Flavor::Capped(cap) | Flavor::Profile(cap) => Some(cap.min_unsafe_key()),
            Flavor::Oplog(gtids) => Some(oplog::pk_for_gtid(gtids.min_live_gtid())),
            _ => None,
        }
    }

    /// (current objects, current size) for capped flavors.
    pub fn capped_stats(&self) -> Option<(i64, i64)> {
        match &self.flavor {
            Flavor::Capped(cap) | Flavor::Profile(cap) => {
                Some((cap.current_objects(), cap.current_size()))
            }
            _ => None,
        }
    }

    pub fn capped_limits(&self) -> Option<(i64, i64)> {
        match &self.flavor {
            Flavor::Capped(cap) | Flavor::Profile(cap) => {
                Some((cap.max_objects(), cap.max_size()))
            }
            _ => None,
        }
    }

    fn check_bulk_connection(&self, conn: ConnectionId) -> Result<()> {
        if let Flavor::BulkLoad(bulk) = &self.flavor {
            bulk.validate_connection(&self.base.ns, conn)?;
        }
        Ok(())
    }

    // ========== WRITE INTERFACE ==========

    /// Insert a document, maintaining every index. Returns the stored form
    /// (an _id is synthesized when the pk calls for one).
    pub fn insert_object(&self, txn: &Transaction, obj: Value, flags: u64) -> Result<Value> {
        self.insert_inner(txn, obj, flags, false)
    }

    /// Insert and append the matching replication op(s) to the transaction.
    pub fn insert_object_and_log_ops(
        &self,
        txn: &Transaction,
        obj: Value,
        flags: u64,
    ) -> Result<Value> {
        self.insert_inner(txn, obj, flags, true)
    }

    fn insert_inner(
        &self,
        txn: &Transaction,
        mut obj: Value,
        flags: u64,
        logop: bool,
    ) -> Result<Value> {
        self.check_bulk_connection(txn.connection())?;
        match &self.flavor {
            Flavor::Indexed { id_pk } | Flavor::SystemUsers { id_pk } => {
                if *id_pk {
                    ensure_id_field(&mut obj);
                }
                let pk_key = self.base.validated_pk_from_object(&obj)?;
                self.base.insert_into_indexes(txn, &pk_key, &obj, flags)?;
                if logop {
                    oplog_helpers::log_insert(txn, &self.base.ns, &obj);
                }
                Ok(obj)
            }
            Flavor::Oplog(_) => {
                let pk_key = oplog::pk_from_entry(&obj)?;
                self.base.insert_into_indexes(txn, &pk_key, &obj, flags)?;
                Ok(obj)
            }
            Flavor::NaturalOrder(nat) => {
                let pk_key = IndexKey::Int(nat.next());
                self.base.insert_into_indexes(txn, &pk_key, &obj, flags)?;
                if logop {
                    oplog_helpers::log_insert(txn, &self.base.ns, &obj);
                }
                Ok(obj)
            }
            Flavor::SystemCatalog(nat) => {
                let obj = system::beautify(&obj);
                let pk_key = IndexKey::Int(nat.next());
                self.base.insert_into_indexes(txn, &pk_key, &obj, flags)?;
                Ok(obj)
            }
            Flavor::Capped(cap) => {
                // Capped documents get an _id like ordinary inserts do; only
                // profile collections skip it.
                ensure_id_field(&mut obj);
                capped::insert_object(&self.base, cap, txn, &obj, flags, logop)?;
                Ok(obj)
            }
            Flavor::Profile(cap) => {
                if logop {
                    return Err(GalenaError::OperationNotAllowed(
                        "profile collections are not replicated".to_string(),
                    ));
                }
                capped::insert_object(&self.base, cap, txn, &obj, flags, false)?;
                Ok(obj)
            }
            Flavor::BulkLoad(bulk_details) => {
                ensure_id_field(&mut obj);
                let pk_key = self.base.validated_pk_from_object(&obj)?;
                bulk::insert_object(&self.base, bulk_details, &pk_key, &obj)?;
                Ok(obj)
            }
        }
    }

    /// Replay-path insert for capped collections with a known pk.
    pub fn insert_object_with_pk(
        &self,
        txn: &Transaction,
        pk: i64,
        obj: &Value,
        flags: u64,
    ) -> Result<()> {
        match &self.flavor {
            Flavor::Capped(cap) | Flavor::Profile(cap) => {
                capped::insert_object_with_pk(&self.base, cap, txn, pk, obj, flags)
            }
            _ => Err(GalenaError::OperationNotAllowed(format!(
                "{} is not capped",
                self.base.ns
            ))),
        }
    }

    /// Delete a document by pk; secondary keys are recomputed from `obj`.
    pub fn delete_object(
        &self,
        txn: &Transaction,
        pk_key: &IndexKey,
        obj: &Value,
        flags: u64,
    ) -> Result<()> {
        self.check_bulk_connection(txn.connection())?;
        match &self.flavor {
            Flavor::BulkLoad(_) => Err(GalenaError::OperationNotAllowed(format!(
                "cannot delete from {} during bulk load",
                self.base.ns
            ))),
            Flavor::Capped(cap) | Flavor::Profile(cap) => {
                capped::delete_object(&self.base, cap, txn, pk_key, obj, flags)
            }
            _ => self.base.delete_from_indexes(txn, pk_key, obj, flags),
        }
    }

    /// Replace `old` with `new` under `pk_key`. The new document must keep
    /// the same primary key.
    pub fn update_object(
        &self,
        txn: &Transaction,
        pk_key: &IndexKey,
        old: &Value,
        new: &Value,
        logop: bool,
        from_migrate: bool,
        flags: u64,
    ) -> Result<()> {
        self.check_bulk_connection(txn.connection())?;
        match &self.flavor {
            Flavor::BulkLoad(_) => {
                return Err(GalenaError::OperationNotAllowed(format!(
                    "cannot update {} during bulk load",
                    self.base.ns
                )))
            }
            Flavor::Profile(_) => {
                return Err(GalenaError::OperationNotAllowed(
                    "cannot update a profile collection".to_string(),
                ))
            }
            Flavor::Indexed { .. } | Flavor::SystemUsers { .. } | Flavor::Oplog(_) => {
                let new_pk = match &self.flavor {
                    Flavor::Oplog(_) => oplog::pk_from_entry(new)?,
                    _ => self.base.validated_pk_from_object(new)?,
                };
                if &new_pk != pk_key {
                    return Err(GalenaError::PKChanged {
                        ns: self.base.ns.clone(),
                    });
                }
                self.base.update_in_indexes(txn, pk_key, old, new, flags)?;
            }
            Flavor::Capped(cap) => {
                capped::update_object(&self.base, cap, txn, pk_key, old, new, flags)?;
            }
            Flavor::NaturalOrder(_) | Flavor::SystemCatalog(_) => {
                self.base.update_in_indexes(txn, pk_key, old, new, flags)?;
            }
        }
        if logop {
            oplog_helpers::log_update(
                txn,
                &self.base.ns,
                &pk_display_value(pk_key),
                old,
                new,
                from_migrate,
            );
        }
        Ok(())
    }

    /// Fast-path update: push the delta operators to the engine as a
    /// message. Only legal when fastupdates are ok and no indexed field is
    /// touched.
    pub fn update_object_mods(
        &self,
        txn: &Transaction,
        pk_key: &IndexKey,
        mods: &Value,
        logop: bool,
        from_migrate: bool,
        _flags: u64,
    ) -> Result<()> {
        self.check_bulk_connection(txn.connection())?;
        match &self.flavor {
            Flavor::BulkLoad(_) => {
                return Err(GalenaError::OperationNotAllowed(format!(
                    "cannot update {} during bulk load",
                    self.base.ns
                )))
            }
            Flavor::Profile(_) => {
                return Err(GalenaError::OperationNotAllowed(
                    "cannot update a profile collection".to_string(),
                ))
            }
            _ => {}
        }
        if !self.base.fastupdates_ok() {
            return Err(GalenaError::OperationNotAllowed(format!(
                "fast updates are not ok for {}: the primary key does not cover the shard key",
                self.base.ns
            )));
        }
        let touched = mods_field_paths(mods);
        if self.base.indexed_paths.read().affected_by(&touched) {
            return Err(GalenaError::OperationNotAllowed(
                "fast updates cannot touch indexed fields".to_string(),
            ));
        }
        self.base
            .pk_index()
            .dict()
            .send_message(txn, pk_key, mods)?;
        self.base.query_cache.notify_of_write();
        if logop {
            oplog_helpers::log_update_mods(
                txn,
                &self.base.ns,
                &pk_display_value(pk_key),
                mods,
                from_migrate,
            );
        }
        Ok(())
    }

    pub fn fastupdates_ok(&self) -> bool {
        self.base.fastupdates_ok()
    }

    /// Remove every row of a capped collection.
    pub fn empty(&self, txn: &Transaction) -> Result<()> {
        match &self.flavor {
            Flavor::Capped(cap) | Flavor::Profile(cap) => capped::empty(&self.base, cap, txn),
            _ => Err(GalenaError::OperationNotAllowed(format!(
                "{} is not capped",
                self.base.ns
            ))),
        }
    }

    // ========== READ INTERFACE ==========

    pub fn find_by_pk(&self, pk_key: &IndexKey) -> Result<Option<Value>> {
        self.base.find_by_pk(pk_key)
    }

    pub fn find_one(&self, query: &Value, require_index: bool) -> Result<Option<Value>> {
        self.base.find_one(query, require_index)
    }

    /// Scan the primary index for rows matching a predicate. Catalog
    /// maintenance uses this; queries go through find_one.
    pub fn find_rows<F>(&self, pred: F) -> Result<Vec<(IndexKey, Value)>>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self
            .base
            .pk_index()
            .dict()
            .snapshot()
            .into_iter()
            .filter(|(_, doc)| pred(doc))
            .collect())
    }

    pub fn validated_pk_from_object(&self, obj: &Value) -> Result<IndexKey> {
        match &self.flavor {
            Flavor::Oplog(_) => oplog::pk_from_entry(obj),
            _ => self.base.validated_pk_from_object(obj),
        }
    }

    pub fn simple_pk_from_query(&self, query: &Map<String, Value>) -> Option<IndexKey> {
        self.base.simple_pk_from_query(query)
    }

    // ========== INDEXING ==========

    /// Ensure the given index exists, building it if it doesn't. Returns
    /// whether the index was just built.
    pub fn ensure_index(&self, info: &Value) -> Result<bool> {
        match &self.flavor {
            Flavor::SystemCatalog(_) => {
                return Err(GalenaError::SystemNamespaceProtected(self.base.ns.clone()))
            }
            Flavor::Profile(_) => {
                return Err(GalenaError::OperationNotAllowed(
                    "cannot index a profile collection".to_string(),
                ))
            }
            Flavor::BulkLoad(_) => {
                return Err(GalenaError::OperationNotAllowed(format!(
                    "cannot build indexes on {} during bulk load",
                    self.base.ns
                )))
            }
            _ => {}
        }

        let info = normalize_info(&self.base.ns, info)?;
        let name = info["name"].as_str().unwrap_or("");
        let key = &info["key"];
        if let Some(idx_no) = self.base.find_index_by_name(name) {
            if self.base.idx(idx_no).key_pattern() == key {
                return Ok(false);
            }
            return Err(GalenaError::InvalidOptions(format!(
                "index {} already exists on {} with a different key",
                name, self.base.ns
            )));
        }
        if self.base.find_index_by_key_pattern(key).is_some() {
            return Ok(false);
        }
        if self.base.n_indexes_being_built() >= N_INDEXES_MAX {
            return Err(GalenaError::TooManyIndexes {
                ns: self.base.ns.clone(),
                max: N_INDEXES_MAX,
            });
        }

        let background = info
            .get("background")
            .and_then(|b| b.as_bool())
            .unwrap_or(false);
        let mut indexer = self.new_indexer(info, background);
        indexer.prepare()?;
        indexer.build()?;
        indexer.commit()?;
        // Indexer teardown happens here, still inside the caller's
        // exclusive section.
        drop(indexer);
        Ok(true)
    }

    /// Build an indexer; the caller drives prepare/build/commit under the
    /// lock regimes its flavor requires.
    pub fn new_indexer(&self, info: Value, background: bool) -> Indexer<'_> {
        Indexer::new(&self.base, info, background)
    }

    fn build_index_cold(&self, info: &Value) -> Result<()> {
        let info = normalize_info(&self.base.ns, info)?;
        let mut indexer = self.new_indexer(info, false);
        indexer.prepare()?;
        indexer.build()?;
        indexer.commit()
    }

    pub fn optimize_indexes(&self, name: &str) -> Result<()> {
        self.base.optimize_indexes(name)
    }

    /// Engine-level optimize over a pk range; oplog trimmers use this after
    /// deleting entries below the replication watermarks.
    pub fn optimize_pk(&self, left: Gtid, right: Gtid, timeout_ms: u64) -> Result<u64> {
        match &self.flavor {
            Flavor::Oplog(_) => self.base.pk_index().dict().optimize_range(
                &oplog::pk_for_gtid(left),
                &oplog::pk_for_gtid(right),
                timeout_ms,
            ),
            _ => Err(GalenaError::OperationNotAllowed(format!(
                "{} is not an oplog collection",
                self.base.ns
            ))),
        }
    }

    pub fn drop_indexes(&self, name: &str, may_delete_id_index: bool) -> Result<bool> {
        match &self.flavor {
            Flavor::SystemCatalog(_) => {
                Err(GalenaError::SystemNamespaceProtected(self.base.ns.clone()))
            }
            Flavor::BulkLoad(_) => Err(GalenaError::OperationNotAllowed(format!(
                "cannot drop indexes on {} during bulk load",
                self.base.ns
            ))),
            _ => self.base.drop_indexes(name, may_delete_id_index),
        }
    }

    // ========== LIFECYCLE ==========

    /// Close the collection. Bulk loads tear their loader down before the
    /// dictionary handles go away; a clean close writes the serialized
    /// metadata back so lazily-set multikey bits reach disk.
    pub fn close(&self, aborting: bool) -> Result<()> {
        if let Flavor::BulkLoad(bulk_details) = &self.flavor {
            bulk::close(&self.base, bulk_details, aborting)?;
        } else if !aborting {
            self.base.persist_metadata()?;
        }
        self.base.close();
        Ok(())
    }

    /// Drop all storage for this collection. The caller removes it from the
    /// collection map and catalogs.
    pub(crate) fn drop_storage(&self) -> Result<()> {
        let names: Vec<String> = {
            let indexes = self.base.indexes.read();
            indexes
                .iter()
                .map(|i| format!("{}.${}", self.base.ns, i.name()))
                .collect()
        };
        self.base.close();
        for name in names {
            self.base.engine.drop_dictionary(&name)?;
        }
        self.base.engine.delete_metadata(&self.base.ns)
    }
}

/// Prepend a synthesized _id when the document lacks one.
fn ensure_id_field(obj: &mut Value) {
    let Some(fields) = obj.as_object_mut() else {
        return;
    };
    if fields.contains_key("_id") {
        return;
    }
    let mut with_id = Map::new();
    with_id.insert("_id".to_string(), Value::String(new_object_id()));
    for (k, v) in fields.iter() {
        with_id.insert(k.clone(), v.clone());
    }
    *obj = Value::Object(with_id);
}

/// The dotted paths a mods stream touches.
fn mods_field_paths(mods: &Value) -> std::collections::BTreeSet<String> {
    let mut out = std::collections::BTreeSet::new();
    if let Some(ops) = mods.as_object() {
        for args in ops.values() {
            if let Some(fields) = args.as_object() {
                for path in fields.keys() {
                    out.insert(path.clone());
                }
            }
        }
    }
    out
}

/// Loggable form of a primary key.
fn pk_display_value(pk_key: &IndexKey) -> Value {
    match pk_key {
        IndexKey::Null => Value::Null,
        IndexKey::Bool(b) => Value::Bool(*b),
        IndexKey::Int(i) => Value::from(*i),
        IndexKey::Float(f) => Value::from(f.0),
        IndexKey::String(s) => Value::String(s.clone()),
        IndexKey::Bytes(b) => Value::String(b.iter().map(|x| format!("{:02x}", x)).collect()),
        IndexKey::Compound(parts) => {
            Value::Array(parts.iter().map(pk_display_value).collect())
        }
    }
}
