// galena-core/src/collection/base.rs
// State and write-path machinery shared by every collection flavor. A write
// touches the primary index and then each secondary under the caller's
// transaction; multikey bits and the indexed-path set are maintained here.

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::collection::{KEYS_UNAFFECTED_HINT, NO_PK_UNIQUE_CHECKS, NO_UNIQUE_CHECKS};
use crate::document::{changed_paths, doc_matches, get_path, validate_pk_component};
use crate::error::{GalenaError, Result};
use crate::index_details::{IndexDetails, IndexPathSet};
use crate::key::IndexKey;
use crate::query_cache::{CachedPlan, QueryCache, QueryHash};
use crate::storage::DictionaryEngine;
use crate::txn::Transaction;
use crate::{log_debug, log_info};

/// The most indexes one collection may carry, primary key included.
pub const N_INDEXES_MAX: usize = 64;

pub(crate) struct CollectionBase {
    pub(crate) ns: String,
    pub(crate) options: Value,
    pub(crate) pk_pattern: Value,
    pub(crate) engine: Arc<dyn DictionaryEngine>,

    // indexes[0] is always the primary key index. While a background build
    // is in progress the vector holds one more entry than n_indexes.
    pub(crate) indexes: RwLock<Vec<Arc<IndexDetails>>>,
    pub(crate) n_indexes: AtomicUsize,
    pub(crate) index_build_in_progress: AtomicBool,

    // Bit i set: index i has produced more than one key for some document.
    // Monotonic; only an index drop clears bits (by shifting them down).
    pub(crate) multikey_bits: AtomicU64,

    pub(crate) indexed_paths: RwLock<IndexPathSet>,
    pub(crate) query_cache: QueryCache,

    // -1 unknown, 0 no, 1 yes. Resolved lazily from the shard key option.
    fastupdates_ok_state: AtomicI8,
}

/// Accumulated collection statistics. The primary index is the main store,
/// so its counts are the collection's counts.
#[derive(Debug, Default, Clone)]
pub struct CollectionStats {
    pub count: u64,
    pub n_indexes: u64,
    pub index_entries: u64,
}

impl CollectionBase {
    pub(crate) fn new(
        engine: Arc<dyn DictionaryEngine>,
        ns: &str,
        pk_pattern: Value,
        options: Value,
    ) -> Result<CollectionBase> {
        pk_pattern
            .as_object()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                GalenaError::InvalidOptions("primary key pattern must be non-empty".to_string())
            })?;
        let pk_name = if pk_pattern == json!({"_id": 1}) {
            "_id_".to_string()
        } else {
            "primaryKey".to_string()
        };
        let pk_info = crate::index_details::normalize_info(
            ns,
            &json!({
                "key": pk_pattern,
                "unique": true,
                "name": pk_name,
                "clustering": true,
            }),
        )?;
        let pk_index = IndexDetails::open(&engine, pk_info)?;

        let base = CollectionBase {
            ns: ns.to_string(),
            options,
            pk_pattern,
            engine,
            indexes: RwLock::new(vec![pk_index]),
            n_indexes: AtomicUsize::new(1),
            index_build_in_progress: AtomicBool::new(false),
            multikey_bits: AtomicU64::new(0),
            indexed_paths: RwLock::new(IndexPathSet::default()),
            query_cache: QueryCache::default(),
            fastupdates_ok_state: AtomicI8::new(-1),
        };
        base.compute_index_keys();
        Ok(base)
    }

    /// Reopen from the serialized form stored in the namespaces catalog.
    pub(crate) fn open_serialized(
        engine: Arc<dyn DictionaryEngine>,
        serialized: &Value,
    ) -> Result<CollectionBase> {
        let ns = serialized["ns"]
            .as_str()
            .ok_or_else(|| GalenaError::Serialization("metadata missing ns".to_string()))?
            .to_string();
        let options = serialized.get("options").cloned().unwrap_or(json!({}));
        let pk_pattern = serialized
            .get("pk")
            .cloned()
            .ok_or_else(|| GalenaError::Serialization("metadata missing pk".to_string()))?;
        let multikey_bits = serialized
            .get("multiKeyIndexBits")
            .and_then(|b| b.as_u64())
            .unwrap_or(0);
        let index_infos = serialized["indexes"]
            .as_array()
            .ok_or_else(|| GalenaError::Serialization("metadata missing indexes".to_string()))?;

        let mut indexes = Vec::with_capacity(index_infos.len());
        for info in index_infos {
            indexes.push(IndexDetails::open(&engine, info.clone())?);
        }
        if indexes.is_empty() {
            return Err(GalenaError::Serialization(format!(
                "{} has no primary key index",
                ns
            )));
        }

        let n = indexes.len();
        let base = CollectionBase {
            ns,
            options,
            pk_pattern,
            engine,
            indexes: RwLock::new(indexes),
            n_indexes: AtomicUsize::new(n),
            index_build_in_progress: AtomicBool::new(false),
            multikey_bits: AtomicU64::new(multikey_bits),
            indexed_paths: RwLock::new(IndexPathSet::default()),
            query_cache: QueryCache::default(),
            fastupdates_ok_state: AtomicI8::new(-1),
        };
        base.compute_index_keys();
        Ok(base)
    }

    // ========== INDEX ACCESS AND LAYOUT ==========

    pub(crate) fn idx(&self, idx_no: usize) -> Arc<IndexDetails> {
        let indexes = self.indexes.read();
        assert!(idx_no < indexes.len(), "index number out of range");
        indexes[idx_no].clone()
    }

    pub(crate) fn pk_index(&self) -> Arc<IndexDetails> {
        self.idx(0)
    }

    pub(crate) fn n_indexes(&self) -> usize {
        self.n_indexes.load(Ordering::SeqCst)
    }

    /// During a background build the in-progress index is not yet counted in
    /// n_indexes but every write must still maintain it.
    pub(crate) fn n_indexes_being_built(&self) -> usize {
        let len = self.indexes.read().len();
        if self.index_build_in_progress.load(Ordering::SeqCst) {
            debug_assert_eq!(self.n_indexes() + 1, len);
        } else {
            debug_assert_eq!(self.n_indexes(), len);
        }
        len
    }

    pub(crate) fn is_multikey(&self, idx_no: usize) -> bool {
        self.multikey_bits.load(Ordering::SeqCst) & (1u64 << idx_no) != 0
    }

    // Persisted lazily: the bit lands on disk with the next metadata write.
    pub(crate) fn set_index_is_multikey(&self, idx_no: usize) {
        let mask = 1u64 << idx_no;
        let prev = self.multikey_bits.fetch_or(mask, Ordering::SeqCst);
        if prev & mask == 0 {
            log_debug!("index {} of {} is now multikey", idx_no, self.ns);
        }
    }

    pub(crate) fn find_index_by_name(&self, name: &str) -> Option<usize> {
        self.indexes.read().iter().position(|i| i.name() == name)
    }

    pub(crate) fn find_index_by_key_pattern(&self, pattern: &Value) -> Option<usize> {
        self.indexes
            .read()
            .iter()
            .position(|i| i.key_pattern() == pattern)
    }

    pub(crate) fn find_id_index(&self) -> Option<usize> {
        self.indexes.read().iter().position(|i| i.is_id_index())
    }

    /// First committed index whose leading fields are all constrained by the
    /// query. Skips multikey indexes when `require_single_key`.
    pub(crate) fn find_index_by_prefix(
        &self,
        query: &Map<String, Value>,
        require_single_key: bool,
    ) -> Option<usize> {
        let indexes = self.indexes.read();
        for (i, idx) in indexes.iter().enumerate().take(self.n_indexes()) {
            if require_single_key && self.is_multikey(i) {
                continue;
            }
            if idx.field_paths().all(|p| query.contains_key(p)) {
                return Some(i);
            }
        }
        None
    }

    pub(crate) fn is_pk_index(&self, idx: &IndexDetails) -> bool {
        idx.key_pattern() == &self.pk_pattern
    }

    /// Recompute the indexed-path set from every index being built.
    pub(crate) fn compute_index_keys(&self) {
        let mut paths = IndexPathSet::default();
        for idx in self.indexes.read().iter() {
            paths.add_pattern(idx.key_pattern());
        }
        *self.indexed_paths.write() = paths;
    }

    // ========== PRIMARY KEY EXTRACTION ==========

    /// Extract and validate the primary key portion of a document according
    /// to this collection's pk pattern.
    pub(crate) fn validated_pk_from_object(&self, obj: &Value) -> Result<IndexKey> {
        let fields = self.pk_pattern.as_object().expect("pk pattern is an object");
        let mut parts = Vec::with_capacity(fields.len());
        for field in fields.keys() {
            let value = validate_pk_component(field, get_path(obj, field))?;
            parts.push(IndexKey::from(&value));
        }
        Ok(if parts.len() == 1 {
            parts.into_iter().next().unwrap()
        } else {
            IndexKey::Compound(parts)
        })
    }

    /// Pull a primary key out of an equality-only query, if every pk field
    /// is present as a simple value.
    pub(crate) fn simple_pk_from_query(&self, query: &Map<String, Value>) -> Option<IndexKey> {
        let fields = self.pk_pattern.as_object()?;
        let mut parts = Vec::with_capacity(fields.len());
        for field in fields.keys() {
            match query.get(field) {
                Some(v) if !v.is_object() && !v.is_array() => parts.push(IndexKey::from(v)),
                _ => return None,
            }
        }
        Some(if parts.len() == 1 {
            parts.into_iter().next().unwrap()
        } else {
            IndexKey::Compound(parts)
        })
    }

    // ========== WRITE PATH ==========

    /// Insert one document into the primary index and every secondary,
    /// including an in-progress background index.
    pub(crate) fn insert_into_indexes(
        &self,
        txn: &Transaction,
        pk_key: &IndexKey,
        obj: &Value,
        flags: u64,
    ) -> Result<()> {
        let indexes: Vec<Arc<IndexDetails>> = self.indexes.read().clone();

        // Generate secondary keys first so multikey bits are set before any
        // storage mutation.
        let mut secondary_keys: Vec<Vec<IndexKey>> = Vec::with_capacity(indexes.len());
        for (i, idx) in indexes.iter().enumerate().skip(1) {
            let keys = idx.generate_keys(obj)?;
            if keys.len() > 1 {
                self.set_index_is_multikey(i);
            }
            secondary_keys.push(keys);
        }

        let pk = &indexes[0];
        if flags & NO_PK_UNIQUE_CHECKS == 0 && pk.dict().get(pk_key)?.is_some() {
            return Err(GalenaError::DuplicateKey {
                index: pk.name().to_string(),
                key: pk_key.display(),
            });
        }
        pk.dict().insert(txn, pk_key.clone(), obj.clone(), flags)?;

        for (idx, keys) in indexes.iter().skip(1).zip(secondary_keys) {
            for key in keys {
                if idx.is_unique() && flags & NO_UNIQUE_CHECKS == 0 && idx.prefix_exists(&key)? {
                    return Err(GalenaError::DuplicateKey {
                        index: idx.name().to_string(),
                        key: key.display(),
                    });
                }
                idx.dict()
                    .insert(txn, key.with_pk(pk_key), Value::Null, flags)?;
            }
        }
        self.query_cache.notify_of_write();
        Ok(())
    }

    /// Pre-check unique secondary indexes without mutating anything. The
    /// capped flavor calls this before materializing a row.
    pub(crate) fn check_unique_secondaries(&self, obj: &Value, flags: u64) -> Result<()> {
        if flags & NO_UNIQUE_CHECKS != 0 {
            return Ok(());
        }
        let indexes: Vec<Arc<IndexDetails>> = self.indexes.read().clone();
        for idx in indexes.iter().skip(1) {
            if !idx.is_unique() {
                continue;
            }
            for key in idx.generate_keys(obj)? {
                if idx.prefix_exists(&key)? {
                    return Err(GalenaError::DuplicateKey {
                        index: idx.name().to_string(),
                        key: key.display(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Delete one document from every index; secondary keys are recomputed
    /// from the stored object.
    pub(crate) fn delete_from_indexes(
        &self,
        txn: &Transaction,
        pk_key: &IndexKey,
        obj: &Value,
        flags: u64,
    ) -> Result<()> {
        let indexes: Vec<Arc<IndexDetails>> = self.indexes.read().clone();
        indexes[0].dict().delete(txn, pk_key, flags)?;
        for idx in indexes.iter().skip(1) {
            for key in idx.generate_keys(obj)? {
                idx.dict().delete(txn, &key.with_pk(pk_key), flags)?;
            }
        }
        self.query_cache.notify_of_write();
        Ok(())
    }

    /// Replace `old` with `new` under an unchanged primary key. Only indexes
    /// whose key paths intersect the document diff are rewritten.
    pub(crate) fn update_in_indexes(
        &self,
        txn: &Transaction,
        pk_key: &IndexKey,
        old: &Value,
        new: &Value,
        flags: u64,
    ) -> Result<()> {
        let indexes: Vec<Arc<IndexDetails>> = self.indexes.read().clone();

        if flags & KEYS_UNAFFECTED_HINT != 0 {
            // Caller asserts no secondary is affected: rewrite the row only.
            indexes[0].dict().insert(txn, pk_key.clone(), new.clone(), flags)?;
            self.query_cache.notify_of_write();
            return Ok(());
        }

        let changed = changed_paths(old, new);
        indexes[0].dict().insert(txn, pk_key.clone(), new.clone(), flags)?;
        for (i, idx) in indexes.iter().enumerate().skip(1) {
            let mut idx_paths = IndexPathSet::default();
            idx_paths.add_pattern(idx.key_pattern());
            if !idx_paths.affected_by(&changed) {
                continue;
            }
            for key in idx.generate_keys(old)? {
                idx.dict().delete(txn, &key.with_pk(pk_key), flags)?;
            }
            let new_keys = idx.generate_keys(new)?;
            if new_keys.len() > 1 {
                self.set_index_is_multikey(i);
            }
            for key in new_keys {
                if idx.is_unique() && flags & NO_UNIQUE_CHECKS == 0 && idx.prefix_exists(&key)? {
                    return Err(GalenaError::DuplicateKey {
                        index: idx.name().to_string(),
                        key: key.display(),
                    });
                }
                idx.dict()
                    .insert(txn, key.with_pk(pk_key), Value::Null, flags)?;
            }
        }
        self.query_cache.notify_of_write();
        Ok(())
    }

    /// True if fast (delta-message) updates are safe here: either the
    /// collection is unsharded or the pk covers the full shard key.
    pub(crate) fn fastupdates_ok(&self) -> bool {
        let state = self.fastupdates_ok_state.load(Ordering::SeqCst);
        if state >= 0 {
            return state == 1;
        }
        let ok = match self.options.get("shardKey").and_then(|k| k.as_object()) {
            None => true,
            Some(shard_key) => {
                let pk_fields = self.pk_pattern.as_object().expect("pk pattern is an object");
                shard_key.keys().all(|f| pk_fields.contains_key(f))
            }
        };
        self.fastupdates_ok_state
            .store(if ok { 1 } else { 0 }, Ordering::SeqCst);
        ok
    }

    // ========== READ PATH ==========

    pub(crate) fn find_by_pk(&self, pk_key: &IndexKey) -> Result<Option<Value>> {
        self.pk_index().dict().get(pk_key)
    }

    /// First document matching an equality-only query. Prefers a primary key
    /// point-get, then a committed secondary whose fields the query covers,
    /// then a primary scan (rejected when `require_index`).
    pub(crate) fn find_one(&self, query: &Value, require_index: bool) -> Result<Option<Value>> {
        let Some(fields) = query.as_object() else {
            return Err(GalenaError::InvalidOptions(
                "query must be an object".to_string(),
            ));
        };

        if let Some(pk_key) = self.simple_pk_from_query(fields) {
            if let Some(doc) = self.find_by_pk(&pk_key)? {
                if doc_matches(&doc, query) {
                    return Ok(Some(doc));
                }
            }
            return Ok(None);
        }

        let hash = QueryHash::new(query);
        let cached = self.query_cache.get(&hash);
        let idx_no = match cached {
            Some(plan) => plan
                .index_name
                .as_deref()
                .and_then(|name| self.find_index_by_name(name)),
            None => self.find_index_by_prefix(fields, false),
        };

        if let Some(idx_no) = idx_no.filter(|n| *n > 0) {
            let idx = self.idx(idx_no);
            self.query_cache.insert(
                hash,
                CachedPlan {
                    index_name: Some(idx.name().to_string()),
                },
            );
            let probe = idx.generate_keys(query)?;
            // An equality query generates exactly one probe key.
            if let Some(prefix) = probe.first() {
                for pk_key in self.scan_secondary_prefix(idx_no, prefix)? {
                    if let Some(doc) = self.find_by_pk(&pk_key)? {
                        if doc_matches(&doc, query) {
                            return Ok(Some(doc));
                        }
                    }
                }
            }
            return Ok(None);
        }

        if require_index {
            return Err(GalenaError::OperationNotAllowed(format!(
                "query on {} requires an index",
                self.ns
            )));
        }

        self.query_cache
            .insert(hash, CachedPlan { index_name: None });
        for (_pk, doc) in self.pk_index().dict().snapshot() {
            if doc_matches(&doc, query) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    /// Walk a secondary index for all entries with the given prefix,
    /// returning deduped primary keys (a multikey index can repeat them).
    pub(crate) fn scan_secondary_prefix(
        &self,
        idx_no: usize,
        prefix: &IndexKey,
    ) -> Result<Vec<IndexKey>> {
        let idx = self.idx(idx_no);
        let mut parts = Vec::new();
        prefix.flatten_into(&mut parts);
        let mut cursor = IndexKey::Compound(parts);
        let mut pks = BTreeSet::new();
        while let Some(entry) = idx.dict().successor(&cursor)? {
            if !entry.starts_with(prefix) {
                break;
            }
            if let IndexKey::Compound(parts) = &entry {
                if let Some(pk) = parts.last() {
                    pks.insert(pk.clone());
                }
            }
            cursor = entry;
        }
        Ok(pks.into_iter().collect())
    }

    // ========== METADATA ==========

    /// Serialized metadata for the namespaces catalog.
    pub(crate) fn serialize(&self, include_hot_index: bool) -> Value {
        let indexes = self.indexes.read();
        let mut count = self.n_indexes();
        if include_hot_index && self.index_build_in_progress.load(Ordering::SeqCst) {
            count = indexes.len();
        }
        let infos: Vec<Value> = indexes[..count].iter().map(|i| i.info().clone()).collect();
        json!({
            "ns": self.ns,
            "options": self.options,
            "pk": self.pk_pattern,
            "multiKeyIndexBits": self.multikey_bits.load(Ordering::SeqCst),
            "indexes": infos,
        })
    }

    pub(crate) fn persist_metadata(&self) -> Result<()> {
        self.engine.put_metadata(&self.ns, self.serialize(false))
    }

    // ========== INDEX MAINTENANCE ==========

    /// Run a range optimize over one index (or all of them for "*").
    pub(crate) fn optimize_indexes(&self, name: &str) -> Result<()> {
        let indexes: Vec<Arc<IndexDetails>> = self.indexes.read().clone();
        for idx in indexes.iter().take(self.n_indexes()) {
            if name != "*" && idx.name() != name {
                continue;
            }
            let entries = idx.dict().snapshot();
            if let (Some((left, _)), Some((right, _))) = (entries.first(), entries.last()) {
                let loops = idx.dict().optimize_range(left, right, 0)?;
                log_info!("optimized {} of {}: {} loops", idx.name(), self.ns, loops);
            }
        }
        Ok(())
    }

    /// Drop the index at a position. Multikey bits above it shift down one.
    pub(crate) fn drop_index(&self, idx_no: usize) -> Result<()> {
        let removed = {
            let mut indexes = self.indexes.write();
            assert!(idx_no < indexes.len(), "index number out of range");
            indexes.remove(idx_no)
        };
        self.engine
            .drop_dictionary(&format!("{}.${}", self.ns, removed.name()))?;

        let bits = self.multikey_bits.load(Ordering::SeqCst);
        let low_mask = (1u64 << idx_no) - 1;
        let shifted = (bits & low_mask) | ((bits >> 1) & !low_mask);
        self.multikey_bits.store(shifted, Ordering::SeqCst);

        self.n_indexes.fetch_sub(1, Ordering::SeqCst);
        self.compute_index_keys();
        self.query_cache.notify_of_write();
        self.persist_metadata()
    }

    /// Drop indexes by name; "*" drops every secondary that is not the id
    /// index. Returns whether anything matched.
    pub(crate) fn drop_indexes(&self, name: &str, may_delete_id_index: bool) -> Result<bool> {
        if self.index_build_in_progress.load(Ordering::SeqCst) {
            return Err(GalenaError::IndexBuildInProgress(self.ns.clone()));
        }
        if name == "*" {
            let count = self.n_indexes();
            for idx_no in (1..count).rev() {
                if self.idx(idx_no).is_id_index() {
                    continue;
                }
                self.drop_index(idx_no)?;
            }
            return Ok(true);
        }
        let Some(idx_no) = self.find_index_by_name(name) else {
            return Ok(false);
        };
        if idx_no == 0 {
            return Err(GalenaError::OperationNotAllowed(format!(
                "cannot drop the primary key index of {}",
                self.ns
            )));
        }
        if self.idx(idx_no).is_id_index() && !may_delete_id_index {
            return Err(GalenaError::OperationNotAllowed(format!(
                "cannot drop the _id index of {}",
                self.ns
            )));
        }
        self.drop_index(idx_no)?;
        Ok(true)
    }

    pub(crate) fn stats(&self) -> CollectionStats {
        let indexes = self.indexes.read();
        let n = self.n_indexes();
        CollectionStats {
            count: indexes[0].dict().count(),
            n_indexes: n as u64,
            index_entries: indexes[1..n].iter().map(|i| i.dict().count()).sum(),
        }
    }

    /// Release dictionary handles. Engine-side state survives for reopen.
    pub(crate) fn close(&self) {
        self.indexes.write().clear();
        self.n_indexes.store(0, Ordering::SeqCst);
    }
}
