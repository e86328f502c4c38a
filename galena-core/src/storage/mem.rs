// galena-core/src/storage/mem.rs
// In-memory dictionary engine over ordered maps. This is the embedding and
// test backend; it implements the same seam a disk engine would, including
// undo logging through the transaction so aborts roll partial writes back.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use crate::document::apply_mods;
use crate::error::{GalenaError, Result};
use crate::key::IndexKey;
use crate::log_trace;
use crate::storage::{BulkLoader, Dictionary, DictionaryEngine, HotIndexBuilder, KeyExtractor};
use crate::txn::Transaction;

type OrderedMap = Arc<RwLock<BTreeMap<IndexKey, Value>>>;

pub struct MemDictionary {
    name: String,
    map: OrderedMap,
}

impl MemDictionary {
    fn new(name: &str) -> MemDictionary {
        MemDictionary {
            name: name.to_string(),
            map: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Dictionary for MemDictionary {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &IndexKey) -> Result<Option<Value>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn insert(&self, txn: &Transaction, key: IndexKey, value: Value, _flags: u64) -> Result<()> {
        let prev = self.map.write().insert(key.clone(), value);
        let map = self.map.clone();
        txn.push_undo(move || {
            let mut guard = map.write();
            match prev {
                Some(old) => {
                    guard.insert(key, old);
                }
                None => {
                    guard.remove(&key);
                }
            }
        });
        Ok(())
    }

    fn delete(&self, txn: &Transaction, key: &IndexKey, _flags: u64) -> Result<()> {
        let prev = self.map.write().remove(key);
        if let Some(old) = prev {
            let map = self.map.clone();
            let key = key.clone();
            txn.push_undo(move || {
                map.write().insert(key, old);
            });
        }
        Ok(())
    }

    fn send_message(&self, txn: &Transaction, key: &IndexKey, mods: &Value) -> Result<()> {
        let mut guard = self.map.write();
        let Some(current) = guard.get(key) else {
            // Messages are blind; a missing row means there is nothing to
            // update by the time the message lands.
            log_trace!("message for absent key {} in {}", key.display(), self.name);
            return Ok(());
        };
        let prev = current.clone();
        let mut next = prev.clone();
        apply_mods(&mut next, mods)?;
        guard.insert(key.clone(), next);
        drop(guard);

        let map = self.map.clone();
        let key = key.clone();
        txn.push_undo(move || {
            map.write().insert(key, prev);
        });
        Ok(())
    }

    fn put_untracked(&self, key: IndexKey, value: Value) -> Result<()> {
        self.map.write().insert(key, value);
        Ok(())
    }

    fn successor(&self, lower: &IndexKey) -> Result<Option<IndexKey>> {
        Ok(self
            .map
            .read()
            .range((Bound::Excluded(lower.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn snapshot(&self) -> Vec<(IndexKey, Value)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn count(&self) -> u64 {
        self.map.read().len() as u64
    }

    fn optimize_range(&self, left: &IndexKey, right: &IndexKey, _timeout_ms: u64) -> Result<u64> {
        // Nothing to rebalance in a BTreeMap; report one loop per entry the
        // optimizer would have visited.
        let guard = self.map.read();
        let loops = guard
            .range((Bound::Included(left.clone()), Bound::Included(right.clone())))
            .count() as u64;
        Ok(loops)
    }
}

struct MemLoader {
    dicts: Vec<Arc<dyn Dictionary>>,
    rows: Vec<Vec<(IndexKey, Value)>>,
}

impl BulkLoader for MemLoader {
    fn put(&mut self, dict_no: usize, key: IndexKey, value: Value) -> Result<()> {
        if dict_no >= self.rows.len() {
            return Err(GalenaError::Storage(format!(
                "loader has {} dictionaries, got row for #{}",
                self.rows.len(),
                dict_no
            )));
        }
        self.rows[dict_no].push((key, value));
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let MemLoader { dicts, rows } = *self;
        for (dict, rows) in dicts.iter().zip(rows) {
            for (key, value) in rows {
                dict.put_untracked(key, value)?;
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        // Buffered rows never touched the dictionaries.
    }
}

struct MemHotBuilder {
    source: Arc<dyn Dictionary>,
    target: Arc<dyn Dictionary>,
    extract: KeyExtractor,
    snapshot: Vec<(IndexKey, Value)>,
}

impl HotIndexBuilder for MemHotBuilder {
    fn build(&mut self) -> Result<()> {
        for (pk, doc) in &self.snapshot {
            // Rows written or rewritten since the snapshot already reached
            // the target through the live write path; only index rows that
            // are still current.
            match self.source.get(pk)? {
                Some(current) if &current == doc => {
                    for (key, value) in (self.extract)(pk, doc)? {
                        self.target.put_untracked(key, value)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// In-memory engine: a process-local namespace of dictionaries plus the
/// metadata store backing the namespaces catalog.
pub struct MemEngine {
    dicts: RwLock<HashMap<String, Arc<MemDictionary>>>,
    meta: RwLock<BTreeMap<String, Value>>,
}

impl MemEngine {
    pub fn new() -> Arc<MemEngine> {
        Arc::new(MemEngine {
            dicts: RwLock::new(HashMap::new()),
            meta: RwLock::new(BTreeMap::new()),
        })
    }
}

impl DictionaryEngine for MemEngine {
    fn open_dictionary(&self, name: &str) -> Result<Arc<dyn Dictionary>> {
        let mut dicts = self.dicts.write();
        let dict = dicts
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemDictionary::new(name)));
        Ok(dict.clone())
    }

    fn drop_dictionary(&self, name: &str) -> Result<()> {
        self.dicts.write().remove(name);
        Ok(())
    }

    fn rename_dictionary(&self, from: &str, to: &str) -> Result<()> {
        let mut dicts = self.dicts.write();
        let Some(dict) = dicts.remove(from) else {
            return Err(GalenaError::Storage(format!("no dictionary named {}", from)));
        };
        if dicts.contains_key(to) {
            dicts.insert(from.to_string(), dict);
            return Err(GalenaError::Storage(format!("dictionary {} exists", to)));
        }
        let renamed = Arc::new(MemDictionary {
            name: to.to_string(),
            map: dict.map.clone(),
        });
        dicts.insert(to.to_string(), renamed);
        Ok(())
    }

    fn begin_load(&self, dicts: Vec<Arc<dyn Dictionary>>) -> Result<Box<dyn BulkLoader>> {
        let rows = dicts.iter().map(|_| Vec::new()).collect();
        Ok(Box::new(MemLoader { dicts, rows }))
    }

    fn begin_hot_index(
        &self,
        source: Arc<dyn Dictionary>,
        target: Arc<dyn Dictionary>,
        extract: KeyExtractor,
    ) -> Result<Box<dyn HotIndexBuilder>> {
        let snapshot = source.snapshot();
        Ok(Box::new(MemHotBuilder {
            source,
            target,
            extract,
            snapshot,
        }))
    }

    fn put_metadata(&self, ns: &str, meta: Value) -> Result<()> {
        self.meta.write().insert(ns.to_string(), meta);
        Ok(())
    }

    fn get_metadata(&self, ns: &str) -> Result<Option<Value>> {
        Ok(self.meta.read().get(ns).cloned())
    }

    fn delete_metadata(&self, ns: &str) -> Result<()> {
        self.meta.write().remove(ns);
        Ok(())
    }

    fn list_metadata(&self) -> Result<Vec<(String, Value)>> {
        Ok(self
            .meta
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
