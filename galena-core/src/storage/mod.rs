// galena-core/src/storage/mod.rs
// The dictionary engine seam. The collection layer only ever talks to these
// traits; the in-memory engine below them exists for embedding and tests.
// Mirrors the split between the production and memory backends so engines
// can be swapped without touching collection code.

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::key::IndexKey;
use crate::txn::Transaction;

pub mod mem;

pub use mem::MemEngine;

/// One ordered dictionary (one index). Keys are IndexKeys, values are
/// documents (primary index) or Null (secondary entries, pk in the key).
pub trait Dictionary: Send + Sync {
    fn name(&self) -> &str;

    /// Point get.
    fn get(&self, key: &IndexKey) -> Result<Option<Value>>;

    /// Transactional insert. Overwrites; uniqueness is the caller's business.
    fn insert(&self, txn: &Transaction, key: IndexKey, value: Value, flags: u64) -> Result<()>;

    /// Transactional delete. Deleting an absent key is a no-op.
    fn delete(&self, txn: &Transaction, key: &IndexKey, flags: u64) -> Result<()>;

    /// Push a delta-operator message at a key instead of a read-modify-write.
    /// The fast-update path.
    fn send_message(&self, txn: &Transaction, key: &IndexKey, mods: &Value) -> Result<()>;

    /// Non-transactional put, used by index builders and bulk loaders whose
    /// failure handling is dropping the whole dictionary.
    fn put_untracked(&self, key: IndexKey, value: Value) -> Result<()>;

    /// Smallest key strictly greater than `lower`.
    fn successor(&self, lower: &IndexKey) -> Result<Option<IndexKey>>;

    /// Ordered point-in-time snapshot of all entries.
    fn snapshot(&self) -> Vec<(IndexKey, Value)>;

    fn count(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Time-bounded background optimize over a key range. Returns the number
    /// of optimization loops run.
    fn optimize_range(&self, left: &IndexKey, right: &IndexKey, timeout_ms: u64) -> Result<u64>;
}

/// Bulk loader over a set of dictionaries opened together. Rows buffer until
/// close; abort discards everything.
pub trait BulkLoader: Send {
    fn put(&mut self, dict_no: usize, key: IndexKey, value: Value) -> Result<()>;

    /// Flush all buffered rows into the dictionaries.
    fn close(self: Box<Self>) -> Result<()>;

    fn abort(self: Box<Self>);
}

/// Derives index entries for one primary row: (pk, document) -> entry rows.
pub type KeyExtractor =
    Arc<dyn Fn(&IndexKey, &Value) -> Result<Vec<(IndexKey, Value)>> + Send + Sync>;

/// Engine-side online index builder. Created under an exclusive section (it
/// snapshots the source there), built under a shared one while concurrent
/// writes keep flowing into the target through the normal write path.
pub trait HotIndexBuilder: Send {
    fn build(&mut self) -> Result<()>;
}

/// The engine: a namespace of dictionaries plus a small metadata store used
/// for the serialized namespaces catalog.
pub trait DictionaryEngine: Send + Sync {
    /// Open a named dictionary, creating it if missing.
    fn open_dictionary(&self, name: &str) -> Result<Arc<dyn Dictionary>>;

    fn drop_dictionary(&self, name: &str) -> Result<()>;

    /// Move a dictionary to a new name (collection rename).
    fn rename_dictionary(&self, from: &str, to: &str) -> Result<()>;

    fn begin_load(&self, dicts: Vec<Arc<dyn Dictionary>>) -> Result<Box<dyn BulkLoader>>;

    fn begin_hot_index(
        &self,
        source: Arc<dyn Dictionary>,
        target: Arc<dyn Dictionary>,
        extract: KeyExtractor,
    ) -> Result<Box<dyn HotIndexBuilder>>;

    fn put_metadata(&self, ns: &str, meta: Value) -> Result<()>;

    fn get_metadata(&self, ns: &str) -> Result<Option<Value>>;

    fn delete_metadata(&self, ns: &str) -> Result<()>;

    fn list_metadata(&self) -> Result<Vec<(String, Value)>>;
}
