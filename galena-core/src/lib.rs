// galena-core/src/lib.rs
// Collection and index-management core of the galena document store, plus
// the GTID tracker for its replication pipeline.

pub mod collection;
pub mod document;
pub mod error;
pub mod gtid;
pub mod index_details;
pub mod key;
pub mod logging;
pub mod oplog_helpers;
pub mod query_cache;
pub mod storage;
pub mod txn;

// Public exports
pub use collection::base::CollectionStats;
pub use collection::map::CollectionMap;
pub use collection::system::{
    extended_system_users_index_name, extended_system_users_key_pattern,
    is_system_users_collection, legal_client_system_ns, old_system_users_key_pattern,
};
pub use collection::{
    Collection, KEYS_UNAFFECTED_HINT, NO_LOCKTREE, NO_PK_UNIQUE_CHECKS, NO_UNIQUE_CHECKS,
};
pub use error::{GalenaError, Result};
pub use gtid::{Gtid, GtidManager, GTID_BINARY_SIZE};
pub use index_details::{IndexDetails, IndexPathSet};
pub use key::{IndexKey, OrderedFloat};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use query_cache::{CachedPlan, QueryCache, QueryHash};
pub use storage::{BulkLoader, Dictionary, DictionaryEngine, HotIndexBuilder, MemEngine};
pub use txn::{ConnectionId, Transaction, TransactionId, TxnState};
