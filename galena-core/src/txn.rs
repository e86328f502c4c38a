// galena-core/src/txn.rs
// Transaction context consumed by the collection layer. A transaction owns
// an undo log of dictionary mutations plus commit/abort hooks registered by
// interested parties (capped collections use these to settle their counters).
// Replication ops buffer here and are flushed to the oplog at commit time by
// whoever drives the commit (see CollectionMap::commit_txn).

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

type Hook = Box<dyn FnOnce() + Send>;

pub struct Transaction {
    id: TransactionId,
    connection: ConnectionId,
    state: Mutex<TxnState>,
    undo: Mutex<Vec<Hook>>,
    on_commit: Mutex<Vec<Hook>>,
    on_abort: Mutex<Vec<Hook>>,
    repl_ops: Mutex<Vec<Value>>,
}

impl Transaction {
    pub fn begin(connection: ConnectionId) -> Transaction {
        Transaction {
            id: TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst)),
            connection,
            state: Mutex::new(TxnState::Active),
            undo: Mutex::new(Vec::new()),
            on_commit: Mutex::new(Vec::new()),
            on_abort: Mutex::new(Vec::new()),
            repl_ops: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    /// Register a hook that fires when this transaction commits.
    pub fn register_on_commit<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.on_commit.lock().push(Box::new(f));
    }

    /// Register a hook that fires when this transaction aborts.
    pub fn register_on_abort<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.on_abort.lock().push(Box::new(f));
    }

    /// Record how to undo a storage mutation. Undo entries run in reverse
    /// order on abort.
    pub(crate) fn push_undo<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.undo.lock().push(Box::new(f));
    }

    /// Buffer a replication op for this transaction. Flushed to the oplog
    /// under a fresh GTID when the transaction commits.
    pub fn log_op_for_replication(&self, op: Value) {
        self.repl_ops.lock().push(op);
    }

    pub fn has_repl_ops(&self) -> bool {
        !self.repl_ops.lock().is_empty()
    }

    pub(crate) fn take_repl_ops(&self) -> Vec<Value> {
        std::mem::take(&mut *self.repl_ops.lock())
    }

    /// Commit: drop the undo log and fire commit hooks in registration order.
    pub fn commit(self) {
        {
            let mut state = self.state.lock();
            assert_eq!(*state, TxnState::Active, "commit of a finished transaction");
            *state = TxnState::Committed;
        }
        self.undo.lock().clear();
        let hooks = std::mem::take(&mut *self.on_commit.lock());
        for hook in hooks {
            hook();
        }
    }

    /// Abort: roll back storage mutations in reverse order, then fire abort
    /// hooks in registration order.
    pub fn abort(self) {
        self.abort_inner();
    }

    fn abort_inner(&self) {
        {
            let mut state = self.state.lock();
            if *state != TxnState::Active {
                return;
            }
            *state = TxnState::Aborted;
        }
        let undo = std::mem::take(&mut *self.undo.lock());
        for op in undo.into_iter().rev() {
            op();
        }
        let hooks = std::mem::take(&mut *self.on_abort.lock());
        for hook in hooks {
            hook();
        }
        self.repl_ops.lock().clear();
    }
}

impl Drop for Transaction {
    // A transaction dropped while still active rolls back.
    fn drop(&mut self) {
        self.abort_inner();
    }
}
