// galena-core/src/collection/capped.rs
// Capped collections: natural-order inserts, in-memory size/count kept
// valid across aborts by per-transaction rollback notes, and a trim loop
// that never deletes past the smallest uncommitted primary key, so tailing
// cursors see a monotonic prefix of the insertion order.
//
// Locking: next_pk and the uncommitted-min set live under pk_state; trim
// work is serialized by the trim mutex; counters are atomics.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::collection::base::CollectionBase;
use crate::collection::{NO_PK_UNIQUE_CHECKS, NO_UNIQUE_CHECKS};
use crate::document::doc_size;
use crate::error::{GalenaError, Result};
use crate::key::IndexKey;
use crate::log_trace;
use crate::oplog_helpers;
use crate::txn::{Transaction, TransactionId};

/// What one in-flight transaction has done to a capped collection: the
/// smallest pk it inserted plus its net count/size deltas. Commit discards
/// the note; abort applies the deltas in reverse.
#[derive(Debug, Default)]
struct TxnNote {
    min_pk: Option<i64>,
    n_delta: i64,
    size_delta: i64,
}

#[derive(Debug, Default)]
struct PkState {
    next_pk: i64,
    // Smallest pk inserted by each in-flight transaction. Tailable cursors
    // must not read at or beyond the minimum of this set.
    uncommitted_min_pks: BTreeSet<i64>,
    notes: HashMap<TransactionId, Arc<Mutex<TxnNote>>>,
}

#[derive(Debug)]
struct TrimState {
    last_deleted_pk: i64,
}

pub(crate) struct CappedDetails {
    max_size: i64,
    max_objects: i64,
    current_objects: AtomicI64,
    current_size: AtomicI64,
    pk_state: Mutex<PkState>,
    trim_state: Mutex<TrimState>,
}

impl CappedDetails {
    pub(crate) fn new(max_size: i64, max_objects: i64, next_pk: i64) -> Arc<CappedDetails> {
        Arc::new(CappedDetails {
            max_size,
            max_objects,
            current_objects: AtomicI64::new(0),
            current_size: AtomicI64::new(0),
            pk_state: Mutex::new(PkState {
                next_pk,
                ..PkState::default()
            }),
            trim_state: Mutex::new(TrimState { last_deleted_pk: 0 }),
        })
    }

    pub(crate) fn restore_counters(&self, objects: i64, size: i64) {
        self.current_objects.store(objects, Ordering::SeqCst);
        self.current_size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn current_objects(&self) -> i64 {
        self.current_objects.load(Ordering::SeqCst)
    }

    pub(crate) fn current_size(&self) -> i64 {
        self.current_size.load(Ordering::SeqCst)
    }

    pub(crate) fn max_objects(&self) -> i64 {
        self.max_objects
    }

    pub(crate) fn max_size(&self) -> i64 {
        self.max_size
    }

    fn is_gorged(&self) -> bool {
        let n = self.current_objects.load(Ordering::SeqCst);
        let size = self.current_size.load(Ordering::SeqCst);
        (self.max_objects > 0 && n > self.max_objects) || size > self.max_size
    }

    /// The smallest key no tailable cursor may read at or beyond: the
    /// minimum uncommitted pk, or next_pk when nothing is in flight.
    pub(crate) fn min_unsafe_key(&self) -> IndexKey {
        let state = self.pk_state.lock();
        let min = state
            .uncommitted_min_pks
            .iter()
            .next()
            .copied()
            .unwrap_or(state.next_pk);
        IndexKey::Int(min)
    }

    fn take_note(&self, id: TransactionId) -> (Option<i64>, i64, i64) {
        let note = self.pk_state.lock().notes.remove(&id);
        match note {
            Some(note) => {
                let note = note.lock();
                (note.min_pk, note.n_delta, note.size_delta)
            }
            None => (None, 0, 0),
        }
    }

    /// Transaction committed: its minimum pk is no longer uncommitted. The
    /// counters already reflect its work.
    pub(crate) fn note_commit(&self, min_pk: Option<i64>, _n_delta: i64, _size_delta: i64) {
        if let Some(pk) = min_pk {
            self.pk_state.lock().uncommitted_min_pks.remove(&pk);
        }
    }

    /// Transaction aborted: unpublish its minimum pk and roll its deltas
    /// back out of the counters.
    pub(crate) fn note_abort(&self, min_pk: Option<i64>, n_delta: i64, size_delta: i64) {
        if let Some(pk) = min_pk {
            self.pk_state.lock().uncommitted_min_pks.remove(&pk);
        }
        self.current_objects.fetch_sub(n_delta, Ordering::SeqCst);
        self.current_size.fetch_sub(size_delta, Ordering::SeqCst);
    }

    fn min_uncommitted_or_next(&self) -> i64 {
        let state = self.pk_state.lock();
        state
            .uncommitted_min_pks
            .iter()
            .next()
            .copied()
            .unwrap_or(state.next_pk)
    }

    pub(crate) fn last_deleted_pk(&self) -> i64 {
        self.trim_state.lock().last_deleted_pk
    }
}

/// The note for `txn`, creating it (and wiring the commit/abort hooks) on
/// first touch. Callers must already hold `state`.
fn note_for_txn(
    cap: &Arc<CappedDetails>,
    state: &mut PkState,
    txn: &Transaction,
) -> Arc<Mutex<TxnNote>> {
    if let Some(note) = state.notes.get(&txn.id()) {
        return note.clone();
    }
    let note = Arc::new(Mutex::new(TxnNote::default()));
    state.notes.insert(txn.id(), note.clone());

    let me = cap.clone();
    let id = txn.id();
    txn.register_on_commit(move || {
        let (min_pk, n_delta, size_delta) = me.take_note(id);
        me.note_commit(min_pk, n_delta, size_delta);
    });
    let me = cap.clone();
    txn.register_on_abort(move || {
        let (min_pk, n_delta, size_delta) = me.take_note(id);
        me.note_abort(min_pk, n_delta, size_delta);
    });
    note
}

/// Allocate the next pk for `txn` and note it as uncommitted if it is the
/// transaction's first insert here.
fn alloc_pk(cap: &Arc<CappedDetails>, txn: &Transaction) -> i64 {
    let mut state = cap.pk_state.lock();
    let pk = state.next_pk;
    state.next_pk += 1;
    let note = note_for_txn(cap, &mut state, txn);
    let mut note = note.lock();
    if note.min_pk.is_none() {
        note.min_pk = Some(pk);
        state.uncommitted_min_pks.insert(pk);
    }
    pk
}

/// Replay path: adopt an externally supplied pk.
fn note_insert_with_pk(cap: &Arc<CappedDetails>, txn: &Transaction, pk: i64) {
    let mut state = cap.pk_state.lock();
    if state.next_pk <= pk {
        state.next_pk = pk + 1;
    }
    let note = note_for_txn(cap, &mut state, txn);
    let mut note = note.lock();
    match note.min_pk {
        Some(min) if min <= pk => {}
        _ => {
            if let Some(old) = note.min_pk {
                state.uncommitted_min_pks.remove(&old);
            }
            note.min_pk = Some(pk);
            state.uncommitted_min_pks.insert(pk);
        }
    }
}

fn add_deltas(cap: &Arc<CappedDetails>, txn: &Transaction, n_delta: i64, size_delta: i64) {
    let note = {
        let mut state = cap.pk_state.lock();
        note_for_txn(cap, &mut state, txn)
    };
    let mut note = note.lock();
    note.n_delta += n_delta;
    note.size_delta += size_delta;
    cap.current_objects.fetch_add(n_delta, Ordering::SeqCst);
    cap.current_size.fetch_add(size_delta, Ordering::SeqCst);
}

/// Insert through the capped rules: allocate the pk, pre-check unique
/// secondaries (the counter guarantees pk uniqueness), materialize, account,
/// then trim if gorged.
pub(crate) fn insert_object(
    base: &CollectionBase,
    cap: &Arc<CappedDetails>,
    txn: &Transaction,
    obj: &Value,
    flags: u64,
    logop: bool,
) -> Result<IndexKey> {
    let size = doc_size(obj);
    let pk = alloc_pk(cap, txn);
    let pk_key = IndexKey::Int(pk);

    base.check_unique_secondaries(obj, flags)?;
    base.insert_into_indexes(
        txn,
        &pk_key,
        obj,
        flags | NO_UNIQUE_CHECKS | NO_PK_UNIQUE_CHECKS,
    )?;
    add_deltas(cap, txn, 1, size);

    if logop {
        oplog_helpers::log_insert_for_capped(txn, &base.ns, &Value::from(pk), obj);
    }
    check_gorged(base, cap, txn, logop)?;
    Ok(pk_key)
}

/// Replay an insert under a known pk (secondaries applying capped ops).
pub(crate) fn insert_object_with_pk(
    base: &CollectionBase,
    cap: &Arc<CappedDetails>,
    txn: &Transaction,
    pk: i64,
    obj: &Value,
    flags: u64,
) -> Result<()> {
    let size = doc_size(obj);
    note_insert_with_pk(cap, txn, pk);
    base.check_unique_secondaries(obj, flags)?;
    base.insert_into_indexes(
        txn,
        &IndexKey::Int(pk),
        obj,
        flags | NO_UNIQUE_CHECKS | NO_PK_UNIQUE_CHECKS,
    )?;
    add_deltas(cap, txn, 1, size);
    check_gorged(base, cap, txn, false)?;
    Ok(())
}

/// Delete a row. Deletes may not cross into the trimmed region.
pub(crate) fn delete_object(
    base: &CollectionBase,
    cap: &Arc<CappedDetails>,
    txn: &Transaction,
    pk_key: &IndexKey,
    obj: &Value,
    flags: u64,
) -> Result<()> {
    let pk = match pk_key {
        IndexKey::Int(pk) => *pk,
        _ => {
            return Err(GalenaError::InvalidOptions(
                "capped primary keys are integers".to_string(),
            ))
        }
    };
    if pk <= cap.last_deleted_pk() {
        return Err(GalenaError::OperationNotAllowed(format!(
            "pk {} of {} is already trimmed",
            pk, base.ns
        )));
    }
    base.delete_from_indexes(txn, pk_key, obj, flags)?;
    add_deltas(cap, txn, -1, -doc_size(obj));
    Ok(())
}

/// Replace a row in place. The stored document may not grow.
pub(crate) fn update_object(
    base: &CollectionBase,
    cap: &Arc<CappedDetails>,
    txn: &Transaction,
    pk_key: &IndexKey,
    old: &Value,
    new: &Value,
    flags: u64,
) -> Result<()> {
    let old_size = doc_size(old);
    let new_size = doc_size(new);
    if new_size > old_size {
        return Err(GalenaError::CappedSizeViolation {
            ns: base.ns.clone(),
            reason: format!("update grows document from {} to {} bytes", old_size, new_size),
        });
    }
    base.update_in_indexes(txn, pk_key, old, new, flags)?;
    add_deltas(cap, txn, 0, new_size - old_size);
    Ok(())
}

fn check_gorged(
    base: &CollectionBase,
    cap: &Arc<CappedDetails>,
    txn: &Transaction,
    logop: bool,
) -> Result<()> {
    if cap.is_gorged() {
        trim(base, cap, txn, logop)?;
    }
    Ok(())
}

/// While gorged, delete the oldest committed rows. Serialized by the trim
/// mutex; never touches a pk at or beyond the smallest uncommitted one.
fn trim(
    base: &CollectionBase,
    cap: &Arc<CappedDetails>,
    txn: &Transaction,
    logop: bool,
) -> Result<()> {
    let mut trim_state = cap.trim_state.lock();
    let pk_dict = base.pk_index().dict().clone();
    while cap.is_gorged() {
        let min_uncommitted = cap.min_uncommitted_or_next();
        let candidate = pk_dict.successor(&IndexKey::Int(trim_state.last_deleted_pk))?;
        let Some(IndexKey::Int(pk)) = candidate else {
            break;
        };
        if pk >= min_uncommitted {
            break;
        }
        let pk_key = IndexKey::Int(pk);
        let Some(obj) = pk_dict.get(&pk_key)? else {
            trim_state.last_deleted_pk = pk;
            continue;
        };
        log_trace!("trimming pk {} from {}", pk, base.ns);
        base.delete_from_indexes(txn, &pk_key, &obj, 0)?;
        add_deltas(cap, txn, -1, -doc_size(&obj));
        trim_state.last_deleted_pk = pk;
        if logop {
            oplog_helpers::log_delete_for_capped(txn, &base.ns, &Value::from(pk), &obj);
        }
    }
    Ok(())
}

/// Remove everything, resetting the trim high-water mark.
pub(crate) fn empty(
    base: &CollectionBase,
    cap: &Arc<CappedDetails>,
    txn: &Transaction,
) -> Result<()> {
    let mut trim_state = cap.trim_state.lock();
    let pk_dict = base.pk_index().dict().clone();
    for (pk_key, obj) in pk_dict.snapshot() {
        base.delete_from_indexes(txn, &pk_key, &obj, 0)?;
        add_deltas(cap, txn, -1, -doc_size(&obj));
    }
    trim_state.last_deleted_pk = 0;
    Ok(())
}
