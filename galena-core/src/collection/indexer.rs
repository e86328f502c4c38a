// galena-core/src/collection/indexer.rs
// Foreground (cold) and background (hot) index builders. The caller drives
// prepare/build/commit: prepare and commit under an exclusive collection
// lock, build exclusive for cold and shared for hot. After a successful
// commit the indexer must be dropped inside the same exclusive section;
// otherwise another thread could see index_build_in_progress == false while
// storage structures are still being torn down.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::collection::base::{CollectionBase, N_INDEXES_MAX};
use crate::error::{GalenaError, Result};
use crate::index_details::IndexDetails;
use crate::key::IndexKey;
use crate::log_debug;
use crate::storage::HotIndexBuilder;

pub struct Indexer<'c> {
    cl: &'c CollectionBase,
    info: Value,
    hot: bool,
    idx: Option<Arc<IndexDetails>>,
    multikey_tracker: Arc<AtomicBool>,
    hot_builder: Option<Box<dyn HotIndexBuilder>>,
    committed: bool,
}

impl<'c> Indexer<'c> {
    pub(crate) fn new(cl: &'c CollectionBase, info: Value, background: bool) -> Indexer<'c> {
        Indexer {
            cl,
            info,
            hot: background,
            idx: None,
            multikey_tracker: Arc::new(AtomicBool::new(false)),
            hot_builder: None,
            committed: false,
        }
    }

    /// Install the in-progress index at position N. Exclusive lock.
    pub fn prepare(&mut self) -> Result<()> {
        if self.cl.index_build_in_progress.swap(true, Ordering::SeqCst) {
            return Err(GalenaError::IndexBuildInProgress(self.cl.ns.clone()));
        }
        if self.cl.n_indexes() >= N_INDEXES_MAX {
            self.cl.index_build_in_progress.store(false, Ordering::SeqCst);
            return Err(GalenaError::TooManyIndexes {
                ns: self.cl.ns.clone(),
                max: N_INDEXES_MAX,
            });
        }

        let idx = match IndexDetails::open(&self.cl.engine, self.info.clone()) {
            Ok(idx) => idx,
            Err(e) => {
                self.cl.index_build_in_progress.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.cl.indexes.write().push(idx.clone());
        // Writes from here on maintain the new index; recompute the path set
        // so updates know its fields are indexed.
        self.cl.compute_index_keys();
        self.idx = Some(idx);

        if self.hot {
            let idx = self.idx.as_ref().unwrap().clone();
            let tracker = self.multikey_tracker.clone();
            let extract = move |pk_key: &IndexKey, doc: &Value| -> Result<Vec<(IndexKey, Value)>> {
                let keys = idx.generate_keys(doc)?;
                if keys.len() > 1 {
                    tracker.store(true, Ordering::SeqCst);
                }
                Ok(keys
                    .into_iter()
                    .map(|k| (k.with_pk(pk_key), Value::Null))
                    .collect())
            };
            let builder = self.cl.engine.begin_hot_index(
                self.cl.pk_index().dict().clone(),
                self.idx.as_ref().unwrap().dict().clone(),
                Arc::new(extract),
            )?;
            self.hot_builder = Some(builder);
        }
        log_debug!(
            "prepared {} index build of {} on {}",
            if self.hot { "hot" } else { "cold" },
            self.idx.as_ref().unwrap().name(),
            self.cl.ns
        );
        Ok(())
    }

    /// Populate the new index. Cold builds scan the primary index under an
    /// exclusive lock; hot builds run the engine's online indexer under a
    /// shared lock while concurrent writes keep it current.
    pub fn build(&mut self) -> Result<()> {
        let idx = self
            .idx
            .as_ref()
            .expect("build before prepare")
            .clone();
        match self.hot_builder.as_mut() {
            Some(builder) => builder.build(),
            None => {
                for (pk_key, doc) in self.cl.pk_index().dict().snapshot() {
                    let keys = idx.generate_keys(&doc)?;
                    if keys.len() > 1 {
                        self.multikey_tracker.store(true, Ordering::SeqCst);
                    }
                    for key in keys {
                        idx.dict().put_untracked(key.with_pk(&pk_key), Value::Null)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Make the index visible. Exclusive lock; drop the indexer in the same
    /// section.
    pub fn commit(&mut self) -> Result<()> {
        let idx = self.idx.as_ref().expect("commit before prepare").clone();
        if idx.is_unique() {
            check_index_uniqueness(&idx)?;
        }

        let position = self.cl.indexes.read().len() - 1;
        if self.multikey_tracker.load(Ordering::SeqCst) {
            self.cl.set_index_is_multikey(position);
        }
        self.cl.n_indexes.fetch_add(1, Ordering::SeqCst);
        self.cl.index_build_in_progress.store(false, Ordering::SeqCst);
        self.committed = true;
        self.cl.compute_index_keys();
        self.cl.persist_metadata()?;
        log_debug!("committed index {} on {}", idx.name(), self.cl.ns);
        Ok(())
    }
}

impl Drop for Indexer<'_> {
    // Failure at any phase: the in-progress index is dropped and no partial
    // state survives.
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.hot_builder = None;
        if let Some(idx) = self.idx.take() {
            let mut indexes = self.cl.indexes.write();
            if let Some(pos) = indexes.iter().position(|i| Arc::ptr_eq(i, &idx)) {
                indexes.remove(pos);
            }
            drop(indexes);
            let _ = self
                .cl
                .engine
                .drop_dictionary(&format!("{}.${}", self.cl.ns, idx.name()));
            self.cl.index_build_in_progress.store(false, Ordering::SeqCst);
            self.cl.compute_index_keys();
        }
    }
}

/// Scan for adjacent entries sharing a secondary key. Entries are ordered,
/// so duplicates under a unique index are always neighbors.
pub(crate) fn check_index_uniqueness(idx: &IndexDetails) -> Result<()> {
    let entries = idx.dict().snapshot();
    for pair in entries.windows(2) {
        let (a, b) = (&pair[0].0, &pair[1].0);
        if let (IndexKey::Compound(ka), IndexKey::Compound(kb)) = (a, b) {
            if ka.len() == kb.len() && ka[..ka.len() - 1] == kb[..kb.len() - 1] {
                return Err(GalenaError::DuplicateKey {
                    index: idx.name().to_string(),
                    key: a.display(),
                });
            }
        }
    }
    Ok(())
}
