//! Strict two-phase locking, no-wait flavor
//!
//! Every access takes the cell's reader-writer spinlock with a try variant:
//! a failed acquisition aborts the transaction immediately, which makes
//! deadlock impossible. Inserts take the strict successor's write lock
//! (next-key locking) to close range phantoms, install the new cell already
//! write-locked, then give the successor lock back. Commit is publication
//! only: every write-set cell is already exclusively held.
//!
//! A deleted cell keeps its write lock forever: later try-locks fail and
//! the epoch barrier reclaims the memory. The per-table sentinel at the
//! maximum key (installed at engine construction, record-less) is what an
//! insert past the last real key locks as its successor.

use crate::protocol::{CcTx, OpResult, TxSource, TxState};
use crate::rwset::{ReadWriteSet, RwType};
use bedrock_core::{AbortReason, Epoch, Key, RecordPtr, Schema, TableId, TxId};
use bedrock_index::{CellRef, InsertResult, OrderedIndex};
use bedrock_runtime::{EpochManager, EpochWorker, Garbage, GcQueue, RecordCache};
use bedrock_sync::SpinRwLock;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Key reserved for the per-table next-key sentinel.
pub const SENTINEL_KEY: Key = Key::MAX;

/// Shared value cell: reader-writer spinlock plus the record pointer.
pub struct NoWaitCell {
    lock: SpinRwLock,
    rec: AtomicPtr<u8>,
}

impl NoWaitCell {
    fn new(rec: Option<RecordPtr>) -> Self {
        NoWaitCell {
            lock: SpinRwLock::new(),
            rec: AtomicPtr::new(
                rec.map(RecordPtr::as_ptr).unwrap_or(std::ptr::null_mut()),
            ),
        }
    }

    /// Cell for an in-flight insert: exclusively held by its creator.
    fn new_locked() -> Self {
        let cell = NoWaitCell::new(None);
        cell.lock.lock();
        cell
    }

    #[inline]
    fn load_rec(&self) -> Option<RecordPtr> {
        RecordPtr::from_raw(self.rec.load(Ordering::Acquire))
    }

    fn swap_rec(&self, new: Option<RecordPtr>) -> Option<RecordPtr> {
        let raw = new.map(RecordPtr::as_ptr).unwrap_or(std::ptr::null_mut());
        RecordPtr::from_raw(self.rec.swap(raw, Ordering::AcqRel))
    }
}

struct NoWaitEntry {
    /// Local record buffer; set for UPDATE and INSERT.
    rec: Option<RecordPtr>,
    rwt: RwType,
    /// Whether this transaction created the cell.
    is_new: bool,
    cell: CellRef<NoWaitCell>,
}

/// How the successor lock was obtained for a next-key insert.
enum NextKeyHold {
    Fresh,
    Upgraded,
    AlreadyHeld,
}

/// No-wait engine: schema, index, and the epoch clock.
pub struct NoWaitEngine {
    schema: Arc<Schema>,
    index: OrderedIndex<NoWaitCell>,
    epochs: Arc<EpochManager>,
}

impl NoWaitEngine {
    /// Build an engine over `schema` for `num_workers` workers. Installs
    /// the next-key sentinel in every table.
    pub fn new(schema: Arc<Schema>, num_workers: usize) -> Arc<Self> {
        let index = OrderedIndex::new();
        for table in schema.tables() {
            index.register_table(table);
            index.insert(table, SENTINEL_KEY, CellRef::alloc(NoWaitCell::new(None)));
        }
        Arc::new(NoWaitEngine {
            schema,
            index,
            epochs: EpochManager::new(num_workers),
        })
    }

    /// Bulk-load one committed record. Single-threaded, before any worker
    /// runs; `key` must be below [`SENTINEL_KEY`] and not loaded yet.
    pub fn load(&self, table: TableId, key: Key, record: &[u8]) {
        let size = self.schema.record_size(table);
        assert_eq!(record.len(), size, "record size mismatch in load");
        assert_ne!(key, SENTINEL_KEY, "sentinel key is reserved");
        let rec = bedrock_core::alloc_record(size);
        unsafe {
            rec.as_mut_slice(size).copy_from_slice(record);
        }
        let outcome = self
            .index
            .insert(table, key, CellRef::alloc(NoWaitCell::new(Some(rec))));
        assert!(
            matches!(outcome, InsertResult::Inserted(_)),
            "duplicate key in load"
        );
    }

    /// The epoch clock, for driving advancement.
    pub fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    /// The table catalog.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Handle for worker `id`; create it on the thread that will use it.
    pub fn worker(self: &Arc<Self>, id: usize) -> NoWaitWorker {
        NoWaitWorker {
            engine: Arc::clone(self),
            epoch: self.epochs.worker(id),
            gc: RefCell::new(GcQueue::new()),
            cache: RefCell::new(RecordCache::default()),
            txid_counter: Cell::new(1),
            id: id as u32,
        }
    }
}

/// Per-worker no-wait state.
pub struct NoWaitWorker {
    engine: Arc<NoWaitEngine>,
    epoch: EpochWorker,
    gc: RefCell<GcQueue>,
    cache: RefCell<RecordCache>,
    txid_counter: Cell<u32>,
    id: u32,
}

impl NoWaitWorker {
    fn alloc_rec(&self, size: usize) -> RecordPtr {
        self.cache.borrow_mut().alloc(size)
    }

    fn free_rec(&self, rec: RecordPtr, size: usize) {
        unsafe {
            self.cache.borrow_mut().free(rec, size);
        }
    }

    fn defer(&self, epoch: Epoch, garbage: Garbage) {
        self.gc.borrow_mut().defer(epoch as u64, garbage);
    }

    fn next_txid(&self) -> TxId {
        let counter = self.txid_counter.get();
        self.txid_counter.set(counter.wrapping_add(1));
        TxId::new(self.id, counter)
    }
}

impl TxSource for NoWaitWorker {
    type Tx<'a>
        = NoWaitTx<'a>
    where
        Self: 'a;

    fn begin(&self) -> NoWaitTx<'_> {
        let epoch = self.epoch.refresh();
        let txid = self.next_txid();
        trace!(%txid, epoch, "begin");
        NoWaitTx {
            worker: self,
            txid,
            epoch,
            tables: BTreeSet::new(),
            rws: ReadWriteSet::default(),
            state: TxState::Active,
        }
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.engine.schema
    }
}

/// A no-wait transaction.
pub struct NoWaitTx<'w> {
    worker: &'w NoWaitWorker,
    txid: TxId,
    epoch: Epoch,
    tables: BTreeSet<TableId>,
    rws: ReadWriteSet<NoWaitEntry>,
    state: TxState,
}

impl NoWaitTx<'_> {
    fn record_size(&self, table: TableId) -> usize {
        self.worker.engine.schema.record_size(table)
    }

    fn finish(&mut self, state: TxState) {
        self.rws.clear();
        self.tables.clear();
        self.state = state;
    }

    /// Take the successor's write lock for a next-key insert.
    fn lock_next_key(&self, table: TableId, key: Key) -> Result<(CellRef<NoWaitCell>, NextKeyHold), AbortReason> {
        let Some((next_key, next_cell)) = self.worker.engine.index.get_next_kv(table, key) else {
            return Err(AbortReason::NextKey);
        };
        let hold = match self.rws.get(table, next_key).map(|e| e.rwt) {
            None => {
                if !next_cell.get().lock.try_lock() {
                    return Err(AbortReason::LockFailed);
                }
                NextKeyHold::Fresh
            }
            Some(RwType::Read) => {
                if !next_cell.get().lock.try_lock_upgrade() {
                    return Err(AbortReason::LockFailed);
                }
                NextKeyHold::Upgraded
            }
            // Already write-locked by this transaction.
            Some(_) => NextKeyHold::AlreadyHeld,
        };
        Ok((next_cell, hold))
    }

    /// Give the successor lock back to the state it was in before
    /// [`Self::lock_next_key`].
    fn release_next_key(&self, next_cell: CellRef<NoWaitCell>, hold: NextKeyHold) {
        match hold {
            NextKeyHold::Fresh => next_cell.get().lock.unlock(),
            NextKeyHold::Upgraded => next_cell.get().lock.downgrade(),
            NextKeyHold::AlreadyHeld => {}
        }
    }

    /// Insert path once the key is known untouched: next-key lock, install
    /// a locked cell, hand back the successor.
    fn insert_fresh(&mut self, table: TableId, key: Key) -> OpResult {
        let size = self.record_size(table);
        let (next_cell, hold) = self.lock_next_key(table, key)?;
        let cell = CellRef::alloc(NoWaitCell::new_locked());
        match self.worker.engine.index.insert(table, key, cell) {
            InsertResult::AlreadyPresent => {
                // Lost the race; the cell was never shared.
                unsafe {
                    drop(cell.into_box());
                }
                self.release_next_key(next_cell, hold);
                Err(AbortReason::AlreadyPresent)
            }
            _ => {
                self.release_next_key(next_cell, hold);
                let rec = self.worker.alloc_rec(size);
                self.rws.table(table).insert(
                    key,
                    NoWaitEntry {
                        rec: Some(rec),
                        rwt: RwType::Insert,
                        is_new: true,
                        cell,
                    },
                );
                Ok(rec)
            }
        }
    }

    /// First-touch update: write-lock the cell and copy its record.
    fn update_first_touch(
        &mut self,
        table: TableId,
        key: Key,
        cell: CellRef<NoWaitCell>,
    ) -> OpResult {
        let size = self.record_size(table);
        if !cell.get().lock.try_lock() {
            return Err(AbortReason::LockFailed);
        }
        let Some(shared) = cell.get().load_rec() else {
            // Record-less cell (sentinel): not a real key.
            cell.get().lock.unlock();
            return Err(AbortReason::NotFound);
        };
        let rec = self.worker.alloc_rec(size);
        unsafe {
            rec.copy_from(shared, size);
        }
        self.rws.table(table).insert(
            key,
            NoWaitEntry {
                rec: Some(rec),
                rwt: RwType::Update,
                is_new: false,
                cell,
            },
        );
        Ok(rec)
    }
}

impl CcTx for NoWaitTx<'_> {
    fn read(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, epoch = self.epoch, table, key, "read");
        self.tables.insert(table);
        if self.rws.get(table, key).is_none() {
            let Some(cell) = self.worker.engine.index.find(table, key) else {
                return Err(AbortReason::NotFound);
            };
            if !cell.get().lock.try_lock_shared() {
                return Err(AbortReason::LockFailed);
            }
            let Some(rec) = cell.get().load_rec() else {
                cell.get().lock.unlock_shared();
                return Err(AbortReason::NotFound);
            };
            self.rws.table(table).insert(
                key,
                NoWaitEntry {
                    rec: None,
                    rwt: RwType::Read,
                    is_new: false,
                    cell,
                },
            );
            return Ok(rec);
        }
        let entry = self.rws.get(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read => Ok(entry
                .cell
                .get()
                .load_rec()
                .expect("read-locked cell has a record")),
            RwType::Update | RwType::Insert => {
                Ok(entry.rec.expect("write entry has a local record"))
            }
            RwType::Delete => Err(AbortReason::NotFound),
        }
    }

    fn insert(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, epoch = self.epoch, table, key, "insert");
        self.tables.insert(table);
        let size = self.record_size(table);
        if self.rws.get(table, key).is_none() {
            if self.worker.engine.index.find(table, key).is_some() {
                return Err(AbortReason::AlreadyPresent);
            }
            return self.insert_fresh(table, key);
        }
        let entry = self.rws.get_mut(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read | RwType::Update | RwType::Insert => Err(AbortReason::AlreadyPresent),
            RwType::Delete => {
                let rec = self.worker.alloc_rec(size);
                let entry = self.rws.get_mut(table, key).expect("still present");
                entry.rec = Some(rec);
                entry.rwt = RwType::Update;
                Ok(rec)
            }
        }
    }

    fn update(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, epoch = self.epoch, table, key, "update");
        self.tables.insert(table);
        let size = self.record_size(table);
        if self.rws.get(table, key).is_none() {
            let Some(cell) = self.worker.engine.index.find(table, key) else {
                return Err(AbortReason::NotFound);
            };
            return self.update_first_touch(table, key, cell);
        }
        let entry = self.rws.get_mut(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read => {
                if !entry.cell.get().lock.try_lock_upgrade() {
                    return Err(AbortReason::LockFailed);
                }
                let shared = entry
                    .cell
                    .get()
                    .load_rec()
                    .expect("write-locked cell has a record");
                let rec = self.worker.alloc_rec(size);
                unsafe {
                    rec.copy_from(shared, size);
                }
                entry.rec = Some(rec);
                entry.rwt = RwType::Update;
                Ok(rec)
            }
            RwType::Update | RwType::Insert => {
                Ok(entry.rec.expect("write entry has a local record"))
            }
            RwType::Delete => Err(AbortReason::NotFound),
        }
    }

    fn upsert(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, epoch = self.epoch, table, key, "upsert");
        self.tables.insert(table);
        let size = self.record_size(table);
        if self.rws.get(table, key).is_none() {
            return match self.worker.engine.index.find(table, key) {
                None => self.insert_fresh(table, key),
                Some(cell) => self.update_first_touch(table, key, cell),
            };
        }
        let rwt = self.rws.get(table, key).expect("checked above").rwt;
        match rwt {
            RwType::Read | RwType::Update | RwType::Insert => self.update(table, key),
            RwType::Delete => {
                let rec = self.worker.alloc_rec(size);
                let entry = self.rws.get_mut(table, key).expect("still present");
                entry.rec = Some(rec);
                entry.rwt = RwType::Update;
                Ok(rec)
            }
        }
    }

    fn remove(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, epoch = self.epoch, table, key, "remove");
        self.tables.insert(table);
        let size = self.record_size(table);
        if self.rws.get(table, key).is_none() {
            let Some(cell) = self.worker.engine.index.find(table, key) else {
                return Err(AbortReason::NotFound);
            };
            if !cell.get().lock.try_lock() {
                return Err(AbortReason::LockFailed);
            }
            let Some(rec) = cell.get().load_rec() else {
                cell.get().lock.unlock();
                return Err(AbortReason::NotFound);
            };
            self.rws.table(table).insert(
                key,
                NoWaitEntry {
                    rec: None,
                    rwt: RwType::Delete,
                    is_new: false,
                    cell,
                },
            );
            return Ok(rec);
        }
        let entry = self.rws.get_mut(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read => {
                if !entry.cell.get().lock.try_lock_upgrade() {
                    return Err(AbortReason::LockFailed);
                }
                entry.rwt = RwType::Delete;
                Ok(entry
                    .cell
                    .get()
                    .load_rec()
                    .expect("write-locked cell has a record"))
            }
            RwType::Update | RwType::Insert => {
                let local = entry.rec.take().expect("write entry has a local record");
                let shared = entry.cell.get().load_rec();
                entry.rwt = RwType::Delete;
                self.worker.free_rec(local, size);
                match shared {
                    // Deleting a record this transaction inserted: callers
                    // treat the key as absent.
                    None => Err(AbortReason::NotFound),
                    Some(rec) => Ok(rec),
                }
            }
            RwType::Delete => Err(AbortReason::NotFound),
        }
    }

    fn read_scan(
        &mut self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        limit: Option<usize>,
        reverse: bool,
        visit: &mut dyn FnMut(Key, RecordPtr),
    ) -> Result<(), AbortReason> {
        trace!(txid = %self.txid, epoch = self.epoch, table, lkey, rkey, reverse, "read_scan");
        self.tables.insert(table);
        let index = &self.worker.engine.index;
        let mut kvs: Vec<(Key, CellRef<NoWaitCell>)> = Vec::new();
        {
            let per_leaf = |_: &bedrock_index::LeafView<NoWaitCell>, _: &mut bool| {};
            let per_kv = |key: Key, cell: CellRef<NoWaitCell>, cont: &mut bool| {
                kvs.push((key, cell));
                if limit.map_or(false, |n| kvs.len() >= n) {
                    *cont = false;
                }
            };
            if reverse {
                index.rscan(table, lkey, rkey, per_leaf, per_kv);
            } else {
                index.scan(table, lkey, rkey, per_leaf, per_kv);
            }
        }

        for (key, cell) in kvs {
            match self.rws.entry(table, key) {
                Entry::Vacant(vacant) => {
                    if !cell.get().lock.try_lock_shared() {
                        return Err(AbortReason::LockFailed);
                    }
                    let Some(rec) = cell.get().load_rec() else {
                        // Sentinel or detached: not a live key.
                        cell.get().lock.unlock_shared();
                        continue;
                    };
                    vacant.insert(NoWaitEntry {
                        rec: None,
                        rwt: RwType::Read,
                        is_new: false,
                        cell,
                    });
                    visit(key, rec);
                }
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    match entry.rwt {
                        RwType::Read => visit(
                            key,
                            entry
                                .cell
                                .get()
                                .load_rec()
                                .expect("read-locked cell has a record"),
                        ),
                        RwType::Update | RwType::Insert => {
                            visit(key, entry.rec.expect("write entry has a local record"))
                        }
                        RwType::Delete => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn update_scan(
        &mut self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        limit: Option<usize>,
        reverse: bool,
        visit: &mut dyn FnMut(Key, RecordPtr),
    ) -> Result<(), AbortReason> {
        trace!(txid = %self.txid, epoch = self.epoch, table, lkey, rkey, reverse, "update_scan");
        self.tables.insert(table);
        let size = self.record_size(table);
        let index = &self.worker.engine.index;
        let mut kvs: Vec<(Key, CellRef<NoWaitCell>)> = Vec::new();
        {
            let per_leaf = |_: &bedrock_index::LeafView<NoWaitCell>, _: &mut bool| {};
            let per_kv = |key: Key, cell: CellRef<NoWaitCell>, cont: &mut bool| {
                kvs.push((key, cell));
                if limit.map_or(false, |n| kvs.len() >= n) {
                    *cont = false;
                }
            };
            if reverse {
                index.rscan(table, lkey, rkey, per_leaf, per_kv);
            } else {
                index.scan(table, lkey, rkey, per_leaf, per_kv);
            }
        }

        for (key, cell) in kvs {
            match self.rws.entry(table, key) {
                Entry::Vacant(vacant) => {
                    if !cell.get().lock.try_lock() {
                        return Err(AbortReason::LockFailed);
                    }
                    let Some(shared) = cell.get().load_rec() else {
                        cell.get().lock.unlock();
                        continue;
                    };
                    let rec = self.worker.alloc_rec(size);
                    unsafe {
                        rec.copy_from(shared, size);
                    }
                    vacant.insert(NoWaitEntry {
                        rec: Some(rec),
                        rwt: RwType::Update,
                        is_new: false,
                        cell,
                    });
                    visit(key, rec);
                }
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    match entry.rwt {
                        RwType::Read => {
                            if !entry.cell.get().lock.try_lock_upgrade() {
                                return Err(AbortReason::LockFailed);
                            }
                            let shared = entry
                                .cell
                                .get()
                                .load_rec()
                                .expect("write-locked cell has a record");
                            let rec = self.worker.alloc_rec(size);
                            unsafe {
                                rec.copy_from(shared, size);
                            }
                            entry.rec = Some(rec);
                            entry.rwt = RwType::Update;
                            visit(key, rec);
                        }
                        RwType::Update | RwType::Insert => {
                            visit(key, entry.rec.expect("write entry has a local record"))
                        }
                        RwType::Delete => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn precommit(&mut self) -> Result<(), AbortReason> {
        trace!(txid = %self.txid, epoch = self.epoch, "precommit");
        if self.state != TxState::Active {
            return Err(AbortReason::Validation);
        }
        let tables: Vec<TableId> = self.tables.iter().copied().collect();

        // Read locks go first; writes are already exclusively held.
        for &table in &tables {
            for (_, entry) in self.rws.iter_table(table) {
                if entry.rwt == RwType::Read {
                    entry.cell.get().lock.unlock_shared();
                }
            }
        }

        // Publication.
        for &table in &tables {
            let size = self.record_size(table);
            let keys: Vec<Key> = self.rws.iter_table(table).map(|(k, _)| k).collect();
            for key in keys {
                let entry = self.rws.get_mut(table, key).expect("key listed above");
                let rwt = entry.rwt;
                let cell = entry.cell;
                match rwt {
                    RwType::Read => {}
                    RwType::Update | RwType::Insert => {
                        let new_rec = entry.rec.take();
                        let old = cell.get().swap_rec(new_rec);
                        cell.get().lock.unlock();
                        if let Some(old) = old {
                            self.worker.free_rec(old, size);
                        }
                    }
                    RwType::Delete => {
                        // The cell stays write-locked forever: later
                        // try-locks fail until the epoch barrier reclaims.
                        self.worker.engine.index.remove(table, key);
                        if let Some(old) = cell.get().swap_rec(None) {
                            self.worker.free_rec(old, size);
                        }
                        self.worker.defer(
                            self.epoch,
                            Garbage::new(move || unsafe {
                                drop(cell.into_box());
                            }),
                        );
                    }
                }
            }
        }

        trace!(txid = %self.txid, epoch = self.epoch, "committed");
        self.finish(TxState::Committed);
        Ok(())
    }

    fn abort(&mut self) {
        if self.state != TxState::Active {
            return;
        }
        trace!(txid = %self.txid, epoch = self.epoch, "abort");
        let tables: Vec<TableId> = self.tables.iter().copied().collect();
        for table in tables {
            let size = self.record_size(table);
            let keys: Vec<Key> = self.rws.iter_table(table).map(|(k, _)| k).collect();
            for key in keys {
                let (rwt, is_new, cell, local) = {
                    let entry = self.rws.get_mut(table, key).expect("key listed above");
                    (entry.rwt, entry.is_new, entry.cell, entry.rec.take())
                };
                if is_new {
                    // The never-published cell leaves the index still
                    // locked, so nobody can observe it before reclamation.
                    self.worker.engine.index.remove(table, key);
                    self.worker.defer(
                        self.epoch,
                        Garbage::new(move || unsafe {
                            drop(cell.into_box());
                        }),
                    );
                }
                if let Some(local) = local {
                    self.worker.free_rec(local, size);
                }
                match rwt {
                    RwType::Read => cell.get().lock.unlock_shared(),
                    RwType::Update | RwType::Insert | RwType::Delete => {
                        if !is_new {
                            cell.get().lock.unlock();
                        }
                    }
                }
            }
        }
        self.finish(TxState::Aborted);
    }

    fn restart(&mut self) {
        debug_assert_ne!(self.state, TxState::Active, "restart of a live transaction");
        self.epoch = self.worker.epoch.refresh();
        self.txid = self.worker.next_txid();
        self.state = TxState::Active;
        trace!(txid = %self.txid, epoch = self.epoch, "restart");
    }
}

impl Drop for NoWaitTx<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.abort();
        }
        self.worker.gc.borrow_mut().reclaim_epoch(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::Tx;
    use bedrock_core::TxError;

    const T: TableId = 1;

    fn engine(workers: usize) -> Arc<NoWaitEngine> {
        let schema = Schema::builder().table(T, 8).freeze();
        NoWaitEngine::new(schema, workers)
    }

    fn put(worker: &NoWaitWorker, key: Key, value: u64) {
        let mut tx = Tx::begin(worker);
        tx.prepare_upsert(T, key)
            .unwrap()
            .copy_from_slice(&value.to_le_bytes());
        tx.commit().unwrap();
    }

    fn get(worker: &NoWaitWorker, key: Key) -> Option<u64> {
        let mut tx = Tx::begin(worker);
        let out = tx
            .get(T, key)
            .ok()
            .map(|rec| u64::from_le_bytes(rec.try_into().unwrap()));
        tx.commit().unwrap();
        out
    }

    #[test]
    fn test_insert_update_delete_round_trip() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 1, 10);
        assert_eq!(get(&w, 1), Some(10));
        put(&w, 1, 11);
        assert_eq!(get(&w, 1), Some(11));

        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 1).unwrap();
        tx.commit().unwrap();
        assert_eq!(get(&w, 1), None);
    }

    #[test]
    fn test_deleted_key_can_be_reinserted() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 2, 1);
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 2).unwrap();
        tx.commit().unwrap();

        put(&w, 2, 5);
        assert_eq!(get(&w, 2), Some(5));
    }

    #[test]
    fn test_opposite_order_writers_one_dies() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 10, 0);
        put(&w0, 20, 0);

        // T0 writes 10 then 20; T1 writes 20 then 10. No waiting means the
        // second acquisition of whichever lock is contested fails at once.
        let mut t0 = Tx::begin(&w0);
        let mut t1 = Tx::begin(&w1);
        t0.prepare_update(T, 10)
            .unwrap()
            .copy_from_slice(&1u64.to_le_bytes());
        t1.prepare_update(T, 20)
            .unwrap()
            .copy_from_slice(&2u64.to_le_bytes());

        assert!(matches!(
            t0.prepare_update(T, 20),
            Err(TxError::Conflict(AbortReason::LockFailed))
        ));
        t0.abort();

        // With T0 gone, T1 finishes both writes.
        t1.prepare_update(T, 10)
            .unwrap()
            .copy_from_slice(&3u64.to_le_bytes());
        t1.commit().unwrap();
        assert_eq!(get(&w0, 10), Some(3));
        assert_eq!(get(&w0, 20), Some(2));
    }

    #[test]
    fn test_readers_share_writers_fail() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 30, 7);

        let mut r0 = Tx::begin(&w0);
        let mut r1 = Tx::begin(&w1);
        assert_eq!(r0.get(T, 30).unwrap(), &7u64.to_le_bytes());
        assert_eq!(r1.get(T, 30).unwrap(), &7u64.to_le_bytes());

        // A writer cannot break in while readers hold the cell.
        let mut writer = Tx::begin(&w1);
        assert!(matches!(
            writer.prepare_update(T, 30),
            Err(TxError::Conflict(AbortReason::LockFailed))
        ));
        writer.abort();
        r0.commit().unwrap();
        r1.commit().unwrap();
    }

    #[test]
    fn test_upgrade_fails_with_second_reader() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 40, 1);

        let mut t0 = Tx::begin(&w0);
        let mut r1 = Tx::begin(&w1);
        assert!(t0.get(T, 40).is_ok());
        assert!(r1.get(T, 40).is_ok());

        // Read-to-write upgrade needs sole ownership.
        assert!(matches!(
            t0.prepare_update(T, 40),
            Err(TxError::Conflict(AbortReason::LockFailed))
        ));
        t0.abort();
        r1.commit().unwrap();
    }

    #[test]
    fn test_next_key_lock_blocks_insert_into_scanned_range() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 100, 1);
        put(&w0, 110, 2);

        let mut scanner = Tx::begin(&w0);
        let mut seen = Vec::new();
        scanner
            .range_scan(T, 100, 200, None, false, |key, _| seen.push(key))
            .unwrap();
        assert_eq!(seen, vec![100, 110]);

        // The inserter needs the successor's (110) write lock, which the
        // scanner holds shared.
        let mut inserter = Tx::begin(&w1);
        assert!(matches!(
            inserter.prepare_insert(T, 105),
            Err(TxError::Conflict(AbortReason::LockFailed))
        ));
        inserter.abort();
        scanner.commit().unwrap();
    }

    #[test]
    fn test_insert_unlocks_successor_after_install() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 50, 1);

        let mut t0 = Tx::begin(&w0);
        t0.prepare_insert(T, 45)
            .unwrap()
            .copy_from_slice(&2u64.to_le_bytes());

        // The successor (50) lock was released after the install, so other
        // transactions can use it.
        assert_eq!(get(&w1, 50), Some(1));

        // The new key itself stays locked until commit.
        let mut t1 = Tx::begin(&w1);
        assert!(t1.get(T, 45).is_err());
        t1.abort();

        t0.commit().unwrap();
        assert_eq!(get(&w1, 45), Some(2));
    }

    #[test]
    fn test_insert_with_read_locked_successor_downgrades_on_success() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 60, 1);

        let mut tx = Tx::begin(&w);
        // Hold the successor shared first.
        assert!(tx.get(T, 60).is_ok());
        // Insert below it: upgrade, install, downgrade back to shared.
        tx.prepare_insert(T, 55)
            .unwrap()
            .copy_from_slice(&2u64.to_le_bytes());
        // The shared hold is still accounted for: commit releases it.
        tx.commit().unwrap();
        assert_eq!(get(&w, 55), Some(2));
        assert_eq!(get(&w, 60), Some(1));
    }

    #[test]
    fn test_abort_releases_everything() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 70, 1);

        let mut tx = Tx::begin(&w);
        assert!(tx.get(T, 70).is_ok());
        tx.prepare_insert(T, 65)
            .unwrap()
            .copy_from_slice(&2u64.to_le_bytes());
        tx.abort();

        // Locks are gone and the aborted insert never became visible.
        put(&w, 70, 3);
        assert_eq!(get(&w, 70), Some(3));
        assert_eq!(get(&w, 65), None);
        put(&w, 65, 4);
        assert_eq!(get(&w, 65), Some(4));
    }

    #[test]
    fn test_scan_skips_own_delete() {
        let engine = engine(1);
        let w = engine.worker(0);
        for k in 80..83u64 {
            put(&w, k, k);
        }
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 81).unwrap();
        let mut seen = Vec::new();
        tx.range_scan(T, 80, 90, None, false, |key, _| seen.push(key))
            .unwrap();
        assert_eq!(seen, vec![80, 82]);
        tx.commit().unwrap();
    }
}
