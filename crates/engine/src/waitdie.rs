//! Strict two-phase locking, wait-die flavor
//!
//! Structurally the no-wait protocol with every lock acquisition routed
//! through the timestamp-ordered wait-die lock: an older transaction
//! blocks until the lock is grantable, a younger one fails and aborts.
//! There is no validation phase beyond the lock protocol itself.
//!
//! Cells deleted at commit are unlocked (unlike no-wait's locked-forever
//! discipline) and signal detachment through a null record pointer; any
//! later acquirer re-checks and treats the key as absent. Reclamation uses
//! the timestamp watermarks: garbage is staged during the transaction,
//! stamped with the largest-worker watermark at teardown, and freed once
//! the smallest-worker watermark passes it.

use crate::protocol::{CcTx, OpResult, TxSource, TxState};
use crate::rwset::{ReadWriteSet, RwType};
use bedrock_core::{AbortReason, Key, RecordPtr, Schema, TableId, Ts, TxId};
use bedrock_index::{CellRef, InsertResult, OrderedIndex};
use bedrock_runtime::{Garbage, GcQueue, RecordCache, TimestampManager, TsWorker};
use bedrock_sync::WaitDieLock;
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Key reserved for the per-table next-key sentinel.
pub const SENTINEL_KEY: Key = Key::MAX;

/// Shared value cell: wait-die lock plus the record pointer. A null record
/// on an unlocked cell means the key was deleted (detached).
pub struct WaitDieCell {
    lock: WaitDieLock,
    rec: AtomicPtr<u8>,
}

impl WaitDieCell {
    fn new(rec: Option<RecordPtr>) -> Self {
        WaitDieCell {
            lock: WaitDieLock::new(),
            rec: AtomicPtr::new(
                rec.map(RecordPtr::as_ptr).unwrap_or(std::ptr::null_mut()),
            ),
        }
    }

    /// Cell for an in-flight insert, exclusively held by its creator.
    fn new_locked(ts: Ts) -> Self {
        let cell = WaitDieCell::new(None);
        let granted = cell.lock.try_lock(ts);
        debug_assert!(granted);
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

struct WaitDieEntry {
    /// Local record buffer; set for UPDATE and INSERT.
    rec: Option<RecordPtr>,
    rwt: RwType,
    /// Whether this transaction created the cell.
    is_new: bool,
    cell: CellRef<WaitDieCell>,
}

enum NextKeyHold {
    Fresh,
    Upgraded,
    AlreadyHeld,
}

/// Wait-die engine: schema, index, and the timestamp service.
pub struct WaitDieEngine {
    schema: Arc<Schema>,
    index: OrderedIndex<WaitDieCell>,
    timestamps: Arc<TimestampManager>,
}

impl WaitDieEngine {
    /// Build an engine over `schema` for `num_workers` workers. Installs
    /// the next-key sentinel in every table.
    pub fn new(schema: Arc<Schema>, num_workers: usize) -> Arc<Self> {
        let index = OrderedIndex::new();
        for table in schema.tables() {
            index.register_table(table);
            index.insert(table, SENTINEL_KEY, CellRef::alloc(WaitDieCell::new(None)));
        }
        Arc::new(WaitDieEngine {
            schema,
            index,
            timestamps: TimestampManager::new(num_workers),
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
            .insert(table, key, CellRef::alloc(WaitDieCell::new(Some(rec))));
        assert!(
            matches!(outcome, InsertResult::Inserted(_)),
            "duplicate key in load"
        );
    }

    /// The timestamp service, for watermark publication.
    pub fn timestamps(&self) -> &Arc<TimestampManager> {
        &self.timestamps
    }

    /// The table catalog.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Handle for worker `id`; create it on the thread that will use it.
    pub fn worker(self: &Arc<Self>, id: u8) -> WaitDieWorker {
        WaitDieWorker {
            engine: Arc::clone(self),
            ts: self.timestamps.worker(id, 1000),
            gc: RefCell::new(GcQueue::new()),
            cache: RefCell::new(RecordCache::default()),
        }
    }
}

/// Per-worker wait-die state.
pub struct WaitDieWorker {
    engine: Arc<WaitDieEngine>,
    ts: TsWorker,
    gc: RefCell<GcQueue>,
    cache: RefCell<RecordCache>,
}

impl WaitDieWorker {
    fn alloc_rec(&self, size: usize) -> RecordPtr {
        self.cache.borrow_mut().alloc(size)
    }

    fn free_rec(&self, rec: RecordPtr, size: usize) {
        unsafe {
            self.cache.borrow_mut().free(rec, size);
        }
    }

    fn stage(&self, garbage: Garbage) {
        self.gc.borrow_mut().stage(garbage);
    }
}

impl TxSource for WaitDieWorker {
    type Tx<'a>
        = WaitDieTx<'a>
    where
        Self: 'a;

    fn begin(&self) -> WaitDieTx<'_> {
        let txid = self.ts.next_txid();
        let start_ts = self.ts.new_ts();
        let smallest_ts = self.ts.smallest_ts();
        let largest_ts = self.ts.largest_ts();
        trace!(%txid, start_ts, smallest_ts, largest_ts, "begin");
        WaitDieTx {
            worker: self,
            txid,
            start_ts,
            smallest_ts,
            largest_ts,
            tables: BTreeSet::new(),
            rws: ReadWriteSet::default(),
            state: TxState::Active,
        }
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.engine.schema
    }
}

/// A wait-die transaction.
pub struct WaitDieTx<'w> {
    worker: &'w WaitDieWorker,
    txid: TxId,
    start_ts: Ts,
    smallest_ts: Ts,
    largest_ts: Ts,
    tables: BTreeSet<TableId>,
    rws: ReadWriteSet<WaitDieEntry>,
    state: TxState,
}

impl WaitDieTx<'_> {
    fn record_size(&self, table: TableId) -> usize {
        self.worker.engine.schema.record_size(table)
    }

    fn finish(&mut self, state: TxState) {
        self.rws.clear();
        self.tables.clear();
        self.state = state;
    }

    fn lock_next_key(
        &self,
        table: TableId,
        key: Key,
    ) -> Result<(CellRef<WaitDieCell>, NextKeyHold), AbortReason> {
        let Some((next_key, next_cell)) = self.worker.engine.index.get_next_kv(table, key) else {
            return Err(AbortReason::NextKey);
        };
        let hold = match self.rws.get(table, next_key).map(|e| e.rwt) {
            None => {
                if !next_cell.get().lock.try_lock(self.start_ts) {
                    return Err(AbortReason::LockFailed);
                }
                NextKeyHold::Fresh
            }
            Some(RwType::Read) => {
                if !next_cell.get().lock.try_lock_upgrade(self.start_ts) {
                    return Err(AbortReason::LockFailed);
                }
                NextKeyHold::Upgraded
            }
            Some(_) => NextKeyHold::AlreadyHeld,
        };
        Ok((next_cell, hold))
    }

    fn release_next_key(&self, next_cell: CellRef<WaitDieCell>, hold: NextKeyHold) {
        match hold {
            NextKeyHold::Fresh => next_cell.get().lock.unlock(self.start_ts),
            NextKeyHold::Upgraded => next_cell.get().lock.downgrade(self.start_ts),
            NextKeyHold::AlreadyHeld => {}
        }
    }

    fn insert_fresh(&mut self, table: TableId, key: Key) -> OpResult {
        let size = self.record_size(table);
        let (next_cell, hold) = self.lock_next_key(table, key)?;
        let cell = CellRef::alloc(WaitDieCell::new_locked(self.start_ts));
        match self.worker.engine.index.insert(table, key, cell) {
            InsertResult::AlreadyPresent => {
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
                    WaitDieEntry {
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

    fn update_first_touch(
        &mut self,
        table: TableId,
        key: Key,
        cell: CellRef<WaitDieCell>,
    ) -> OpResult {
        let size = self.record_size(table);
        if !cell.get().lock.try_lock(self.start_ts) {
            return Err(AbortReason::LockFailed);
        }
        let Some(shared) = cell.get().load_rec() else {
            cell.get().lock.unlock(self.start_ts);
            return Err(AbortReason::Detached);
        };
        let rec = self.worker.alloc_rec(size);
        unsafe {
            rec.copy_from(shared, size);
        }
        self.rws.table(table).insert(
            key,
            WaitDieEntry {
                rec: Some(rec),
                rwt: RwType::Update,
                is_new: false,
                cell,
            },
        );
        Ok(rec)
    }
}

impl CcTx for WaitDieTx<'_> {
    fn read(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, ts = self.start_ts, table, key, "read");
        self.tables.insert(table);
        if self.rws.get(table, key).is_none() {
            let Some(cell) = self.worker.engine.index.find(table, key) else {
                return Err(AbortReason::NotFound);
            };
            if !cell.get().lock.try_lock_shared(self.start_ts) {
                return Err(AbortReason::LockFailed);
            }
            let Some(rec) = cell.get().load_rec() else {
                cell.get().lock.unlock_shared(self.start_ts);
                return Err(AbortReason::Detached);
            };
            self.rws.table(table).insert(
                key,
                WaitDieEntry {
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
        trace!(txid = %self.txid, ts = self.start_ts, table, key, "insert");
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
        trace!(txid = %self.txid, ts = self.start_ts, table, key, "update");
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
                if !entry.cell.get().lock.try_lock_upgrade(self.start_ts) {
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
        trace!(txid = %self.txid, ts = self.start_ts, table, key, "upsert");
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
        trace!(txid = %self.txid, ts = self.start_ts, table, key, "remove");
        self.tables.insert(table);
        let size = self.record_size(table);
        if self.rws.get(table, key).is_none() {
            let Some(cell) = self.worker.engine.index.find(table, key) else {
                return Err(AbortReason::NotFound);
            };
            if !cell.get().lock.try_lock(self.start_ts) {
                return Err(AbortReason::LockFailed);
            }
            let Some(rec) = cell.get().load_rec() else {
                cell.get().lock.unlock(self.start_ts);
                return Err(AbortReason::Detached);
            };
            self.rws.table(table).insert(
                key,
                WaitDieEntry {
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
                if !entry.cell.get().lock.try_lock_upgrade(self.start_ts) {
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
        trace!(txid = %self.txid, ts = self.start_ts, table, lkey, rkey, reverse, "read_scan");
        self.tables.insert(table);
        let start_ts = self.start_ts;
        let rws = self.rws.table(table);
        let mut visited = 0usize;
        let mut failed = None;

        let per_leaf = |_: &bedrock_index::LeafView<WaitDieCell>, _: &mut bool| {};
        let mut per_kv = |key: Key, cell: CellRef<WaitDieCell>, cont: &mut bool| {
            match rws.entry(key) {
                Entry::Vacant(vacant) => {
                    if !cell.get().lock.try_lock_shared(start_ts) {
                        failed = Some(AbortReason::LockFailed);
                        *cont = false;
                        return;
                    }
                    let Some(rec) = cell.get().load_rec() else {
                        // Deleted under us (or the sentinel): skip.
                        cell.get().lock.unlock_shared(start_ts);
                        return;
                    };
                    vacant.insert(WaitDieEntry {
                        rec: None,
                        rwt: RwType::Read,
                        is_new: false,
                        cell,
                    });
                    visit(key, rec);
                    visited += 1;
                }
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    match entry.rwt {
                        RwType::Read => {
                            visit(
                                key,
                                entry
                                    .cell
                                    .get()
                                    .load_rec()
                                    .expect("read-locked cell has a record"),
                            );
                            visited += 1;
                        }
                        RwType::Update | RwType::Insert => {
                            visit(key, entry.rec.expect("write entry has a local record"));
                            visited += 1;
                        }
                        RwType::Delete => {}
                    }
                }
            }
            if limit.map_or(false, |n| visited >= n) {
                *cont = false;
            }
        };

        let index = &self.worker.engine.index;
        if reverse {
            index.rscan(table, lkey, rkey, per_leaf, &mut per_kv);
        } else {
            index.scan(table, lkey, rkey, per_leaf, &mut per_kv);
        }
        match failed {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
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
        trace!(txid = %self.txid, ts = self.start_ts, table, lkey, rkey, reverse, "update_scan");
        self.tables.insert(table);
        let size = self.record_size(table);
        let worker = self.worker;
        let start_ts = self.start_ts;
        let rws = self.rws.table(table);
        let mut visited = 0usize;
        let mut failed = None;

        let per_leaf = |_: &bedrock_index::LeafView<WaitDieCell>, _: &mut bool| {};
        let mut per_kv = |key: Key, cell: CellRef<WaitDieCell>, cont: &mut bool| {
            match rws.entry(key) {
                Entry::Vacant(vacant) => {
                    if !cell.get().lock.try_lock(start_ts) {
                        failed = Some(AbortReason::LockFailed);
                        *cont = false;
                        return;
                    }
                    let Some(shared) = cell.get().load_rec() else {
                        cell.get().lock.unlock(start_ts);
                        return;
                    };
                    let rec = worker.alloc_rec(size);
                    unsafe {
                        rec.copy_from(shared, size);
                    }
                    vacant.insert(WaitDieEntry {
                        rec: Some(rec),
                        rwt: RwType::Update,
                        is_new: false,
                        cell,
                    });
                    visit(key, rec);
                    visited += 1;
                }
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    match entry.rwt {
                        RwType::Read => {
                            if !entry.cell.get().lock.try_lock_upgrade(start_ts) {
                                failed = Some(AbortReason::LockFailed);
                                *cont = false;
                                return;
                            }
                            let shared = entry
                                .cell
                                .get()
                                .load_rec()
                                .expect("write-locked cell has a record");
                            let rec = worker.alloc_rec(size);
                            unsafe {
                                rec.copy_from(shared, size);
                            }
                            entry.rec = Some(rec);
                            entry.rwt = RwType::Update;
                            visit(key, rec);
                            visited += 1;
                        }
                        RwType::Update | RwType::Insert => {
                            visit(key, entry.rec.expect("write entry has a local record"));
                            visited += 1;
                        }
                        RwType::Delete => {}
                    }
                }
            }
            if limit.map_or(false, |n| visited >= n) {
                *cont = false;
            }
        };

        let index = &worker.engine.index;
        if reverse {
            index.rscan(table, lkey, rkey, per_leaf, &mut per_kv);
        } else {
            index.scan(table, lkey, rkey, per_leaf, &mut per_kv);
        }
        match failed {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    fn precommit(&mut self) -> Result<(), AbortReason> {
        trace!(txid = %self.txid, ts = self.start_ts, "precommit");
        if self.state != TxState::Active {
            return Err(AbortReason::Validation);
        }
        let tables: Vec<TableId> = self.tables.iter().copied().collect();

        // Read locks go first; writes are already exclusively held.
        for &table in &tables {
            for (_, entry) in self.rws.iter_table(table) {
                if entry.rwt == RwType::Read {
                    entry.cell.get().lock.unlock_shared(self.start_ts);
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
                        cell.get().lock.unlock(self.start_ts);
                        if let Some(old) = old {
                            self.worker.free_rec(old, size);
                        }
                    }
                    RwType::Delete => {
                        self.worker.engine.index.remove(table, key);
                        let old = cell.get().swap_rec(None);
                        cell.get().lock.unlock(self.start_ts);
                        if let Some(old) = old {
                            self.worker.free_rec(old, size);
                        }
                        self.worker.stage(Garbage::new(move || unsafe {
                            drop(cell.into_box());
                        }));
                    }
                }
            }
        }

        trace!(txid = %self.txid, ts = self.start_ts, "committed");
        self.finish(TxState::Committed);
        Ok(())
    }

    fn abort(&mut self) {
        if self.state != TxState::Active {
            return;
        }
        trace!(txid = %self.txid, ts = self.start_ts, "abort");
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
                    // Retract the never-published cell; its null record
                    // marks it detached for anyone who raced to lock it.
                    self.worker.engine.index.remove(table, key);
                    self.worker.stage(Garbage::new(move || unsafe {
                        drop(cell.into_box());
                    }));
                }
                if let Some(local) = local {
                    self.worker.free_rec(local, size);
                }
                match rwt {
                    RwType::Read => cell.get().lock.unlock_shared(self.start_ts),
                    RwType::Update | RwType::Insert | RwType::Delete => {
                        cell.get().lock.unlock(self.start_ts)
                    }
                }
            }
        }
        self.finish(TxState::Aborted);
    }

    fn restart(&mut self) {
        debug_assert_ne!(self.state, TxState::Active, "restart of a live transaction");
        self.txid = self.worker.ts.next_txid();
        self.start_ts = self.worker.ts.abort_boosted_ts();
        self.smallest_ts = self.worker.ts.smallest_ts();
        self.largest_ts = self.worker.ts.largest_ts();
        self.state = TxState::Active;
        trace!(txid = %self.txid, ts = self.start_ts, "restart");
    }
}

impl Drop for WaitDieTx<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.abort();
        }
        let mut gc = self.worker.gc.borrow_mut();
        gc.seal(self.largest_ts);
        gc.reclaim_below(self.smallest_ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::Tx;
    use bedrock_core::TxError;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const T: TableId = 1;

    fn engine(workers: usize) -> Arc<WaitDieEngine> {
        let schema = Schema::builder().table(T, 8).freeze();
        WaitDieEngine::new(schema, workers)
    }

    fn put(worker: &WaitDieWorker, key: Key, value: u64) {
        let mut tx = Tx::begin(worker);
        tx.prepare_upsert(T, key)
            .unwrap()
            .copy_from_slice(&value.to_le_bytes());
        tx.commit().unwrap();
    }

    fn get(worker: &WaitDieWorker, key: Key) -> Option<u64> {
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
    fn test_deleted_cell_is_detached_for_later_lockers() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 2, 1);
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 2).unwrap();
        tx.commit().unwrap();

        // Reads of the deleted key fail cleanly; reinsertion works.
        assert_eq!(get(&w, 2), None);
        put(&w, 2, 9);
        assert_eq!(get(&w, 2), Some(9));
    }

    #[test]
    fn test_younger_writer_dies_on_older_lock() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 10, 0);

        // w1 begins first: older. w0's transaction is younger.
        let mut older = Tx::begin(&w1);
        let mut younger = Tx::begin(&w0);
        older
            .prepare_update(T, 10)
            .unwrap()
            .copy_from_slice(&1u64.to_le_bytes());

        assert!(matches!(
            younger.prepare_update(T, 10),
            Err(TxError::Conflict(AbortReason::LockFailed))
        ));
        younger.abort();
        older.commit().unwrap();
        assert_eq!(get(&w0, 10), Some(1));
    }

    #[test]
    fn test_wait_die_ordering_old_waits_young_dies() {
        // The classic two-key scenario: the younger transaction holds K
        // exclusively; the older one blocks on K. The younger then needs a
        // key the older holds and dies, releasing K to the waiter.
        let engine = engine(2);
        {
            let loader = engine.worker(0);
            put(&loader, 100, 0); // K
            put(&loader, 200, 0); // L
        }

        let (to_young, from_old) = mpsc::channel();
        let (to_old, from_young) = mpsc::channel();

        let engine_old = Arc::clone(&engine);
        let old = thread::spawn(move || {
            let w = engine_old.worker(0);
            let mut tx = Tx::begin(&w);
            // Hold L shared.
            assert!(tx.get(T, 200).is_ok());
            to_young.send(()).unwrap();
            from_young.recv().unwrap();
            // K is held exclusively by the younger transaction: we are
            // older, so this blocks until the younger one dies.
            assert!(tx.get(T, 100).is_ok());
            tx.commit().unwrap();
        });

        let engine_young = Arc::clone(&engine);
        let young = thread::spawn(move || {
            let w = engine_young.worker(1);
            // Burn a few transactions so this worker's counter (and thus
            // its next timestamp) is larger than the older transaction's.
            for _ in 0..4 {
                let t = Tx::begin(&w);
                drop(t);
            }
            from_old.recv().unwrap();
            let mut tx = Tx::begin(&w);
            tx.prepare_update(T, 100)
                .unwrap()
                .copy_from_slice(&7u64.to_le_bytes());
            to_old.send(()).unwrap();
            // Give the older transaction time to queue on K.
            thread::sleep(Duration::from_millis(50));
            // L is read-held by the older transaction: our write is younger
            // and dies.
            assert!(matches!(
                tx.prepare_update(T, 200),
                Err(TxError::Conflict(AbortReason::LockFailed))
            ));
            tx.abort();
        });

        old.join().unwrap();
        young.join().unwrap();

        // The younger write never became visible.
        let w = engine.worker(0);
        assert_eq!(get(&w, 100), Some(0));
    }

    #[test]
    fn test_next_key_lock_blocks_younger_insert() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 300, 1);
        put(&w0, 310, 2);

        let mut scanner = Tx::begin(&w0);
        let mut seen = Vec::new();
        scanner
            .range_scan(T, 300, 400, None, false, |key, _| seen.push(key))
            .unwrap();
        assert_eq!(seen, vec![300, 310]);

        // The younger inserter needs the successor's write lock, held
        // shared by the older scanner: it dies. (Burn transactions first so
        // the inserter's timestamp really is the larger one.)
        for _ in 0..4 {
            drop(Tx::begin(&w1));
        }
        let mut inserter = Tx::begin(&w1);
        assert!(matches!(
            inserter.prepare_insert(T, 305),
            Err(TxError::Conflict(AbortReason::LockFailed))
        ));
        inserter.abort();
        scanner.commit().unwrap();
    }

    #[test]
    fn test_abort_boost_raises_timestamp() {
        let engine = engine(1);
        let w = engine.worker(0);

        let mut tx = w.begin();
        let t0 = tx.start_ts;
        tx.abort();
        tx.restart();
        let t1 = tx.start_ts;
        tx.abort();
        tx.restart();
        let t2 = tx.start_ts;
        tx.abort();
        tx.restart();
        let t3 = tx.start_ts;
        drop(tx);

        // Counter advances double per consecutive abort, capped at four.
        assert_eq!(t1 - t0, 1 << 8);
        assert_eq!(t2 - t1, 2 << 8);
        assert_eq!(t3 - t2, 4 << 8);
    }

    #[test]
    fn test_scan_skips_own_delete() {
        let engine = engine(1);
        let w = engine.worker(0);
        for k in 500..503u64 {
            put(&w, k, k);
        }
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 501).unwrap();
        let mut seen = Vec::new();
        tx.range_scan(T, 500, 510, None, false, |key, _| seen.push(key))
            .unwrap();
        assert_eq!(seen, vec![500, 502]);
        tx.commit().unwrap();
    }
}
