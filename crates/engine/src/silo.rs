//! Silo-style optimistic protocol, epoch-committed
//!
//! Execution never blocks: reads capture a tidword observation through a
//! stable-read loop (tidword, pointer, tidword again, accept only when both
//! observations agree and the cell is readable), writes buffer into
//! transaction-local records. Commit locks the write set in ascending key
//! order, reads the global epoch (the serial point), revalidates every read
//! against its captured tidword and every observed index leaf against its
//! stamp, then publishes with a commit tid one above everything observed.
//!
//! Inserted cells enter the index with `latest=1, absent=1`: present but
//! invisible until the inserter commits. An aborted insert flips to
//! `absent=1, latest=0`, leaves the index, and waits out the epoch barrier
//! before its memory is reclaimed.

use crate::protocol::{CcTx, OpResult, TxSource, TxState};
use crate::rwset::{ReadWriteSet, RwType, WriteOrder};
use crate::tidword::TidWord;
use bedrock_core::record::free_record;
use bedrock_core::{AbortReason, Epoch, Key, RecordPtr, Schema, TableId, TxId};
use bedrock_index::{CellRef, InsertResult, LeafView, NodeObservations, OrderedIndex};
use bedrock_runtime::{EpochManager, EpochWorker, Garbage, GcQueue, RecordCache};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::hint;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Shared value cell: packed tidword plus the record pointer.
pub struct SiloCell {
    tw: AtomicU64,
    rec: AtomicPtr<u8>,
}

impl SiloCell {
    /// Cell for a fresh insert: in the index, invisible to readers.
    fn new_absent() -> Self {
        SiloCell {
            tw: AtomicU64::new(TidWord::ZERO.with_latest(true).with_absent(true).raw()),
            rec: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    fn load_tw(&self) -> TidWord {
        TidWord::from_raw(self.tw.load(Ordering::Acquire))
    }

    #[inline]
    fn store_tw(&self, tw: TidWord) {
        self.tw.store(tw.raw(), Ordering::Release);
    }

    /// Spin until the lock bit is ours.
    fn lock(&self) {
        loop {
            let expected = self.load_tw();
            if expected.lock() {
                hint::spin_loop();
                continue;
            }
            if self
                .tw
                .compare_exchange_weak(
                    expected.raw(),
                    expected.with_lock(true).raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    fn unlock(&self) {
        let tw = self.load_tw();
        debug_assert!(tw.lock());
        self.store_tw(tw.with_lock(false));
    }

    /// Read the record pointer and tidword coherently: loop until two
    /// tidword observations around the pointer read agree and the cell is
    /// not locked.
    fn stable_read(&self) -> (Option<RecordPtr>, TidWord) {
        let mut expected = self.load_tw();
        loop {
            if expected.lock() {
                hint::spin_loop();
                expected = self.load_tw();
                continue;
            }
            let rec = self.rec.load(Ordering::Acquire);
            let tw = self.load_tw();
            if tw == expected {
                return (RecordPtr::from_raw(rec), tw);
            }
            expected = tw;
        }
    }

    /// Copy the record into `dst` coherently; same loop as
    /// [`Self::stable_read`].
    fn stable_copy_into(&self, dst: RecordPtr, size: usize) -> TidWord {
        let mut expected = self.load_tw();
        loop {
            if expected.lock() {
                hint::spin_loop();
                expected = self.load_tw();
                continue;
            }
            if let Some(src) = RecordPtr::from_raw(self.rec.load(Ordering::Acquire)) {
                unsafe {
                    dst.copy_from(src, size);
                }
            }
            let tw = self.load_tw();
            if tw == expected {
                return tw;
            }
            expected = tw;
        }
    }

    /// Whether the cell's tidword still equals `expected`.
    fn is_tw_latest(&self, expected: TidWord) -> bool {
        self.stable_read().1 == expected
    }

    fn swap_rec(&self, new: Option<RecordPtr>) -> Option<RecordPtr> {
        let raw = new.map(RecordPtr::as_ptr).unwrap_or(std::ptr::null_mut());
        RecordPtr::from_raw(self.rec.swap(raw, Ordering::AcqRel))
    }
}

struct SiloEntry {
    /// Local record buffer; set for UPDATE and INSERT.
    rec: Option<RecordPtr>,
    /// Tidword captured when the cell was first observed.
    tw: TidWord,
    rwt: RwType,
    /// Whether this transaction created the cell.
    is_new: bool,
    cell: CellRef<SiloCell>,
}

/// Silo engine: schema, index, and the epoch clock.
pub struct SiloEngine {
    schema: Arc<Schema>,
    index: OrderedIndex<SiloCell>,
    epochs: Arc<EpochManager>,
}

impl SiloEngine {
    /// Build an engine over `schema` for `num_workers` workers.
    pub fn new(schema: Arc<Schema>, num_workers: usize) -> Arc<Self> {
        let index = OrderedIndex::new();
        for table in schema.tables() {
            index.register_table(table);
        }
        Arc::new(SiloEngine {
            schema,
            index,
            epochs: EpochManager::new(num_workers),
        })
    }

    /// Bulk-load one committed record. Single-threaded, before any worker
    /// runs; `key` must not be loaded yet.
    pub fn load(&self, table: TableId, key: Key, record: &[u8]) {
        let size = self.schema.record_size(table);
        assert_eq!(record.len(), size, "record size mismatch in load");
        let rec = bedrock_core::alloc_record(size);
        unsafe {
            rec.as_mut_slice(size).copy_from_slice(record);
        }
        let cell = SiloCell {
            tw: AtomicU64::new(TidWord::ZERO.with_latest(true).raw()),
            rec: AtomicPtr::new(rec.as_ptr()),
        };
        let outcome = self.index.insert(table, key, CellRef::alloc(cell));
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

    /// Handle for worker `id`. Create it on the thread that will use it;
    /// worker state (garbage queue, record cache) is not shareable.
    pub fn worker(self: &Arc<Self>, id: usize) -> SiloWorker {
        SiloWorker {
            engine: Arc::clone(self),
            epoch: self.epochs.worker(id),
            gc: RefCell::new(GcQueue::new()),
            cache: RefCell::new(RecordCache::default()),
            last_tid: Cell::new(0),
            txid_counter: Cell::new(1),
            id: id as u32,
        }
    }
}

/// Per-worker Silo state: the published epoch slot, the deferred-free
/// queue, the record cache, and the last commit tid issued.
pub struct SiloWorker {
    engine: Arc<SiloEngine>,
    epoch: EpochWorker,
    gc: RefCell<GcQueue>,
    cache: RefCell<RecordCache>,
    last_tid: Cell<u64>,
    txid_counter: Cell<u32>,
    id: u32,
}

impl SiloWorker {
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

impl TxSource for SiloWorker {
    type Tx<'a>
        = SiloTx<'a>
    where
        Self: 'a;

    fn begin(&self) -> SiloTx<'_> {
        let epoch = self.epoch.refresh();
        let txid = self.next_txid();
        trace!(%txid, epoch, "begin");
        SiloTx {
            worker: self,
            txid,
            epoch,
            tables: BTreeSet::new(),
            rws: ReadWriteSet::default(),
            wset: WriteOrder::default(),
            nodes: FxHashMap::default(),
            state: TxState::Active,
        }
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.engine.schema
    }
}

/// A Silo transaction.
pub struct SiloTx<'w> {
    worker: &'w SiloWorker,
    txid: TxId,
    epoch: Epoch,
    tables: BTreeSet<TableId>,
    rws: ReadWriteSet<SiloEntry>,
    wset: WriteOrder,
    nodes: FxHashMap<TableId, NodeObservations>,
    state: TxState,
}

impl SiloTx<'_> {
    fn record_size(&self, table: TableId) -> usize {
        self.worker.engine.schema.record_size(table)
    }

    /// Unlock the already-locked prefix of the commit plan, inclusive.
    fn unlock_prefix(&self, locked: &[(TableId, Key)]) {
        for &(table, key) in locked {
            let entry = self.rws.get(table, key).expect("locked key has an entry");
            entry.cell.get().unlock();
        }
    }

    fn finish(&mut self, state: TxState) {
        self.rws.clear();
        self.wset.clear();
        self.nodes.clear();
        self.tables.clear();
        self.state = state;
    }

    /// Install a freshly allocated absent cell for `key`, returning the
    /// write buffer, or the abort reason when the index refuses.
    fn insert_fresh(&mut self, table: TableId, key: Key) -> OpResult {
        let size = self.record_size(table);
        let cell = CellRef::alloc(SiloCell::new_absent());
        let nm = self.nodes.entry(table).or_default();
        match self.worker.engine.index.insert_observing(table, key, cell, nm) {
            InsertResult::AlreadyPresent => {
                // Never shared; free directly.
                unsafe {
                    drop(cell.into_box());
                }
                Err(AbortReason::AlreadyPresent)
            }
            outcome => {
                let tw = cell.get().load_tw();
                let rec = self.worker.alloc_rec(size);
                self.rws.table(table).insert(
                    key,
                    SiloEntry {
                        rec: Some(rec),
                        tw,
                        rwt: RwType::Insert,
                        is_new: true,
                        cell,
                    },
                );
                self.wset.push(table, key);
                match outcome {
                    InsertResult::Inserted(_) => Ok(rec),
                    // The leaf changed since we observed it: the cell is
                    // installed so abort can retract it, but the caller
                    // must abort.
                    _ => Err(AbortReason::NodeValidation),
                }
            }
        }
    }

    /// First-touch update: copy the committed record into a local buffer.
    fn update_first_touch(
        &mut self,
        table: TableId,
        key: Key,
        cell: CellRef<SiloCell>,
    ) -> OpResult {
        let size = self.record_size(table);
        let rec = self.worker.alloc_rec(size);
        let tw = cell.get().stable_copy_into(rec, size);
        if !tw.is_readable() {
            self.worker.free_rec(rec, size);
            return Err(AbortReason::NotFound);
        }
        self.rws.table(table).insert(
            key,
            SiloEntry {
                rec: Some(rec),
                tw,
                rwt: RwType::Update,
                is_new: false,
                cell,
            },
        );
        self.wset.push(table, key);
        Ok(rec)
    }
}

impl CcTx for SiloTx<'_> {
    fn read(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, epoch = self.epoch, table, key, "read");
        self.tables.insert(table);
        let nm = self.nodes.entry(table).or_default();
        match self.rws.entry(table, key) {
            Entry::Vacant(vacant) => {
                let Some(cell) = self.worker.engine.index.find_observing(table, key, nm) else {
                    return Err(AbortReason::NotFound);
                };
                let (rec, tw) = cell.get().stable_read();
                if !tw.is_readable() {
                    return Err(AbortReason::NotFound);
                }
                vacant.insert(SiloEntry {
                    rec: None,
                    tw,
                    rwt: RwType::Read,
                    is_new: false,
                    cell,
                });
                Ok(rec.expect("readable cell has a record"))
            }
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                match entry.rwt {
                    RwType::Read => {
                        let (rec, tw) = entry.cell.get().stable_read();
                        if tw != entry.tw {
                            return Err(AbortReason::ReadValidation);
                        }
                        Ok(rec.expect("captured readable cell has a record"))
                    }
                    RwType::Update | RwType::Insert => {
                        if !entry.cell.get().is_tw_latest(entry.tw) {
                            return Err(AbortReason::ReadValidation);
                        }
                        Ok(entry.rec.expect("write entry has a local record"))
                    }
                    RwType::Delete => Err(AbortReason::NotFound),
                }
            }
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
                debug_assert!(entry.rec.is_none());
                if !entry.cell.get().is_tw_latest(entry.tw) {
                    return Err(AbortReason::ReadValidation);
                }
                let rec = self.worker.alloc_rec(size);
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
                let rec = self.worker.alloc_rec(size);
                let tw = entry.cell.get().stable_copy_into(rec, size);
                if tw != entry.tw {
                    self.worker.free_rec(rec, size);
                    return Err(AbortReason::ReadValidation);
                }
                entry.rec = Some(rec);
                entry.rwt = RwType::Update;
                self.wset.push(table, key);
                Ok(rec)
            }
            RwType::Update | RwType::Insert => {
                if !entry.cell.get().is_tw_latest(entry.tw) {
                    return Err(AbortReason::ReadValidation);
                }
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
                let entry = self.rws.get_mut(table, key).expect("still present");
                debug_assert!(entry.rec.is_none());
                if !entry.cell.get().is_tw_latest(entry.tw) {
                    return Err(AbortReason::ReadValidation);
                }
                let rec = self.worker.alloc_rec(size);
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
            let (rec, tw) = cell.get().stable_read();
            if !tw.is_readable() {
                return Err(AbortReason::NotFound);
            }
            self.rws.table(table).insert(
                key,
                SiloEntry {
                    rec: None,
                    tw,
                    rwt: RwType::Delete,
                    is_new: false,
                    cell,
                },
            );
            self.wset.push(table, key);
            return Ok(rec.expect("readable cell has a record"));
        }
        let entry = self.rws.get_mut(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read => {
                let (rec, tw) = entry.cell.get().stable_read();
                if tw != entry.tw {
                    return Err(AbortReason::ReadValidation);
                }
                entry.rwt = RwType::Delete;
                self.wset.push(table, key);
                Ok(rec.expect("captured readable cell has a record"))
            }
            RwType::Update | RwType::Insert => {
                let (shared_rec, tw) = entry.cell.get().stable_read();
                if tw != entry.tw {
                    return Err(AbortReason::ReadValidation);
                }
                let local = entry.rec.take();
                entry.rwt = RwType::Delete;
                if let Some(local) = local {
                    self.worker.free_rec(local, size);
                }
                match shared_rec {
                    // Deleting a record this transaction inserted leaves
                    // nothing to hand back; callers treat the key as absent.
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
        let mut kvs: Vec<(Key, CellRef<SiloCell>)> = Vec::new();
        let mut stale = false;
        {
            let nm = self.nodes.entry(table).or_default();
            let per_leaf = |leaf: &LeafView<SiloCell>, cont: &mut bool| {
                if !nm.observe_checked(leaf.id, leaf.version) {
                    stale = true;
                    *cont = false;
                }
            };
            let per_kv = |key: Key, cell: CellRef<SiloCell>, cont: &mut bool| {
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
        if stale {
            return Err(AbortReason::NodeValidation);
        }

        for (key, cell) in kvs {
            match self.rws.entry(table, key) {
                Entry::Vacant(vacant) => {
                    let (rec, tw) = cell.get().stable_read();
                    if !tw.is_readable() {
                        return Err(AbortReason::ReadValidation);
                    }
                    vacant.insert(SiloEntry {
                        rec: None,
                        tw,
                        rwt: RwType::Read,
                        is_new: false,
                        cell,
                    });
                    visit(key, rec.expect("readable cell has a record"));
                }
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    match entry.rwt {
                        RwType::Read => {
                            let (rec, tw) = entry.cell.get().stable_read();
                            if tw != entry.tw {
                                return Err(AbortReason::ReadValidation);
                            }
                            visit(key, rec.expect("captured readable cell has a record"));
                        }
                        RwType::Update | RwType::Insert => {
                            if !entry.cell.get().is_tw_latest(entry.tw) {
                                return Err(AbortReason::ReadValidation);
                            }
                            visit(key, entry.rec.expect("write entry has a local record"));
                        }
                        // Own delete: the key is no longer live.
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
        let mut kvs: Vec<(Key, CellRef<SiloCell>)> = Vec::new();
        let mut stale = false;
        {
            let nm = self.nodes.entry(table).or_default();
            let per_leaf = |leaf: &LeafView<SiloCell>, cont: &mut bool| {
                if !nm.observe_checked(leaf.id, leaf.version) {
                    stale = true;
                    *cont = false;
                }
            };
            let per_kv = |key: Key, cell: CellRef<SiloCell>, cont: &mut bool| {
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
        if stale {
            return Err(AbortReason::NodeValidation);
        }

        for (key, cell) in kvs {
            match self.rws.entry(table, key) {
                Entry::Vacant(vacant) => {
                    let rec = self.worker.alloc_rec(size);
                    let tw = cell.get().stable_copy_into(rec, size);
                    if !tw.is_readable() {
                        self.worker.free_rec(rec, size);
                        return Err(AbortReason::ReadValidation);
                    }
                    vacant.insert(SiloEntry {
                        rec: Some(rec),
                        tw,
                        rwt: RwType::Update,
                        is_new: false,
                        cell,
                    });
                    self.wset.push(table, key);
                    visit(key, rec);
                }
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    match entry.rwt {
                        RwType::Read => {
                            let rec = self.worker.alloc_rec(size);
                            let tw = entry.cell.get().stable_copy_into(rec, size);
                            if tw != entry.tw {
                                self.worker.free_rec(rec, size);
                                return Err(AbortReason::ReadValidation);
                            }
                            entry.rec = Some(rec);
                            entry.rwt = RwType::Update;
                            self.wset.push(table, key);
                            visit(key, rec);
                        }
                        RwType::Update | RwType::Insert => {
                            if !entry.cell.get().is_tw_latest(entry.tw) {
                                return Err(AbortReason::ReadValidation);
                            }
                            visit(key, entry.rec.expect("write entry has a local record"));
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
        let index = &self.worker.engine.index;

        // Commit plan: tables ascending, keys ascending within each.
        let tables: Vec<TableId> = self.tables.iter().copied().collect();
        let mut plan: Vec<(TableId, Key)> = Vec::new();
        for &table in &tables {
            for &key in self.wset.sorted(table) {
                plan.push((table, key));
            }
        }

        // Phase 1: lock the write set in canonical order.
        let mut max_tid = 0u64;
        for (i, &(table, key)) in plan.iter().enumerate() {
            let entry = self.rws.get(table, key).expect("write-set key has an entry");
            entry.cell.get().lock();
            let current = entry.cell.get().load_tw();
            if !entry.is_new && !current.is_readable() {
                self.unlock_prefix(&plan[..=i]);
                return Err(AbortReason::Validation);
            }
            max_tid = max_tid.max(current.tid());
        }

        // Serial point.
        let commit_epoch = self.worker.engine.epochs.global_epoch();
        trace!(txid = %self.txid, commit_epoch, "serial point");

        // Phase 2.1: validate the read set.
        for &table in &tables {
            for (_, entry) in self.rws.iter_table(table) {
                if entry.rwt == RwType::Insert {
                    continue;
                }
                let current = entry.cell.get().load_tw();
                if !current.certifies(entry.tw)
                    || (current.lock() && entry.rwt == RwType::Read)
                {
                    self.unlock_prefix(&plan);
                    return Err(AbortReason::ReadValidation);
                }
                max_tid = max_tid.max(current.tid());
            }
        }

        // Commit tid: above everything read or written, and above this
        // worker's previous commit.
        let commit_tid = max_tid.max(self.worker.last_tid.get()) + 1;
        self.worker.last_tid.set(commit_tid);

        // Phase 2.2: validate the node set.
        for (&table, nm) in &self.nodes {
            for (leaf, stamp) in nm.iter() {
                if index.leaf_version(table, leaf) != stamp {
                    self.unlock_prefix(&plan);
                    return Err(AbortReason::NodeValidation);
                }
            }
        }

        // Phase 3: publish.
        let base = TidWord::ZERO.with_epoch(commit_epoch).with_tid(commit_tid);
        for (table, key) in plan {
            let size = self.record_size(table);
            let entry = self.rws.get_mut(table, key).expect("write-set key has an entry");
            let rwt = entry.rwt;
            let cell = entry.cell;
            let new_rec = entry.rec.take();
            let old = cell.get().swap_rec(new_rec);
            let deleted = rwt == RwType::Delete;
            cell.get()
                .store_tw(base.with_latest(!deleted).with_absent(deleted));
            if let Some(old) = old {
                self.worker.defer(
                    commit_epoch,
                    Garbage::new(move || unsafe { free_record(old, size) }),
                );
            }
            if deleted {
                index.remove(table, key);
                self.worker.defer(
                    commit_epoch,
                    Garbage::new(move || unsafe {
                        drop(cell.into_box());
                    }),
                );
            }
        }

        trace!(txid = %self.txid, commit_epoch, commit_tid, "committed");
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
            let keys: Vec<Key> = self.wset.keys(table).to_vec();
            for key in keys {
                let (is_new, rwt, cell, local) = {
                    let entry = self.rws.get_mut(table, key).expect("write-set key has an entry");
                    (entry.is_new, entry.rwt, entry.cell, entry.rec.take())
                };
                if is_new {
                    // Retract the never-visible cell: mark it dead, pull it
                    // from the index, and let the epoch barrier reclaim it.
                    cell.get().lock();
                    let tw = cell.get().load_tw();
                    debug_assert!(cell.get().rec.load(Ordering::Acquire).is_null());
                    cell.get().store_tw(
                        tw.with_absent(true).with_latest(false).with_lock(false),
                    );
                    self.worker.engine.index.remove(table, key);
                    self.worker.defer(
                        self.epoch,
                        Garbage::new(move || unsafe {
                            drop(cell.into_box());
                        }),
                    );
                }
                if matches!(rwt, RwType::Update | RwType::Insert) {
                    if let Some(rec) = local {
                        self.worker.free_rec(rec, size);
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

impl Drop for SiloTx<'_> {
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

    fn engine(workers: usize) -> Arc<SiloEngine> {
        let schema = Schema::builder().table(T, 8).freeze();
        SiloEngine::new(schema, workers)
    }

    fn put(worker: &SiloWorker, key: Key, value: u64) {
        let mut tx = Tx::begin(worker);
        tx.prepare_upsert(T, key)
            .unwrap()
            .copy_from_slice(&value.to_le_bytes());
        tx.commit().unwrap();
    }

    fn get(worker: &SiloWorker, key: Key) -> Option<u64> {
        let mut tx = Tx::begin(worker);
        let out = tx
            .get(T, key)
            .ok()
            .map(|rec| u64::from_le_bytes(rec.try_into().unwrap()));
        tx.commit().unwrap();
        out
    }

    #[test]
    fn test_insert_commit_read_round_trip() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 10, 77);
        assert_eq!(get(&w, 10), Some(77));

        let mut tx = Tx::begin(&w);
        tx.prepare_update(T, 10)
            .unwrap()
            .copy_from_slice(&88u64.to_le_bytes());
        tx.commit().unwrap();
        assert_eq!(get(&w, 10), Some(88));

        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 10).unwrap();
        tx.commit().unwrap();
        assert_eq!(get(&w, 10), None);
    }

    #[test]
    fn test_read_own_writes() {
        let engine = engine(1);
        let w = engine.worker(0);
        let mut tx = Tx::begin(&w);
        tx.prepare_insert(T, 5)
            .unwrap()
            .copy_from_slice(&1u64.to_le_bytes());
        assert_eq!(tx.get(T, 5).unwrap(), &1u64.to_le_bytes());
        tx.prepare_delete(T, 5).ok();
        assert!(matches!(tx.get(T, 5), Err(TxError::Conflict(_))));
        tx.abort();
    }

    #[test]
    fn test_insert_then_abort_leaves_key_absent() {
        let engine = engine(1);
        let w = engine.worker(0);
        let mut tx = Tx::begin(&w);
        tx.prepare_insert(T, 9)
            .unwrap()
            .copy_from_slice(&3u64.to_le_bytes());
        tx.abort();
        drop(tx);

        assert_eq!(get(&w, 9), None);
        // The key can be inserted again afterwards.
        put(&w, 9, 4);
        assert_eq!(get(&w, 9), Some(4));
    }

    #[test]
    fn test_duplicate_insert_is_refused() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 3, 1);
        let mut tx = Tx::begin(&w);
        assert!(matches!(
            tx.prepare_insert(T, 3),
            Err(TxError::Conflict(AbortReason::AlreadyPresent))
        ));
        tx.abort();
    }

    #[test]
    fn test_read_validation_catches_concurrent_update() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 20, 5);

        let mut reader = Tx::begin(&w0);
        assert_eq!(reader.get(T, 20).unwrap(), &5u64.to_le_bytes());

        // Another worker commits an update under the reader.
        put(&w1, 20, 6);

        assert!(matches!(reader.commit(), Err(TxError::Conflict(_))));
    }

    #[test]
    fn test_write_write_conflict_aborts_loser() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 30, 0);

        let mut t0 = Tx::begin(&w0);
        t0.prepare_update(T, 30)
            .unwrap()
            .copy_from_slice(&1u64.to_le_bytes());

        put(&w1, 30, 2);

        assert!(matches!(t0.commit(), Err(TxError::Conflict(_))));
        assert_eq!(get(&w0, 30), Some(2));
    }

    #[test]
    fn test_phantom_scan_vs_insert() {
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

        // A key appears inside the scanned range before the scanner
        // commits: node validation must fail.
        put(&w1, 105, 3);
        assert!(matches!(
            scanner.commit(),
            Err(TxError::Conflict(AbortReason::NodeValidation))
        ));
    }

    #[test]
    fn test_scan_skips_own_delete_and_sees_own_write() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 40, 1);
        put(&w, 41, 2);
        put(&w, 42, 3);

        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 41).unwrap();
        tx.prepare_update(T, 42)
            .unwrap()
            .copy_from_slice(&9u64.to_le_bytes());
        let mut seen = Vec::new();
        tx.range_scan(T, 40, 50, None, false, |key, rec| {
            seen.push((key, u64::from_le_bytes(rec.try_into().unwrap())));
        })
        .unwrap();
        assert_eq!(seen, vec![(40, 1), (42, 9)]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_update_scan_registers_writes() {
        let engine = engine(1);
        let w = engine.worker(0);
        for k in 50..53u64 {
            put(&w, k, k);
        }
        let mut tx = Tx::begin(&w);
        tx.range_update(T, 50, 53, None, false, |_, rec| {
            let v = u64::from_le_bytes((&*rec).try_into().unwrap());
            rec.copy_from_slice(&(v + 100).to_le_bytes());
        })
        .unwrap();
        tx.commit().unwrap();
        assert_eq!(get(&w, 50), Some(150));
        assert_eq!(get(&w, 52), Some(152));
    }

    #[test]
    fn test_reverse_scan_order() {
        let engine = engine(1);
        let w = engine.worker(0);
        for k in [60u64, 61, 62] {
            put(&w, k, k);
        }
        let mut tx = Tx::begin(&w);
        let mut seen = Vec::new();
        tx.range_scan(T, 59, 62, None, true, |key, _| seen.push(key))
            .unwrap();
        assert_eq!(seen, vec![62, 61, 60]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_commit_tid_monotone_per_worker() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 70, 1);
        let first = w.last_tid.get();
        put(&w, 71, 2);
        assert!(w.last_tid.get() > first);
    }

    #[test]
    fn test_epoch_gc_reclaims_after_barrier() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 80, 1);
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 80).unwrap();
        tx.commit().unwrap();
        drop(tx);
        assert!(w.gc.borrow().len() > 0);

        // Advance the epoch past the barrier; the next teardown reclaims.
        for _ in 0..3 {
            w.epoch.refresh();
            engine.epochs().try_advance();
        }
        let tx = Tx::begin(&w);
        drop(tx);
        assert_eq!(w.gc.borrow().len(), 0);
    }
}
