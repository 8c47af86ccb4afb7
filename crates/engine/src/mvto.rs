//! Multi-version timestamp-ordered protocol
//!
//! Every cell holds a singly linked chain of immutable versions ordered by
//! descending `write_ts`, guarded by a short cell lock. A transaction with
//! start timestamp `T` reads the newest version with `write_ts ≤ T` and
//! raises that version's `read_ts`; writers buffer locally and splice a new
//! head version at commit after checking the head still satisfies
//! `read_ts ≤ T ∧ write_ts ≤ T` (and the deletion state the operation
//! expects). Phantom protection for inserts comes from per-leaf scan
//! timestamps: scans mark every leaf they traverse, and an insert whose
//! leaf carries a newer mark than its own timestamp aborts.
//!
//! Chain housekeeping is opportunistic: every chain access trims versions
//! older than the smallest-worker watermark (keeping one floor version),
//! and a reader that finds a fully trimmed deleted chain removes the cell
//! from the index on the spot.

use crate::protocol::{CcTx, OpResult, TxSource, TxState};
use crate::rwset::{ReadWriteSet, RwType, WriteOrder};
use bedrock_core::record::free_record;
use bedrock_core::{AbortReason, Key, RecordPtr, Schema, TableId, Ts, TxId};
use bedrock_index::{CellRef, InsertResult, OrderedIndex};
use bedrock_runtime::{Garbage, GcQueue, RecordCache, TimestampManager, TsWorker};
use bedrock_sync::SpinRwLock;
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// One immutable version. `read_ts` is monotonically raised under the cell
/// lock; `prev` is only rewritten by tail trimming, also under the lock.
pub struct MvtoVersion {
    read_ts: AtomicU64,
    write_ts: Ts,
    prev: AtomicPtr<MvtoVersion>,
    /// Null iff `deleted`.
    rec: *mut u8,
    deleted: bool,
}

impl MvtoVersion {
    fn alloc(
        read_ts: Ts,
        write_ts: Ts,
        prev: *mut MvtoVersion,
        rec: Option<RecordPtr>,
        deleted: bool,
    ) -> *mut MvtoVersion {
        debug_assert_eq!(rec.is_none(), deleted);
        Box::into_raw(Box::new(MvtoVersion {
            read_ts: AtomicU64::new(read_ts),
            write_ts,
            prev: AtomicPtr::new(prev),
            rec: rec.map(RecordPtr::as_ptr).unwrap_or(ptr::null_mut()),
            deleted,
        }))
    }

    fn update_read_ts(&self, ts: Ts) {
        self.read_ts.fetch_max(ts, Ordering::AcqRel);
    }
}

/// Free one version together with its record buffer.
///
/// # Safety
/// `version` must be unreachable from any chain and from any live
/// transaction's read set.
unsafe fn free_version(version: *mut MvtoVersion, rec_size: usize) {
    let boxed = Box::from_raw(version);
    if let Some(rec) = RecordPtr::from_raw(boxed.rec) {
        free_record(rec, rec_size);
    }
}

/// Shared value cell: chain head under a short lock.
pub struct MvtoCell {
    latch: SpinRwLock,
    head: AtomicPtr<MvtoVersion>,
}

impl MvtoCell {
    fn with_head(head: *mut MvtoVersion) -> Self {
        MvtoCell {
            latch: SpinRwLock::new(),
            head: AtomicPtr::new(head),
        }
    }

    fn lock(&self) {
        self.latch.lock();
    }

    fn unlock(&self) {
        self.latch.unlock();
    }

    #[inline]
    fn head_ptr(&self) -> *mut MvtoVersion {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    fn set_head(&self, head: *mut MvtoVersion) {
        self.head.store(head, Ordering::Release);
    }

    /// Detached: logically removed from the index, awaiting reclamation.
    fn is_detached(&self) -> bool {
        self.head_ptr().is_null()
    }

    /// A chain reduced to a single deleted version carries no information;
    /// the next observer removes the cell.
    fn is_empty(&self) -> bool {
        let head = self.head_ptr();
        !head.is_null()
            && unsafe { (*head).deleted && (*head).prev.load(Ordering::Acquire).is_null() }
    }

    /// Newest version with `write_ts ≤ ts`. Caller holds the cell lock.
    fn visible_version(&self, ts: Ts) -> *mut MvtoVersion {
        let mut version = self.head_ptr();
        unsafe {
            while !version.is_null() && ts < (*version).write_ts {
                version = (*version).prev.load(Ordering::Acquire);
            }
        }
        version
    }

    /// Trim versions older than `smallest_ts`, keeping exactly one floor
    /// version at or below it. Caller holds the cell lock.
    fn trim_chain(&self, smallest_ts: Ts, rec_size: usize) {
        let mut keep = self.head_ptr();
        unsafe {
            while !keep.is_null() && (*keep).write_ts > smallest_ts {
                keep = (*keep).prev.load(Ordering::Acquire);
            }
            if keep.is_null() {
                return;
            }
            let mut garbage = (*keep).prev.swap(ptr::null_mut(), Ordering::AcqRel);
            while !garbage.is_null() {
                let next = (*garbage).prev.load(Ordering::Acquire);
                free_version(garbage, rec_size);
                garbage = next;
            }
        }
    }
}

struct MvtoEntry {
    /// Record of the version this transaction read.
    read_rec: Option<RecordPtr>,
    /// Local write buffer.
    write_rec: Option<RecordPtr>,
    rwt: RwType,
    /// Whether this transaction created the cell.
    is_new: bool,
    cell: CellRef<MvtoCell>,
}

/// What a chain probe found for this transaction's snapshot.
enum Probe {
    /// Nothing to see: cell detached, chain empty, or no visible version.
    Absent,
    /// A visible version; `rec` is `None` when it is a deletion marker.
    Visible {
        rec: Option<RecordPtr>,
        is_head: bool,
    },
}

/// MVTO engine: schema, index, and the timestamp service.
pub struct MvtoEngine {
    schema: Arc<Schema>,
    index: OrderedIndex<MvtoCell>,
    timestamps: Arc<TimestampManager>,
}

impl MvtoEngine {
    /// Build an engine over `schema` for `num_workers` workers.
    pub fn new(schema: Arc<Schema>, num_workers: usize) -> Arc<Self> {
        let index = OrderedIndex::new();
        for table in schema.tables() {
            index.register_table(table);
        }
        Arc::new(MvtoEngine {
            schema,
            index,
            timestamps: TimestampManager::new(num_workers),
        })
    }

    /// Bulk-load one committed record as the floor version. Single-
    /// threaded, before any worker runs; `key` must not be loaded yet.
    pub fn load(&self, table: TableId, key: Key, record: &[u8]) {
        let size = self.schema.record_size(table);
        assert_eq!(record.len(), size, "record size mismatch in load");
        let rec = bedrock_core::alloc_record(size);
        unsafe {
            rec.as_mut_slice(size).copy_from_slice(record);
        }
        let version = MvtoVersion::alloc(0, 0, ptr::null_mut(), Some(rec), false);
        let outcome = self
            .index
            .insert(table, key, CellRef::alloc(MvtoCell::with_head(version)));
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
    pub fn worker(self: &Arc<Self>, id: u8) -> MvtoWorker {
        MvtoWorker {
            engine: Arc::clone(self),
            ts: self.timestamps.worker(id, 1000),
            gc: RefCell::new(GcQueue::new()),
            cache: RefCell::new(RecordCache::default()),
        }
    }
}

/// Per-worker MVTO state.
pub struct MvtoWorker {
    engine: Arc<MvtoEngine>,
    ts: TsWorker,
    gc: RefCell<GcQueue>,
    cache: RefCell<RecordCache>,
}

impl MvtoWorker {
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

impl TxSource for MvtoWorker {
    type Tx<'a>
        = MvtoTx<'a>
    where
        Self: 'a;

    fn begin(&self) -> MvtoTx<'_> {
        let txid = self.ts.next_txid();
        let start_ts = self.ts.new_ts();
        let smallest_ts = self.ts.smallest_ts();
        let largest_ts = self.ts.largest_ts();
        trace!(%txid, start_ts, smallest_ts, largest_ts, "begin");
        MvtoTx {
            worker: self,
            txid,
            start_ts,
            smallest_ts,
            largest_ts,
            tables: BTreeSet::new(),
            rws: ReadWriteSet::default(),
            wset: WriteOrder::default(),
            state: TxState::Active,
        }
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.engine.schema
    }
}

/// An MVTO transaction.
pub struct MvtoTx<'w> {
    worker: &'w MvtoWorker,
    txid: TxId,
    start_ts: Ts,
    /// Smallest-worker watermark: version-chain trimming floor.
    smallest_ts: Ts,
    /// Largest-worker watermark: deferred-reclamation stamp.
    largest_ts: Ts,
    tables: BTreeSet<TableId>,
    rws: ReadWriteSet<MvtoEntry>,
    wset: WriteOrder,
    state: TxState,
}

/// Probe a cell's chain for `start_ts`: find the visible version, raise its
/// `read_ts`, trim the tail, and remove fully dead cells from the index.
fn probe_cell(
    worker: &MvtoWorker,
    table: TableId,
    key: Key,
    cell: CellRef<MvtoCell>,
    start_ts: Ts,
    smallest_ts: Ts,
) -> Probe {
    let size = worker.engine.schema.record_size(table);
    let c = cell.get();
    c.lock();
    if c.is_detached() {
        c.unlock();
        return Probe::Absent;
    }
    if c.is_empty() {
        detach_cell(worker, table, key, cell);
        c.unlock();
        return Probe::Absent;
    }
    let head = c.head_ptr();
    let version = c.visible_version(start_ts);
    c.trim_chain(smallest_ts, size);
    if version.is_null() {
        c.unlock();
        return Probe::Absent;
    }
    let (rec, is_head) = unsafe {
        (*version).update_read_ts(start_ts);
        (RecordPtr::from_raw((*version).rec), version == head)
    };
    c.unlock();
    Probe::Visible { rec, is_head }
}

/// Remove a dead cell from the index and queue it for reclamation. Caller
/// holds the cell lock; the remaining deleted head version is freed
/// immediately (nothing can reach it once the head is cleared).
fn detach_cell(worker: &MvtoWorker, table: TableId, key: Key, cell: CellRef<MvtoCell>) {
    let size = worker.engine.schema.record_size(table);
    worker.engine.index.remove(table, key);
    let c = cell.get();
    let head = c.head_ptr();
    c.set_head(ptr::null_mut());
    worker.stage(Garbage::new(move || unsafe {
        drop(cell.into_box());
    }));
    unsafe {
        free_version(head, size);
    }
}

impl MvtoTx<'_> {
    fn record_size(&self, table: TableId) -> usize {
        self.worker.engine.schema.record_size(table)
    }

    fn probe(&self, table: TableId, key: Key, cell: CellRef<MvtoCell>) -> Probe {
        probe_cell(self.worker, table, key, cell, self.start_ts, self.smallest_ts)
    }

    fn finish(&mut self, state: TxState) {
        self.rws.clear();
        self.wset.clear();
        self.tables.clear();
        self.state = state;
    }

    /// Build the locally owned cell for a brand-new key.
    fn insert_fresh(&mut self, table: TableId, key: Key) -> OpResult {
        let size = self.record_size(table);
        let rec = self.worker.alloc_rec(size);
        let version =
            MvtoVersion::alloc(self.start_ts, self.start_ts, ptr::null_mut(), Some(rec), false);
        let cell = CellRef::alloc(MvtoCell::with_head(version));
        self.rws.table(table).insert(
            key,
            MvtoEntry {
                read_rec: None,
                write_rec: Some(rec),
                rwt: RwType::Insert,
                is_new: true,
                cell,
            },
        );
        self.wset.push(table, key);
        Ok(rec)
    }

    /// Unlock the locked prefix of the commit plan, inclusive.
    fn unlock_prefix(&self, locked: &[(TableId, Key)]) {
        for &(table, key) in locked {
            let entry = self.rws.get(table, key).expect("locked key has an entry");
            entry.cell.get().unlock();
        }
    }

    /// Retract cells this transaction inserted into the index during an
    /// aborted commit. Frees the never-visible version and write buffer,
    /// and defers the cell itself. Cells in `range` are still locked.
    fn undo_inserted(&mut self, range: &[(TableId, Key)]) {
        for &(table, key) in range {
            let size = self.record_size(table);
            let entry = self.rws.get_mut(table, key).expect("planned key has an entry");
            if !(entry.rwt == RwType::Insert && entry.is_new) {
                continue;
            }
            let cell = entry.cell;
            entry.write_rec = None;
            self.worker.engine.index.remove(table, key);
            let c = cell.get();
            let head = c.head_ptr();
            c.set_head(ptr::null_mut());
            self.worker.stage(Garbage::new(move || unsafe {
                drop(cell.into_box());
            }));
            unsafe {
                free_version(head, size);
            }
        }
    }
}

impl CcTx for MvtoTx<'_> {
    fn read(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, ts = self.start_ts, table, key, "read");
        self.tables.insert(table);
        if let Some(entry) = self.rws.get(table, key) {
            return match entry.rwt {
                RwType::Read => Ok(entry.read_rec.expect("read entry has a record")),
                RwType::Update | RwType::Insert => {
                    Ok(entry.write_rec.expect("write entry has a local record"))
                }
                RwType::Delete => Err(AbortReason::NotFound),
            };
        }
        let Some(cell) = self.worker.engine.index.find(table, key) else {
            return Err(AbortReason::NotFound);
        };
        match self.probe(table, key, cell) {
            Probe::Absent | Probe::Visible { rec: None, .. } => Err(AbortReason::NotFound),
            Probe::Visible { rec: Some(rec), .. } => {
                self.rws.table(table).insert(
                    key,
                    MvtoEntry {
                        read_rec: Some(rec),
                        write_rec: None,
                        rwt: RwType::Read,
                        is_new: false,
                        cell,
                    },
                );
                Ok(rec)
            }
        }
    }

    fn insert(&mut self, table: TableId, key: Key) -> OpResult {
        trace!(txid = %self.txid, ts = self.start_ts, table, key, "insert");
        self.tables.insert(table);
        let size = self.record_size(table);
        if self.rws.get(table, key).is_none() {
            return match self.worker.engine.index.find(table, key) {
                None => self.insert_fresh(table, key),
                Some(cell) => match self.probe(table, key, cell) {
                    Probe::Absent => Err(AbortReason::Detached),
                    Probe::Visible { rec: Some(_), .. } => Err(AbortReason::AlreadyPresent),
                    Probe::Visible {
                        rec: None,
                        is_head: true,
                    } => {
                        // Deleted head visible to us: reuse the cell and
                        // splice a fresh version at commit.
                        let rec = self.worker.alloc_rec(size);
                        self.rws.table(table).insert(
                            key,
                            MvtoEntry {
                                read_rec: None,
                                write_rec: Some(rec),
                                rwt: RwType::Insert,
                                is_new: false,
                                cell,
                            },
                        );
                        self.wset.push(table, key);
                        Ok(rec)
                    }
                    Probe::Visible {
                        rec: None,
                        is_head: false,
                    } => Err(AbortReason::TsOrder),
                },
            };
        }
        let entry = self.rws.get_mut(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read | RwType::Update | RwType::Insert => Err(AbortReason::AlreadyPresent),
            RwType::Delete => {
                let rec = self.worker.alloc_rec(size);
                let entry = self.rws.get_mut(table, key).expect("still present");
                entry.write_rec = Some(rec);
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
            return match self.probe(table, key, cell) {
                Probe::Absent | Probe::Visible { rec: None, .. } => Err(AbortReason::NotFound),
                Probe::Visible { rec: Some(vrec), .. } => {
                    let rec = self.worker.alloc_rec(size);
                    unsafe {
                        rec.copy_from(vrec, size);
                    }
                    self.rws.table(table).insert(
                        key,
                        MvtoEntry {
                            read_rec: Some(vrec),
                            write_rec: Some(rec),
                            rwt: RwType::Update,
                            is_new: false,
                            cell,
                        },
                    );
                    self.wset.push(table, key);
                    Ok(rec)
                }
            };
        }
        let entry = self.rws.get_mut(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read => {
                let src = entry.read_rec.expect("read entry has a record");
                let rec = self.worker.alloc_rec(size);
                unsafe {
                    rec.copy_from(src, size);
                }
                let entry = self.rws.get_mut(table, key).expect("still present");
                entry.write_rec = Some(rec);
                entry.rwt = RwType::Update;
                self.wset.push(table, key);
                Ok(rec)
            }
            RwType::Update | RwType::Insert => {
                Ok(entry.write_rec.expect("write entry has a local record"))
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
                Some(cell) => match self.probe(table, key, cell) {
                    Probe::Absent => Err(AbortReason::Detached),
                    Probe::Visible {
                        rec: None,
                        is_head: true,
                    } => {
                        let rec = self.worker.alloc_rec(size);
                        self.rws.table(table).insert(
                            key,
                            MvtoEntry {
                                read_rec: None,
                                write_rec: Some(rec),
                                rwt: RwType::Insert,
                                is_new: false,
                                cell,
                            },
                        );
                        self.wset.push(table, key);
                        Ok(rec)
                    }
                    Probe::Visible {
                        rec: None,
                        is_head: false,
                    } => Err(AbortReason::TsOrder),
                    Probe::Visible { rec: Some(vrec), .. } => {
                        let rec = self.worker.alloc_rec(size);
                        unsafe {
                            rec.copy_from(vrec, size);
                        }
                        self.rws.table(table).insert(
                            key,
                            MvtoEntry {
                                read_rec: Some(vrec),
                                write_rec: Some(rec),
                                rwt: RwType::Update,
                                is_new: false,
                                cell,
                            },
                        );
                        self.wset.push(table, key);
                        Ok(rec)
                    }
                },
            };
        }
        let rwt = self.rws.get(table, key).expect("checked above").rwt;
        match rwt {
            RwType::Read | RwType::Update | RwType::Insert => self.update(table, key),
            RwType::Delete => {
                let rec = self.worker.alloc_rec(size);
                let entry = self.rws.get_mut(table, key).expect("still present");
                entry.write_rec = Some(rec);
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
            return match self.probe(table, key, cell) {
                Probe::Absent | Probe::Visible { rec: None, .. } => Err(AbortReason::NotFound),
                Probe::Visible { rec: Some(vrec), .. } => {
                    self.rws.table(table).insert(
                        key,
                        MvtoEntry {
                            read_rec: Some(vrec),
                            write_rec: None,
                            rwt: RwType::Delete,
                            is_new: false,
                            cell,
                        },
                    );
                    self.wset.push(table, key);
                    Ok(vrec)
                }
            };
        }
        let entry = self.rws.get_mut(table, key).expect("checked above");
        match entry.rwt {
            RwType::Read => {
                entry.rwt = RwType::Delete;
                let rec = entry.read_rec.expect("read entry has a record");
                self.wset.push(table, key);
                Ok(rec)
            }
            RwType::Update => {
                let local = entry.write_rec.take().expect("update entry has a buffer");
                entry.rwt = RwType::Delete;
                let rec = entry.read_rec.expect("update entry read a record");
                self.worker.free_rec(local, size);
                Ok(rec)
            }
            RwType::Insert => {
                // Withdraw the in-flight insert entirely; the caller sees
                // the key as absent.
                let is_new = entry.is_new;
                let cell = entry.cell;
                let local = entry.write_rec.take();
                self.rws.table(table).remove(&key);
                self.wset.forget(table, key);
                if is_new {
                    let c = cell.get();
                    let head = c.head_ptr();
                    c.set_head(ptr::null_mut());
                    unsafe {
                        // Never shared: free the version (and its buffer)
                        // and the cell directly.
                        free_version(head, size);
                        drop(cell.into_box());
                    }
                } else if let Some(local) = local {
                    self.worker.free_rec(local, size);
                }
                Err(AbortReason::NotFound)
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
        let worker = self.worker;
        let (start_ts, smallest_ts) = (self.start_ts, self.smallest_ts);
        let rws = self.rws.table(table);
        let mut visited = 0usize;

        let per_leaf = |leaf: &bedrock_index::LeafView<MvtoCell>, _cont: &mut bool| {
            leaf.update_scan_ts(start_ts);
        };
        let mut per_kv = |key: Key, cell: CellRef<MvtoCell>, cont: &mut bool| {
            match rws.entry(key) {
                Entry::Occupied(occupied) => match occupied.into_mut() {
                    entry if entry.rwt == RwType::Read => {
                        visit(key, entry.read_rec.expect("read entry has a record"));
                        visited += 1;
                    }
                    entry if matches!(entry.rwt, RwType::Update | RwType::Insert) => {
                        visit(key, entry.write_rec.expect("write entry has a local record"));
                        visited += 1;
                    }
                    // Own delete: not live.
                    _ => {}
                },
                Entry::Vacant(vacant) => {
                    match probe_cell(worker, table, key, cell, start_ts, smallest_ts) {
                        Probe::Absent | Probe::Visible { rec: None, .. } => {}
                        Probe::Visible { rec: Some(rec), .. } => {
                            vacant.insert(MvtoEntry {
                                read_rec: Some(rec),
                                write_rec: None,
                                rwt: RwType::Read,
                                is_new: false,
                                cell,
                            });
                            visit(key, rec);
                            visited += 1;
                        }
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
        trace!(txid = %self.txid, ts = self.start_ts, table, lkey, rkey, reverse, "update_scan");
        self.tables.insert(table);
        let size = self.record_size(table);
        let worker = self.worker;
        let (start_ts, smallest_ts) = (self.start_ts, self.smallest_ts);
        let rws = self.rws.table(table);
        let wset = &mut self.wset;
        let mut visited = 0usize;

        let per_leaf = |leaf: &bedrock_index::LeafView<MvtoCell>, _cont: &mut bool| {
            leaf.update_scan_ts(start_ts);
        };
        let mut per_kv = |key: Key, cell: CellRef<MvtoCell>, cont: &mut bool| {
            match rws.entry(key) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    match entry.rwt {
                        RwType::Read => {
                            let src = entry.read_rec.expect("read entry has a record");
                            let rec = worker.alloc_rec(size);
                            unsafe {
                                rec.copy_from(src, size);
                            }
                            entry.write_rec = Some(rec);
                            entry.rwt = RwType::Update;
                            wset.push(table, key);
                            visit(key, rec);
                            visited += 1;
                        }
                        RwType::Update | RwType::Insert => {
                            visit(key, entry.write_rec.expect("write entry has a local record"));
                            visited += 1;
                        }
                        RwType::Delete => {}
                    }
                }
                Entry::Vacant(vacant) => {
                    match probe_cell(worker, table, key, cell, start_ts, smallest_ts) {
                        Probe::Absent | Probe::Visible { rec: None, .. } => {}
                        Probe::Visible { rec: Some(vrec), .. } => {
                            let rec = worker.alloc_rec(size);
                            unsafe {
                                rec.copy_from(vrec, size);
                            }
                            vacant.insert(MvtoEntry {
                                read_rec: Some(vrec),
                                write_rec: Some(rec),
                                rwt: RwType::Update,
                                is_new: false,
                                cell,
                            });
                            wset.push(table, key);
                            visit(key, rec);
                            visited += 1;
                        }
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
        Ok(())
    }

    fn precommit(&mut self) -> Result<(), AbortReason> {
        trace!(txid = %self.txid, ts = self.start_ts, "precommit");
        if self.state != TxState::Active {
            return Err(AbortReason::Validation);
        }

        // Commit plan: tables ascending, keys ascending within each.
        let tables: Vec<TableId> = self.tables.iter().copied().collect();
        let mut plan: Vec<(TableId, Key)> = Vec::new();
        for &table in &tables {
            for &key in self.wset.sorted(table) {
                plan.push((table, key));
            }
        }

        // Phase 1: lock in canonical order, install fresh cells, check the
        // head timestamps the operation relies on.
        for i in 0..plan.len() {
            let (table, key) = plan[i];
            let entry = self.rws.get(table, key).expect("write-set key has an entry");
            let cell = entry.cell;
            let (rwt, is_new) = (entry.rwt, entry.is_new);
            let c = cell.get();
            c.lock();
            if !is_new && c.is_detached() {
                self.undo_inserted(&plan[..i]);
                self.unlock_prefix(&plan[..=i]);
                return Err(AbortReason::Detached);
            }
            match (rwt, is_new) {
                (RwType::Insert, true) => {
                    match self.worker.engine.index.insert(table, key, cell) {
                        InsertResult::AlreadyPresent => {
                            self.undo_inserted(&plan[..i]);
                            self.unlock_prefix(&plan[..=i]);
                            return Err(AbortReason::AlreadyPresent);
                        }
                        InsertResult::Inserted(info) | InsertResult::InsertedConflicting(info) => {
                            // A scan with a newer timestamp has covered this
                            // leaf; making the key appear would be a phantom.
                            if self.worker.engine.index.leaf_scan_ts(table, info.leaf)
                                > self.start_ts
                            {
                                self.undo_inserted(&plan[..=i]);
                                self.unlock_prefix(&plan[..=i]);
                                return Err(AbortReason::NodeValidation);
                            }
                        }
                    }
                }
                (RwType::Insert, false) => {
                    let head = c.head_ptr();
                    let ok = unsafe {
                        (*head).read_ts.load(Ordering::Acquire) <= self.start_ts
                            && (*head).write_ts <= self.start_ts
                            && (*head).deleted
                    };
                    if !ok {
                        self.undo_inserted(&plan[..i]);
                        self.unlock_prefix(&plan[..=i]);
                        return Err(AbortReason::TsOrder);
                    }
                }
                (RwType::Update | RwType::Delete, _) => {
                    let head = c.head_ptr();
                    let ok = unsafe {
                        (*head).read_ts.load(Ordering::Acquire) <= self.start_ts
                            && (*head).write_ts <= self.start_ts
                            && !(*head).deleted
                    };
                    if !ok {
                        self.undo_inserted(&plan[..i]);
                        self.unlock_prefix(&plan[..=i]);
                        return Err(AbortReason::TsOrder);
                    }
                }
                (RwType::Read, _) => unreachable!("read entries are not in the write set"),
            }
        }

        // Phase 2: splice new head versions, trim, unlock.
        for &(table, key) in &plan {
            let size = self.record_size(table);
            let entry = self.rws.get_mut(table, key).expect("write-set key has an entry");
            let cell = entry.cell;
            let c = cell.get();
            if !entry.is_new {
                let rec = entry.write_rec.take();
                let deleted = entry.rwt == RwType::Delete;
                let version =
                    MvtoVersion::alloc(self.start_ts, self.start_ts, c.head_ptr(), rec, deleted);
                c.set_head(version);
            } else {
                // The version built at insert time is the first version;
                // its buffer now belongs to the chain.
                entry.write_rec = None;
            }
            c.trim_chain(self.smallest_ts, size);
            c.unlock();
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
            let keys: Vec<Key> = self.wset.keys(table).to_vec();
            for key in keys {
                let entry = self.rws.get_mut(table, key).expect("write-set key has an entry");
                if entry.is_new {
                    let cell = entry.cell;
                    entry.write_rec = None;
                    let c = cell.get();
                    let head = c.head_ptr();
                    if !head.is_null() {
                        // Never installed into the index (an installed cell
                        // was already retracted by the failed commit).
                        c.set_head(ptr::null_mut());
                        unsafe {
                            free_version(head, size);
                            drop(cell.into_box());
                        }
                    }
                } else if let Some(rec) = entry.write_rec.take() {
                    self.worker.free_rec(rec, size);
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

impl Drop for MvtoTx<'_> {
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

    const T: TableId = 1;

    fn engine(workers: usize) -> Arc<MvtoEngine> {
        let schema = Schema::builder().table(T, 8).freeze();
        MvtoEngine::new(schema, workers)
    }

    fn put(worker: &MvtoWorker, key: Key, value: u64) {
        let mut tx = Tx::begin(worker);
        tx.prepare_upsert(T, key)
            .unwrap()
            .copy_from_slice(&value.to_le_bytes());
        tx.commit().unwrap();
    }

    fn get(worker: &MvtoWorker, key: Key) -> Option<u64> {
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
    fn test_old_snapshot_reads_old_version() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 5, 100);

        let mut reader = Tx::begin(&w0);
        // Push the writer's counter past the reader's snapshot, then
        // overwrite the key with a newer version.
        put(&w1, 900, 0);
        put(&w1, 5, 200);

        // The reader's snapshot predates the new version and keeps seeing
        // the old one.
        assert_eq!(reader.get(T, 5).unwrap(), &100u64.to_le_bytes());
        reader.commit().unwrap();

        assert_eq!(get(&w0, 5), Some(200));
    }

    #[test]
    fn test_read_ts_blocks_older_writer() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 7, 1);

        // Writer begins first (older timestamp).
        let mut writer = Tx::begin(&w1);
        // Reader begins later and reads, raising the head read_ts above the
        // writer's start timestamp.
        let mut reader = Tx::begin(&w0);
        assert_eq!(reader.get(T, 7).unwrap(), &1u64.to_le_bytes());
        reader.commit().unwrap();

        writer
            .prepare_update(T, 7)
            .unwrap()
            .copy_from_slice(&2u64.to_le_bytes());
        assert!(matches!(
            writer.commit(),
            Err(TxError::Conflict(AbortReason::TsOrder))
        ));
        assert_eq!(get(&w0, 7), Some(1));
    }

    #[test]
    fn test_deleted_head_reuse_on_insert() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 9, 1);
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 9).unwrap();
        tx.commit().unwrap();

        // The cell still exists with a deleted head; insert reuses it.
        let mut tx = Tx::begin(&w);
        tx.prepare_insert(T, 9)
            .unwrap()
            .copy_from_slice(&2u64.to_le_bytes());
        tx.commit().unwrap();
        assert_eq!(get(&w, 9), Some(2));
    }

    #[test]
    fn test_duplicate_insert_is_refused() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 11, 1);
        let mut tx = Tx::begin(&w);
        assert!(matches!(
            tx.prepare_insert(T, 11),
            Err(TxError::Conflict(AbortReason::AlreadyPresent))
        ));
        tx.abort();
    }

    #[test]
    fn test_scan_phantom_blocks_older_inserter() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 100, 1);
        put(&w0, 120, 2);

        // Inserter begins first (older), scanner second (newer).
        let mut inserter = Tx::begin(&w1);
        let mut scanner = Tx::begin(&w0);
        let mut seen = Vec::new();
        scanner
            .range_scan(T, 100, 200, None, false, |key, _| seen.push(key))
            .unwrap();
        assert_eq!(seen, vec![100, 120]);
        scanner.commit().unwrap();

        // The older inserter would create a key the newer scan should have
        // seen.
        inserter
            .prepare_insert(T, 110)
            .unwrap()
            .copy_from_slice(&3u64.to_le_bytes());
        assert!(matches!(
            inserter.commit(),
            Err(TxError::Conflict(AbortReason::NodeValidation))
        ));
        assert_eq!(get(&w0, 110), None);
    }

    #[test]
    fn test_write_write_older_loser_aborts() {
        let engine = engine(2);
        let w0 = engine.worker(0);
        let w1 = engine.worker(1);
        put(&w0, 13, 0);

        let mut older = Tx::begin(&w1);
        let mut newer = Tx::begin(&w0);
        newer
            .prepare_update(T, 13)
            .unwrap()
            .copy_from_slice(&1u64.to_le_bytes());
        newer.commit().unwrap();

        older
            .prepare_update(T, 13)
            .unwrap()
            .copy_from_slice(&2u64.to_le_bytes());
        assert!(matches!(
            older.commit(),
            Err(TxError::Conflict(AbortReason::TsOrder))
        ));
        assert_eq!(get(&w0, 13), Some(1));
    }

    #[test]
    fn test_trimmed_deleted_chain_detaches_cell() {
        let engine = engine(1);
        let w = engine.worker(0);
        put(&w, 15, 1);
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 15).unwrap();
        tx.commit().unwrap();

        // Move the watermark past the deletion, then touch the key: the
        // chain trims to a lone deleted head and the cell detaches.
        for k in 0..4u64 {
            put(&w, 1000 + k, k);
        }
        engine.timestamps().publish_watermarks();
        assert_eq!(get(&w, 15), None);

        // The next touch finds the dead cell, detaches it (aborting), and
        // the retry inserts fresh.
        let mut stat = bedrock_core::PerTxStat::default();
        let ok = crate::facade::run_with_retry(&w, &mut stat, |tx| {
            tx.prepare_upsert(T, 15)?.copy_from_slice(&7u64.to_le_bytes());
            Ok(())
        });
        assert!(ok);
        assert_eq!(get(&w, 15), Some(7));
    }

    #[test]
    fn test_scan_sees_own_writes_and_skips_own_delete() {
        let engine = engine(1);
        let w = engine.worker(0);
        for k in 20..23u64 {
            put(&w, k, k);
        }
        let mut tx = Tx::begin(&w);
        tx.prepare_delete(T, 21).unwrap();
        tx.prepare_update(T, 22)
            .unwrap()
            .copy_from_slice(&99u64.to_le_bytes());
        let mut seen = Vec::new();
        tx.range_scan(T, 20, 30, None, false, |key, rec| {
            seen.push((key, u64::from_le_bytes(rec.try_into().unwrap())));
        })
        .unwrap();
        assert_eq!(seen, vec![(20, 20), (22, 99)]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_remove_withdraws_own_insert() {
        let engine = engine(1);
        let w = engine.worker(0);
        let mut tx = Tx::begin(&w);
        tx.prepare_insert(T, 30)
            .unwrap()
            .copy_from_slice(&1u64.to_le_bytes());
        assert!(tx.prepare_delete(T, 30).is_err());
        tx.commit().unwrap();
        assert_eq!(get(&w, 30), None);
    }
}
