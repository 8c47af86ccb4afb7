//! Paged ordered index
//!
//! Each table is a directory of fixed key-range pages: page `p` holds the
//! keys with `key >> PAGE_SHIFT == p`. A page is a leaf in the observation
//! sense: it carries an atomic version stamp bumped on every key insert or
//! removal, and an atomic scan timestamp recording the newest start
//! timestamp that scanned it.
//!
//! A missing key is covered by the nearest page at or below its would-be
//! page (falling back to the table's head leaf). Creating a page bumps the
//! covering leaf's stamp, so observers of a gap are invalidated by the
//! insert that fills it. Pages are never removed from the directory; an
//! empty page keeps covering its key range.
//!
//! Lock order is directory → page entries, everywhere. Scans snapshot the
//! directory (page set and version stamps) under the directory lock and the
//! entries per page afterwards, so callbacks run without any index lock
//! held; the protocols are free to take cell locks inside them.

use crate::cell::CellRef;
use crate::observe::{NodeInfo, NodeObservations};
use bedrock_core::{Key, TableId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Keys per page: `2^PAGE_SHIFT`.
pub const PAGE_SHIFT: u32 = 6;

/// Leaf identity within one table.
pub type LeafId = u64;

/// Reserved leaf id for the head leaf, which covers keys below the first
/// page. Real page ids are `key >> PAGE_SHIFT`, so this value cannot
/// collide.
const HEAD_LEAF: LeafId = u64::MAX;

#[inline]
fn leaf_of(key: Key) -> LeafId {
    key >> PAGE_SHIFT
}

#[derive(Debug)]
struct Page<V> {
    stamp: AtomicU64,
    scan_ts: AtomicU64,
    entries: RwLock<BTreeMap<Key, CellRef<V>>>,
}

impl<V> Page<V> {
    fn new(scan_ts_seed: u64) -> Self {
        Page {
            stamp: AtomicU64::new(0),
            scan_ts: AtomicU64::new(scan_ts_seed),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    #[inline]
    fn version(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    #[inline]
    fn bump(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    fn scan_ts(&self) -> u64 {
        self.scan_ts.load(Ordering::Acquire)
    }

    #[inline]
    fn update_scan_ts(&self, ts: u64) {
        self.scan_ts.fetch_max(ts, Ordering::AcqRel);
    }
}

/// Leaf handle passed to scan per-leaf callbacks.
pub struct LeafView<V> {
    /// Leaf identity.
    pub id: LeafId,
    /// Version stamp at the time the scan snapshotted the directory.
    pub version: u64,
    page: Arc<Page<V>>,
}

impl<V> LeafView<V> {
    /// Raise the leaf's scan timestamp to at least `ts`.
    pub fn update_scan_ts(&self, ts: u64) {
        self.page.update_scan_ts(ts);
    }

    /// Current scan timestamp of the leaf.
    pub fn scan_ts(&self) -> u64 {
        self.page.scan_ts()
    }
}

/// Outcome of an index insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Cell installed; any prior observation of the touched leaves matched.
    Inserted(NodeInfo),
    /// Cell installed, but a touched leaf had been observed at a different
    /// version: the caller's observation set is stale and it must abort.
    InsertedConflicting(NodeInfo),
    /// The key is already present; nothing changed.
    AlreadyPresent,
}

enum RawInsert {
    Inserted {
        info: NodeInfo,
        /// Covering-leaf edit when the insert created a new page.
        cover: Option<(LeafId, u64, u64)>,
    },
    AlreadyPresent,
}

struct TablePages<V> {
    head: Arc<Page<V>>,
    pages: RwLock<BTreeMap<LeafId, Arc<Page<V>>>>,
}

impl<V> TablePages<V> {
    fn new() -> Self {
        TablePages {
            head: Arc::new(Page::new(0)),
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    /// Leaf covering `leaf`: the nearest page at or below it, else the head
    /// leaf. Caller holds the directory lock.
    fn covering<'a>(
        &'a self,
        dir: &'a BTreeMap<LeafId, Arc<Page<V>>>,
        leaf: LeafId,
    ) -> (LeafId, &'a Arc<Page<V>>) {
        match dir.range(..=leaf).next_back() {
            Some((&id, page)) => (id, page),
            None => (HEAD_LEAF, &self.head),
        }
    }
}

/// Ordered mapping of `(table, key)` to shared cell pointers with
/// leaf-version observation. See the module docs for structure and lock
/// order.
pub struct OrderedIndex<V> {
    tables: DashMap<TableId, Arc<TablePages<V>>>,
}

impl<V> Default for OrderedIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedIndex<V> {
    /// Create an index with no tables.
    pub fn new() -> Self {
        OrderedIndex {
            tables: DashMap::new(),
        }
    }

    /// Register `table`. Must happen before any operation on it.
    pub fn register_table(&self, table: TableId) {
        self.tables
            .entry(table)
            .or_insert_with(|| Arc::new(TablePages::new()));
    }

    fn table(&self, table: TableId) -> Arc<TablePages<V>> {
        Arc::clone(
            self.tables
                .get(&table)
                .expect("table not registered in index")
                .value(),
        )
    }

    /// Point lookup with no side effects.
    pub fn find(&self, table: TableId, key: Key) -> Option<CellRef<V>> {
        let tp = self.table(table);
        let page = tp.pages.read().get(&leaf_of(key)).cloned()?;
        let entries = page.entries.read();
        entries.get(&key).copied()
    }

    /// Point lookup; on a miss, records the leaf (and stamp) where the key
    /// would live, so a later insert of the key invalidates the caller.
    pub fn find_observing(
        &self,
        table: TableId,
        key: Key,
        nm: &mut NodeObservations,
    ) -> Option<CellRef<V>> {
        let tp = self.table(table);
        let leaf = leaf_of(key);
        let dir = tp.pages.read();
        if let Some(page) = dir.get(&leaf).cloned() {
            drop(dir);
            let entries = page.entries.read();
            if let Some(v) = entries.get(&key).copied() {
                return Some(v);
            }
            let stamp = page.version();
            drop(entries);
            nm.observe(leaf, stamp);
            None
        } else {
            let (cover_id, cover) = tp.covering(&dir, leaf);
            nm.observe(cover_id, cover.version());
            None
        }
    }

    fn insert_raw(&self, table: TableId, key: Key, cell: CellRef<V>) -> RawInsert {
        let tp = self.table(table);
        let leaf = leaf_of(key);

        // Fast path: the page already exists.
        let existing = tp.pages.read().get(&leaf).cloned();
        if let Some(page) = existing {
            return Self::insert_into_page(&page, leaf, key, cell);
        }

        // Slow path: create the page under the directory write lock.
        let mut dir = tp.pages.write();
        if let Some(page) = dir.get(&leaf).cloned() {
            drop(dir);
            return Self::insert_into_page(&page, leaf, key, cell);
        }
        let (cover_id, cover) = {
            let (id, page) = tp.covering(&dir, leaf);
            (id, Arc::clone(page))
        };
        let cover_old = cover.version();
        // The new page inherits the covering leaf's scan timestamp: any
        // scanner that could have observed this key range marked it there.
        let page = Arc::new(Page::new(cover.scan_ts()));
        page.entries.write().insert(key, cell);
        let new_version = page.bump();
        let cover_new = cover.bump();
        dir.insert(leaf, page);
        RawInsert::Inserted {
            info: NodeInfo {
                leaf,
                old_version: 0,
                new_version,
            },
            cover: Some((cover_id, cover_old, cover_new)),
        }
    }

    fn insert_into_page(
        page: &Page<V>,
        leaf: LeafId,
        key: Key,
        cell: CellRef<V>,
    ) -> RawInsert {
        let mut entries = page.entries.write();
        if entries.contains_key(&key) {
            return RawInsert::AlreadyPresent;
        }
        let old_version = page.version();
        entries.insert(key, cell);
        let new_version = page.bump();
        RawInsert::Inserted {
            info: NodeInfo {
                leaf,
                old_version,
                new_version,
            },
            cover: None,
        }
    }

    /// Insert a caller-allocated cell.
    pub fn insert(&self, table: TableId, key: Key, cell: CellRef<V>) -> InsertResult {
        match self.insert_raw(table, key, cell) {
            RawInsert::AlreadyPresent => InsertResult::AlreadyPresent,
            RawInsert::Inserted { info, .. } => InsertResult::Inserted(info),
        }
    }

    /// Insert a caller-allocated cell, folding the structural edit into the
    /// caller's observation set. `InsertedConflicting` means the touched
    /// leaf had been observed at an older version; the cell is installed
    /// regardless and the caller must abort (its abort path detaches the
    /// cell again).
    pub fn insert_observing(
        &self,
        table: TableId,
        key: Key,
        cell: CellRef<V>,
        nm: &mut NodeObservations,
    ) -> InsertResult {
        match self.insert_raw(table, key, cell) {
            RawInsert::AlreadyPresent => InsertResult::AlreadyPresent,
            RawInsert::Inserted { info, cover } => {
                let mut consistent = nm.apply_edit(info.leaf, info.old_version, info.new_version);
                if let Some((leaf, old, new)) = cover {
                    consistent &= nm.apply_edit(leaf, old, new);
                }
                if consistent {
                    InsertResult::Inserted(info)
                } else {
                    InsertResult::InsertedConflicting(info)
                }
            }
        }
    }

    /// Remove `key`. Returns `false` when it was not present.
    pub fn remove(&self, table: TableId, key: Key) -> bool {
        let tp = self.table(table);
        let Some(page) = tp.pages.read().get(&leaf_of(key)).cloned() else {
            return false;
        };
        let mut entries = page.entries.write();
        if entries.remove(&key).is_some() {
            page.bump();
            true
        } else {
            false
        }
    }

    /// Strict successor of `key`, if any.
    pub fn get_next_kv(&self, table: TableId, key: Key) -> Option<(Key, CellRef<V>)> {
        let tp = self.table(table);
        let dir = tp.pages.read();
        let start = leaf_of(key);
        for (&id, page) in dir.range(start..) {
            let entries = page.entries.read();
            let next = if id == start {
                entries.range((Excluded(key), Unbounded)).next()
            } else {
                entries.iter().next()
            };
            if let Some((&k, &v)) = next {
                return Some((k, v));
            }
        }
        None
    }

    /// Current version stamp of `leaf`; 0 for a leaf that never existed.
    pub fn leaf_version(&self, table: TableId, leaf: LeafId) -> u64 {
        let tp = self.table(table);
        if leaf == HEAD_LEAF {
            return tp.head.version();
        }
        let version = tp.pages
            .read()
            .get(&leaf)
            .map(|p| p.version())
            .unwrap_or(0);
        version
    }

    /// Current scan timestamp of `leaf`.
    pub fn leaf_scan_ts(&self, table: TableId, leaf: LeafId) -> u64 {
        let tp = self.table(table);
        if leaf == HEAD_LEAF {
            return tp.head.scan_ts();
        }
        let scan_ts = tp.pages
            .read()
            .get(&leaf)
            .map(|p| p.scan_ts())
            .unwrap_or(0);
        scan_ts
    }

    /// Forward range visitor over `[lkey, rkey)`.
    ///
    /// `per_leaf` runs once per visited leaf (covering leaf of the range
    /// start first, when distinct) with the stamp snapshotted under the
    /// directory lock; `per_kv` runs per entry. Clearing the continue flag
    /// stops the traversal.
    pub fn scan(
        &self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        mut per_leaf: impl FnMut(&LeafView<V>, &mut bool),
        mut per_kv: impl FnMut(Key, CellRef<V>, &mut bool),
    ) {
        if lkey >= rkey {
            return;
        }
        let tp = self.table(table);
        let lo_leaf = leaf_of(lkey);
        let hi_leaf = leaf_of(rkey - 1);

        let dir = tp.pages.read();
        let cover = if dir.contains_key(&lo_leaf) {
            None
        } else {
            let (id, page) = tp.covering(&dir, lo_leaf);
            Some((id, Arc::clone(page), page.version()))
        };
        let snapshot: Vec<(LeafId, Arc<Page<V>>, u64)> = dir
            .range(lo_leaf..=hi_leaf)
            .map(|(&id, page)| (id, Arc::clone(page), page.version()))
            .collect();
        drop(dir);

        let mut cont = true;
        if let Some((id, page, version)) = &cover {
            per_leaf(
                &LeafView {
                    id: *id,
                    version: *version,
                    page: Arc::clone(page),
                },
                &mut cont,
            );
            if !cont {
                return;
            }
        }
        for (id, page, version) in &snapshot {
            per_leaf(
                &LeafView {
                    id: *id,
                    version: *version,
                    page: Arc::clone(page),
                },
                &mut cont,
            );
            if !cont {
                return;
            }
            let entries: Vec<(Key, CellRef<V>)> = {
                let guard = page.entries.read();
                guard.range(lkey..rkey).map(|(&k, &v)| (k, v)).collect()
            };
            for (k, v) in entries {
                per_kv(k, v, &mut cont);
                if !cont {
                    return;
                }
            }
        }
    }

    /// Reverse range visitor over `(lkey, rkey]`, visiting keys in
    /// descending order. Callbacks as in [`Self::scan`].
    pub fn rscan(
        &self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        mut per_leaf: impl FnMut(&LeafView<V>, &mut bool),
        mut per_kv: impl FnMut(Key, CellRef<V>, &mut bool),
    ) {
        if lkey >= rkey {
            return;
        }
        let tp = self.table(table);
        let lo_key = lkey + 1;
        let lo_leaf = leaf_of(lo_key);
        let hi_leaf = leaf_of(rkey);

        let dir = tp.pages.read();
        let cover = if dir.contains_key(&lo_leaf) {
            None
        } else {
            let (id, page) = tp.covering(&dir, lo_leaf);
            Some((id, Arc::clone(page), page.version()))
        };
        let snapshot: Vec<(LeafId, Arc<Page<V>>, u64)> = dir
            .range(lo_leaf..=hi_leaf)
            .map(|(&id, page)| (id, Arc::clone(page), page.version()))
            .collect();
        drop(dir);

        let mut cont = true;
        if let Some((id, page, version)) = &cover {
            per_leaf(
                &LeafView {
                    id: *id,
                    version: *version,
                    page: Arc::clone(page),
                },
                &mut cont,
            );
            if !cont {
                return;
            }
        }
        for (id, page, version) in snapshot.iter().rev() {
            per_leaf(
                &LeafView {
                    id: *id,
                    version: *version,
                    page: Arc::clone(page),
                },
                &mut cont,
            );
            if !cont {
                return;
            }
            let entries: Vec<(Key, CellRef<V>)> = {
                let guard = page.entries.read();
                guard
                    .range((Excluded(lkey), Included(rkey)))
                    .map(|(&k, &v)| (k, v))
                    .collect()
            };
            for (k, v) in entries.into_iter().rev() {
                per_kv(k, v, &mut cont);
                if !cont {
                    return;
                }
            }
        }
    }
}
