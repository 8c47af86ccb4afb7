//! Per-transaction read/write sets
//!
//! Local state keyed by `(table, key)`. The element type is
//! protocol-specific (captured tidword, version pointers, or just the lock
//! mode implied by the entry type); this module provides the shared
//! containers: the per-table entry maps and the order-preserving list of
//! write-set keys used for canonical-order locking at commit.

use bedrock_core::{Key, TableId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::hash_map::Entry;

/// How a transaction touched a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwType {
    /// Observed only.
    Read,
    /// Will replace the record at commit.
    Update,
    /// Will make the key visible at commit.
    Insert,
    /// Will remove the key at commit.
    Delete,
}

/// Per-table maps of key to protocol entry.
#[derive(Debug)]
pub struct ReadWriteSet<E> {
    tables: FxHashMap<TableId, FxHashMap<Key, E>>,
}

impl<E> Default for ReadWriteSet<E> {
    fn default() -> Self {
        ReadWriteSet {
            tables: FxHashMap::default(),
        }
    }
}

impl<E> ReadWriteSet<E> {
    /// The mutable entry map of `table`, created on first touch.
    pub fn table(&mut self, table: TableId) -> &mut FxHashMap<Key, E> {
        self.tables.entry(table).or_default()
    }

    /// Vacant-or-occupied view of `(table, key)`.
    pub fn entry(&mut self, table: TableId, key: Key) -> Entry<'_, Key, E> {
        self.table(table).entry(key)
    }

    /// The entry at `(table, key)`, if touched.
    pub fn get(&self, table: TableId, key: Key) -> Option<&E> {
        self.tables.get(&table).and_then(|t| t.get(&key))
    }

    /// Mutable entry at `(table, key)`, if touched.
    pub fn get_mut(&mut self, table: TableId, key: Key) -> Option<&mut E> {
        self.tables.get_mut(&table).and_then(|t| t.get_mut(&key))
    }

    /// Iterate the entries of `table` in unspecified order.
    pub fn iter_table(&self, table: TableId) -> impl Iterator<Item = (Key, &E)> {
        self.tables
            .get(&table)
            .into_iter()
            .flat_map(|t| t.iter().map(|(&k, e)| (k, e)))
    }

    /// Drop everything (transaction end).
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

/// Order-preserving list of write-set keys per table. A key is pushed once,
/// when it first enters the write set; commit sorts each table's list
/// ascending so every transaction locks in the same canonical order.
#[derive(Debug, Default)]
pub struct WriteOrder {
    tables: FxHashMap<TableId, SmallVec<[Key; 8]>>,
}

impl WriteOrder {
    /// Append `key` to `table`'s write list.
    pub fn push(&mut self, table: TableId, key: Key) {
        self.tables.entry(table).or_default().push(key);
    }

    /// Remove `key` from `table`'s write list (withdrawn insert).
    pub fn forget(&mut self, table: TableId, key: Key) {
        if let Some(keys) = self.tables.get_mut(&table) {
            keys.retain(|&mut k| k != key);
        }
    }

    /// Sort `table`'s write list into ascending key order and return it.
    pub fn sorted(&mut self, table: TableId) -> &[Key] {
        match self.tables.get_mut(&table) {
            Some(keys) => {
                keys.sort_unstable();
                keys
            }
            None => &[],
        }
    }

    /// `table`'s write list in insertion order.
    pub fn keys(&self, table: TableId) -> &[Key] {
        self.tables.get(&table).map(|k| k.as_slice()).unwrap_or(&[])
    }

    /// Drop everything (transaction end).
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_lifecycle() {
        let mut rws: ReadWriteSet<RwType> = ReadWriteSet::default();
        assert!(rws.get(1, 5).is_none());
        rws.entry(1, 5).or_insert(RwType::Read);
        *rws.get_mut(1, 5).unwrap() = RwType::Update;
        assert_eq!(rws.get(1, 5), Some(&RwType::Update));
        assert_eq!(rws.iter_table(1).count(), 1);
        assert_eq!(rws.iter_table(2).count(), 0);
        rws.clear();
        assert!(rws.get(1, 5).is_none());
    }

    #[test]
    fn test_write_order_sorts_per_table() {
        let mut ws = WriteOrder::default();
        ws.push(1, 30);
        ws.push(1, 10);
        ws.push(2, 99);
        ws.push(1, 20);
        assert_eq!(ws.keys(1), &[30, 10, 20]);
        assert_eq!(ws.sorted(1), &[10, 20, 30]);
        assert_eq!(ws.sorted(2), &[99]);
        assert_eq!(ws.sorted(3), &[] as &[Key]);
    }

    #[test]
    fn test_forget_withdraws_key() {
        let mut ws = WriteOrder::default();
        ws.push(1, 10);
        ws.push(1, 20);
        ws.forget(1, 10);
        assert_eq!(ws.sorted(1), &[20]);
    }
}
