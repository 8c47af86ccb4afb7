//! Leaf observations for phantom detection
//!
//! A transaction whose outcome depends on which leaf a key resolves to
//! records `(leaf, version stamp)` pairs here. At commit the protocol
//! reloads each observed leaf's stamp and aborts on any mismatch: a changed
//! stamp means a key was inserted into or removed from a leaf this
//! transaction's reads depended on.

use crate::paged::LeafId;
use rustc_hash::FxHashMap;

/// Identity and version stamps of the leaf touched by an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Leaf the key now lives in.
    pub leaf: LeafId,
    /// Leaf stamp before the insert.
    pub old_version: u64,
    /// Leaf stamp after the insert.
    pub new_version: u64,
}

/// Per-transaction, per-table map of observed leaves.
#[derive(Debug, Default)]
pub struct NodeObservations {
    map: FxHashMap<LeafId, u64>,
}

impl NodeObservations {
    /// Record `(leaf, stamp)` unless the leaf was already observed. An
    /// earlier observation wins; commit validation catches any divergence.
    pub fn observe(&mut self, leaf: LeafId, stamp: u64) {
        self.map.entry(leaf).or_insert(stamp);
    }

    /// Record `(leaf, stamp)`, reporting whether it is consistent with an
    /// earlier observation of the same leaf. Used by scans: an in-scan
    /// mismatch means the structure changed mid-traversal.
    pub fn observe_checked(&mut self, leaf: LeafId, stamp: u64) -> bool {
        *self.map.entry(leaf).or_insert(stamp) == stamp
    }

    /// Fold this transaction's own structural edit into the observation set:
    /// if `leaf` was observed, it must still have been at `old`; the
    /// recorded stamp then advances to `new`. Returns `false` when the
    /// observation no longer matches (the leaf changed under us).
    pub fn apply_edit(&mut self, leaf: LeafId, old: u64, new: u64) -> bool {
        match self.map.get_mut(&leaf) {
            None => true,
            Some(stamp) if *stamp == old => {
                *stamp = new;
                true
            }
            Some(_) => false,
        }
    }

    /// Iterate the recorded `(leaf, stamp)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (LeafId, u64)> + '_ {
        self.map.iter().map(|(&leaf, &stamp)| (leaf, stamp))
    }

    /// Number of observed leaves.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing has been observed.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop all observations (transaction end).
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
