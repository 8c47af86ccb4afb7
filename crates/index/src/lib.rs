//! Ordered index adapter for the Bedrock engine
//!
//! Maps `(table, key)` to shared value-cell pointers with the leaf-version
//! semantics the concurrency-control protocols rely on: every structural
//! edit of a leaf (key insert or removal) strictly increments that leaf's
//! version stamp, and the stamp is observable without holding any lock.
//!
//! The in-tree realization is a paged map: each table is a directory of
//! fixed key-range pages (the leaves), each holding its sorted entries
//! behind a short lock next to an atomic version stamp and an atomic scan
//! timestamp. A missing key is "covered" by the nearest existing leaf at or
//! below it (or the table's head leaf), and creating a new page bumps the
//! covering leaf, so a recorded miss observation is invalidated by any
//! insert that could make the key appear.

#![warn(clippy::all)]

mod cell;
mod observe;
mod paged;

pub use cell::CellRef;
pub use observe::{NodeInfo, NodeObservations};
pub use paged::{InsertResult, LeafId, LeafView, OrderedIndex, PAGE_SHIFT};
