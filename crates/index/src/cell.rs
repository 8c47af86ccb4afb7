//! Shared cell pointers
//!
//! The index stores raw pointers to protocol-owned value cells. A `CellRef`
//! is a copyable, non-owning handle; the engine allocates cells, hands them
//! to the index, and reclaims them through its garbage collector once they
//! are detached and the reclamation watermark has passed. That contract is
//! what makes `as_ref` sound: a `CellRef` reachable by a live transaction
//! always points at memory that has not been reclaimed yet.

use std::ptr::NonNull;

/// Non-owning shared pointer to a value cell of type `V`.
pub struct CellRef<V>(NonNull<V>);

impl<V> CellRef<V> {
    /// Allocate a cell on the heap and return its shared handle.
    ///
    /// Ownership moves into the shared structures; it comes back via
    /// [`CellRef::into_box`] on the reclamation path.
    pub fn alloc(cell: V) -> Self {
        // Box::into_raw never returns null.
        CellRef(unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(cell))) })
    }

    /// Borrow the cell.
    ///
    /// Sound under the reclamation contract described in the type docs.
    #[inline]
    pub fn get(&self) -> &V {
        unsafe { self.0.as_ref() }
    }

    /// The raw pointer, for identity comparisons and diagnostics.
    #[inline]
    pub fn as_ptr(&self) -> *mut V {
        self.0.as_ptr()
    }

    /// Reclaim the cell allocation.
    ///
    /// # Safety
    /// The cell must have been produced by [`CellRef::alloc`], must be
    /// unreachable from the index, and no live transaction may still hold a
    /// handle to it (the garbage collector's watermark guarantees this).
    pub unsafe fn into_box(self) -> Box<V> {
        Box::from_raw(self.0.as_ptr())
    }
}

impl<V> Clone for CellRef<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for CellRef<V> {}

impl<V> PartialEq for CellRef<V> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<V> Eq for CellRef<V> {}

impl<V> std::fmt::Debug for CellRef<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CellRef({:p})", self.0.as_ptr())
    }
}

// A CellRef behaves like &V across threads; the pointee outlives all holders
// by the reclamation contract.
unsafe impl<V: Sync> Send for CellRef<V> {}
unsafe impl<V: Sync> Sync for CellRef<V> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_get_reclaim() {
        let cell = CellRef::alloc(41u64);
        assert_eq!(*cell.get(), 41);
        let copy = cell;
        assert_eq!(copy, cell);
        unsafe {
            assert_eq!(*cell.into_box(), 41);
        }
    }
}
