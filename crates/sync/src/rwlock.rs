//! Reader-writer spinlock with upgrade
//!
//! State is a single signed counter: `0` free, `k > 0` means `k` readers,
//! `-1` means one writer. Blocking variants spin with compare-and-swap; no
//! fairness is promised. The upgrade path assumes the caller already holds
//! exactly one shared lock and is the only reader; callers must uphold that
//! precondition (the try variant simply fails otherwise).

use std::hint;
use std::sync::atomic::{AtomicI64, Ordering};

const WRITER: i64 = -1;

/// Counter-based reader-writer spinlock.
#[derive(Debug, Default)]
pub struct SpinRwLock {
    cnt: AtomicI64,
}

impl SpinRwLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        SpinRwLock {
            cnt: AtomicI64::new(0),
        }
    }

    /// Acquire a shared lock, spinning while a writer holds the lock.
    pub fn lock_shared(&self) {
        loop {
            let expected = self.cnt.load(Ordering::Acquire);
            if expected >= 0
                && self
                    .cnt
                    .compare_exchange(expected, expected + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            hint::spin_loop();
        }
    }

    /// Try to acquire a shared lock without blocking.
    pub fn try_lock_shared(&self) -> bool {
        let mut expected = self.cnt.load(Ordering::Acquire);
        while expected >= 0 {
            match self.cnt.compare_exchange(
                expected,
                expected + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => expected = current,
            }
        }
        false
    }

    /// Acquire the exclusive lock, spinning until free.
    pub fn lock(&self) {
        loop {
            if self
                .cnt
                .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            hint::spin_loop();
        }
    }

    /// Try to acquire the exclusive lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.cnt
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Upgrade a held shared lock to exclusive, spinning until this caller
    /// is the only reader. Precondition: the caller holds exactly one shared
    /// lock.
    pub fn lock_upgrade(&self) {
        loop {
            if self
                .cnt
                .compare_exchange(1, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            hint::spin_loop();
        }
    }

    /// Try to upgrade a held shared lock to exclusive. Fails when other
    /// readers are present. Precondition as [`Self::lock_upgrade`].
    pub fn try_lock_upgrade(&self) -> bool {
        self.cnt
            .compare_exchange(1, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Demote the exclusive lock back to a single shared lock.
    ///
    /// Used to undo a provisional upgrade (next-key locking) without losing
    /// the original shared hold.
    pub fn downgrade(&self) {
        let prev = self.cnt.swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, WRITER, "downgrade without exclusive lock");
    }

    /// Release a shared lock.
    pub fn unlock_shared(&self) {
        let prev = self.cnt.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "unlock_shared without shared lock");
    }

    /// Release the exclusive lock.
    pub fn unlock(&self) {
        let prev = self.cnt.swap(0, Ordering::Release);
        debug_assert_eq!(prev, WRITER, "unlock without exclusive lock");
    }

    /// Whether a writer currently holds the lock. Diagnostic only; the
    /// answer may be stale by the time it is observed.
    pub fn is_locked_exclusive(&self) -> bool {
        self.cnt.load(Ordering::Acquire) == WRITER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shared_then_exclusive() {
        let l = SpinRwLock::new();
        assert!(l.try_lock_shared());
        assert!(l.try_lock_shared());
        assert!(!l.try_lock());
        l.unlock_shared();
        assert!(!l.try_lock());
        l.unlock_shared();
        assert!(l.try_lock());
        assert!(!l.try_lock_shared());
        l.unlock();
    }

    #[test]
    fn test_upgrade_requires_sole_reader() {
        let l = SpinRwLock::new();
        assert!(l.try_lock_shared());
        assert!(l.try_lock_shared());
        assert!(!l.try_lock_upgrade());
        l.unlock_shared();
        assert!(l.try_lock_upgrade());
        assert!(l.is_locked_exclusive());
        l.unlock();
    }

    #[test]
    fn test_downgrade_restores_shared() {
        let l = SpinRwLock::new();
        assert!(l.try_lock_shared());
        assert!(l.try_lock_upgrade());
        l.downgrade();
        assert!(l.try_lock_shared());
        l.unlock_shared();
        l.unlock_shared();
        assert!(l.try_lock());
        l.unlock();
    }

    #[test]
    fn test_concurrent_readers_exclude_writer() {
        let l = Arc::new(SpinRwLock::new());
        let counter = Arc::new(AtomicI64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = Arc::clone(&l);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    l.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    l.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    proptest::proptest! {
        // Any interleaving of successful try-ops leaves the counter
        // consistent with the number of outstanding shared holds.
        #[test]
        fn prop_counter_tracks_holds(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let l = SpinRwLock::new();
            let mut shared = 0i64;
            for op in ops {
                match op {
                    0 => {
                        if l.try_lock_shared() {
                            shared += 1;
                        }
                    }
                    1 => {
                        if shared > 0 {
                            l.unlock_shared();
                            shared -= 1;
                        }
                    }
                    _ => {
                        if l.try_lock() {
                            proptest::prop_assert_eq!(shared, 0);
                            l.unlock();
                        }
                    }
                }
            }
            proptest::prop_assert_eq!(l.cnt.load(Ordering::Relaxed), shared);
        }
    }
}
