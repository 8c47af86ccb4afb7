//! Timestamp management for the timestamp-ordered protocols
//!
//! Every worker owns a monotonically increasing transaction counter; a
//! commit timestamp is `(counter << 8) | worker_id`, unique and totally
//! ordered with ties broken by worker id. The manager periodically reads
//! all counters and publishes two watermarks back to every worker: the
//! smallest (used for version-chain trimming) and the largest (used as the
//! deferred-reclamation stamp).
//!
//! Workers keep watermarks tight by opportunistically adopting a peer's
//! larger counter every `sync_every` transactions (one-sided, round-robin),
//! and boost their counter by `2^min(abort_count, 2)` after an abort to
//! break repeat collisions.

use bedrock_core::types::{pack_ts, Ts, TxId, WorkerId};
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct TsSlot {
    txn_cnt: CachePadded<AtomicU64>,
    smallest: AtomicU64,
    largest: AtomicU64,
}

impl TsSlot {
    fn new() -> Self {
        TsSlot {
            txn_cnt: CachePadded::new(AtomicU64::new(1)),
            smallest: AtomicU64::new(1),
            largest: AtomicU64::new(1),
        }
    }
}

/// Shared timestamp state: one slot per worker.
pub struct TimestampManager {
    slots: Vec<TsSlot>,
}

impl TimestampManager {
    /// Create timestamp state for `num_workers` workers.
    pub fn new(num_workers: usize) -> Arc<Self> {
        Arc::new(TimestampManager {
            slots: (0..num_workers).map(|_| TsSlot::new()).collect(),
        })
    }

    /// Read every worker's counter and publish the smallest and largest
    /// back to all of them. The smallest is backed off by one so that a
    /// transaction begun concurrently with the sweep stays protected.
    pub fn publish_watermarks(&self) {
        let mut smallest = u64::MAX;
        let mut largest = 0;
        for slot in &self.slots {
            let cnt = slot.txn_cnt.load(Ordering::Acquire);
            smallest = smallest.min(cnt);
            largest = largest.max(cnt);
        }
        if smallest == u64::MAX {
            return;
        }
        let smallest = smallest.saturating_sub(1);
        debug!(smallest, largest, "publishing timestamp watermarks");
        for slot in &self.slots {
            slot.smallest.store(smallest, Ordering::Release);
            slot.largest.store(largest, Ordering::Release);
        }
    }

    /// Manager loop: publish watermarks every `interval`, exit after
    /// `duration` of wall-clock time.
    pub fn run_for(&self, duration: Duration, interval: Duration) {
        let started = Instant::now();
        loop {
            std::thread::sleep(interval);
            self.publish_watermarks();
            if started.elapsed() > duration {
                break;
            }
        }
    }

    /// One-sided synchronization: worker `id` adopts the counter of the
    /// peer `offset` steps ahead when that peer is further along.
    fn synchronize(&self, id: WorkerId, offset: u8) {
        let n = self.slots.len();
        if n <= 1 {
            return;
        }
        let max_id = (n - 1) as u8;
        let step = (offset % max_id) + 1;
        let peer = (id as usize + step as usize) % n;
        let own = self.slots[id as usize].txn_cnt.load(Ordering::Acquire);
        let theirs = self.slots[peer].txn_cnt.load(Ordering::Acquire);
        if own < theirs {
            self.slots[id as usize]
                .txn_cnt
                .store(theirs, Ordering::Release);
        }
    }

    /// Handle for worker `id`, synchronizing with a peer every
    /// `sync_every` transactions.
    ///
    /// # Panics
    /// Panics when `id` is outside the worker count given at construction.
    pub fn worker(self: &Arc<Self>, id: WorkerId, sync_every: u64) -> TsWorker {
        assert!(
            (id as usize) < self.slots.len(),
            "timestamp worker id out of range"
        );
        TsWorker {
            mgr: Arc::clone(self),
            id,
            sync_every: sync_every.max(1),
            next_peer: Cell::new(0),
            abort_cnt: Cell::new(0),
            tx_counter: Cell::new(1),
        }
    }
}

/// Per-worker timestamp handle. Stays on its owning thread; the manager
/// reads the shared slot through `TimestampManager`.
pub struct TsWorker {
    mgr: Arc<TimestampManager>,
    id: WorkerId,
    sync_every: u64,
    next_peer: Cell<u8>,
    abort_cnt: Cell<u32>,
    tx_counter: Cell<u32>,
}

impl TsWorker {
    fn slot(&self) -> &TsSlot {
        &self.mgr.slots[self.id as usize]
    }

    fn advance(&self, by: u64) -> Ts {
        let cnt = self.slot().txn_cnt.fetch_add(by, Ordering::AcqRel);
        if cnt % self.sync_every == 0 {
            let offset = self.next_peer.get();
            self.next_peer.set(offset.wrapping_add(1));
            self.mgr.synchronize(self.id, offset);
        }
        pack_ts(cnt, self.id)
    }

    /// Fresh start timestamp for a new transaction.
    pub fn new_ts(&self) -> Ts {
        self.abort_cnt.set(0);
        self.advance(1)
    }

    /// Start timestamp for a retry, boosted by `2^min(abort_count, 2)` to
    /// reduce repeat collisions.
    pub fn abort_boosted_ts(&self) -> Ts {
        let aborts = self.abort_cnt.get() + 1;
        self.abort_cnt.set(aborts);
        self.advance(1 << aborts.min(2))
    }

    /// Smallest-counter watermark as a timestamp.
    pub fn smallest_ts(&self) -> Ts {
        pack_ts(self.slot().smallest.load(Ordering::Acquire), self.id)
    }

    /// Largest-counter watermark as a timestamp.
    pub fn largest_ts(&self) -> Ts {
        pack_ts(self.slot().largest.load(Ordering::Acquire), self.id)
    }

    /// Next diagnostic transaction id.
    pub fn next_txid(&self) -> TxId {
        let counter = self.tx_counter.get();
        self.tx_counter.set(counter.wrapping_add(1));
        TxId::new(self.id as u32, counter)
    }

    /// This worker's id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The shared timestamp state.
    pub fn manager(&self) -> &Arc<TimestampManager> {
        &self.mgr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_unique_and_increasing() {
        let mgr = TimestampManager::new(2);
        let w0 = mgr.worker(0, 1000);
        let w1 = mgr.worker(1, 1000);
        let a = w0.new_ts();
        let b = w0.new_ts();
        let c = w1.new_ts();
        assert!(a < b);
        assert_ne!(a, c);
        assert_eq!(a & 0xff, 0);
        assert_eq!(c & 0xff, 1);
    }

    #[test]
    fn test_abort_boost_caps_at_four() {
        let mgr = TimestampManager::new(1);
        let w = mgr.worker(0, u64::MAX);
        let base = w.new_ts() >> 8;
        let b1 = w.abort_boosted_ts() >> 8;
        let b2 = w.abort_boosted_ts() >> 8;
        let b3 = w.abort_boosted_ts() >> 8;
        assert_eq!(b1, base + 1);
        assert_eq!(b2, b1 + 2);
        assert_eq!(b3, b2 + 4);
        // A fourth abort still advances by 4, not 8.
        let b4 = w.abort_boosted_ts() >> 8;
        assert_eq!(b4, b3 + 4);
    }

    #[test]
    fn test_watermarks_cover_all_workers() {
        let mgr = TimestampManager::new(2);
        let w0 = mgr.worker(0, u64::MAX);
        let w1 = mgr.worker(1, u64::MAX);
        for _ in 0..5 {
            w0.new_ts();
        }
        w1.new_ts();
        mgr.publish_watermarks();
        // Counters: w0 at 6, w1 at 2. Smallest watermark is 2 - 1.
        assert_eq!(w0.smallest_ts() >> 8, 1);
        assert_eq!(w0.largest_ts() >> 8, 6);
        assert_eq!(w1.smallest_ts() >> 8, 1);
    }

    #[test]
    fn test_one_sided_sync_adopts_peer_counter() {
        let mgr = TimestampManager::new(2);
        // sync_every = 1 so every transaction synchronizes.
        let w0 = mgr.worker(0, 1);
        let w1 = mgr.worker(1, u64::MAX);
        for _ in 0..10 {
            w1.new_ts();
        }
        let before = w0.new_ts() >> 8;
        let after = w0.new_ts() >> 8;
        // The first begin synchronized with the peer, so the second jumps.
        assert!(after > before + 1, "before={before} after={after}");
    }

    #[test]
    fn test_txid_counts_up() {
        let mgr = TimestampManager::new(1);
        let w = mgr.worker(0, 1000);
        assert_eq!(w.next_txid().counter(), 1);
        assert_eq!(w.next_txid().counter(), 2);
        assert_eq!(w.next_txid().worker_id(), 0);
    }
}
