//! Global epoch clock
//!
//! A process-wide 32-bit epoch with one slot per worker. Each worker
//! publishes the epoch it last observed when it begins a transaction; the
//! manager advances the global epoch only once every worker has published
//! the current value. That gives the reclamation barrier the epoch-based
//! protocols rely on: memory detached at epoch `e` is safe to free once the
//! global epoch reaches `e + 2`, because no live transaction can still run
//! in an epoch older than `e`.
//!
//! The manager loop doubles as the duration bound for benchmark runs: it
//! sleeps in short intervals, advancing when possible, and returns once the
//! configured wall-clock duration has elapsed. Spawning the thread that
//! calls it is the caller's business.

use bedrock_core::Epoch;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const INITIAL_EPOCH: Epoch = 1;

/// Shared epoch state: the global clock plus one published-epoch slot per
/// worker.
pub struct EpochManager {
    global: CachePadded<AtomicU32>,
    slots: Vec<CachePadded<AtomicU32>>,
}

impl EpochManager {
    /// Create the epoch state for `num_workers` workers.
    pub fn new(num_workers: usize) -> Arc<Self> {
        let slots = (0..num_workers)
            .map(|_| CachePadded::new(AtomicU32::new(INITIAL_EPOCH)))
            .collect();
        Arc::new(EpochManager {
            global: CachePadded::new(AtomicU32::new(INITIAL_EPOCH)),
            slots,
        })
    }

    /// Current global epoch.
    #[inline]
    pub fn global_epoch(&self) -> Epoch {
        self.global.load(Ordering::Acquire)
    }

    /// Smallest epoch published by any worker. With no workers the clock
    /// free-runs.
    pub fn smallest_worker_epoch(&self) -> Epoch {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .min()
            .unwrap_or_else(|| self.global_epoch())
    }

    /// Advance the global epoch by one if every worker has observed the
    /// current value. Returns whether the epoch moved.
    pub fn try_advance(&self) -> bool {
        let current = self.global_epoch();
        if current == self.smallest_worker_epoch() {
            self.global.fetch_add(1, Ordering::AcqRel);
            debug!(epoch = current + 1, "epoch advanced");
            true
        } else {
            debug!(epoch = current, "epoch held back by a worker");
            false
        }
    }

    /// Manager loop: sleep `interval`, try to advance, exit after
    /// `duration` of wall-clock time.
    pub fn run_for(&self, duration: Duration, interval: Duration) {
        let started = Instant::now();
        loop {
            std::thread::sleep(interval);
            self.try_advance();
            if started.elapsed() > duration {
                break;
            }
        }
    }

    /// Handle for worker `id`.
    ///
    /// # Panics
    /// Panics when `id` is outside the worker count given at construction.
    pub fn worker(self: &Arc<Self>, id: usize) -> EpochWorker {
        assert!(id < self.slots.len(), "epoch worker id out of range");
        EpochWorker {
            mgr: Arc::clone(self),
            id,
        }
    }
}

/// Per-worker epoch handle. Not shared across threads; the manager reads
/// the published slot through the shared state.
pub struct EpochWorker {
    mgr: Arc<EpochManager>,
    id: usize,
}

impl EpochWorker {
    /// Publish the current global epoch as this worker's visible epoch and
    /// return it. Called at every transaction begin.
    pub fn refresh(&self) -> Epoch {
        let epoch = self.mgr.global_epoch();
        self.mgr.slots[self.id].store(epoch, Ordering::Release);
        epoch
    }

    /// The epoch this worker last published.
    pub fn published(&self) -> Epoch {
        self.mgr.slots[self.id].load(Ordering::Acquire)
    }

    /// The shared epoch state.
    pub fn manager(&self) -> &Arc<EpochManager> {
        &self.mgr
    }
}
