//! Per-worker execution statistics
//!
//! Each worker keeps one [`PerTxStat`] per transaction profile it runs and
//! merges them into a [`Stat`] at the end of a run. Counters are plain (the
//! owning worker is the only writer); aggregation happens after workers stop.

use crate::error::{AbortReason, ABORT_REASONS};

/// Counters for one transaction profile on one worker.
#[derive(Debug, Clone)]
pub struct PerTxStat {
    /// Committed transactions.
    pub commits: u64,
    /// Domain-level rollbacks (not retried).
    pub user_aborts: u64,
    /// Concurrency-conflict aborts (retried).
    pub sys_aborts: u64,
    /// System aborts bucketed by [`AbortReason`].
    pub abort_reasons: [u64; ABORT_REASONS],
    /// Sum of commit latencies, in nanoseconds.
    pub total_latency: u64,
    /// Smallest observed commit latency.
    pub min_latency: u64,
    /// Largest observed commit latency.
    pub max_latency: u64,
}

impl Default for PerTxStat {
    fn default() -> Self {
        PerTxStat {
            commits: 0,
            user_aborts: 0,
            sys_aborts: 0,
            abort_reasons: [0; ABORT_REASONS],
            total_latency: 0,
            min_latency: u64::MAX,
            max_latency: 0,
        }
    }
}

impl PerTxStat {
    /// Record a commit with its latency.
    pub fn commit(&mut self, latency_ns: u64) {
        self.commits += 1;
        self.total_latency += latency_ns;
        self.min_latency = self.min_latency.min(latency_ns);
        self.max_latency = self.max_latency.max(latency_ns);
    }

    /// Record a user abort.
    pub fn user_abort(&mut self) {
        self.user_aborts += 1;
    }

    /// Record a system abort under `reason`.
    pub fn sys_abort(&mut self, reason: AbortReason) {
        self.sys_aborts += 1;
        self.abort_reasons[reason.index()] += 1;
    }

    /// Fold `rhs` into this counter set.
    pub fn add(&mut self, rhs: &PerTxStat) {
        self.commits += rhs.commits;
        self.user_aborts += rhs.user_aborts;
        self.sys_aborts += rhs.sys_aborts;
        for (a, b) in self.abort_reasons.iter_mut().zip(rhs.abort_reasons.iter()) {
            *a += *b;
        }
        self.total_latency += rhs.total_latency;
        self.min_latency = self.min_latency.min(rhs.min_latency);
        self.max_latency = self.max_latency.max(rhs.max_latency);
    }
}

/// Per-worker statistics, one [`PerTxStat`] per transaction profile.
#[derive(Debug, Clone, Default)]
pub struct Stat {
    per_profile: Vec<PerTxStat>,
}

impl Stat {
    /// Create a statistics block with `profiles` buckets.
    pub fn new(profiles: usize) -> Self {
        Stat {
            per_profile: vec![PerTxStat::default(); profiles],
        }
    }

    /// Counters for `profile`.
    pub fn profile(&self, profile: usize) -> &PerTxStat {
        &self.per_profile[profile]
    }

    /// Mutable counters for `profile`.
    pub fn profile_mut(&mut self, profile: usize) -> &mut PerTxStat {
        &mut self.per_profile[profile]
    }

    /// Fold another worker's statistics into this one.
    pub fn add(&mut self, rhs: &Stat) {
        assert_eq!(self.per_profile.len(), rhs.per_profile.len());
        for (a, b) in self.per_profile.iter_mut().zip(rhs.per_profile.iter()) {
            a.add(b);
        }
    }

    /// Collapse all profiles into a single counter set.
    pub fn aggregate(&self) -> PerTxStat {
        let mut out = PerTxStat::default();
        for p in &self.per_profile {
            out.add(p);
        }
        out
    }
}
