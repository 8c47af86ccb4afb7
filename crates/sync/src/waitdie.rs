//! Timestamp-ordered wait-die lock
//!
//! Shared, exclusive, and upgrade modes, parameterized by the acquiring
//! transaction's start timestamp. At contention an older requester (smaller
//! timestamp) queues and sleeps until grantable; a younger requester fails
//! immediately and its transaction must abort. Owners and waiters are kept in
//! timestamp order; promotion after a release walks waiters from the oldest
//! end and grants as many as the mode allows:
//! - a write waiter only when no owners remain,
//! - read waiters while the front of the queue stays a reader and no write
//!   owner exists,
//! - an upgrade waiter only when it is the sole remaining owner.
//!
//! An upgrade request while other shared owners exist waits iff the requester
//! is the oldest owner, otherwise it dies. Upgrading without holding a shared
//! lock is a caller error.

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

type Ts = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Free,
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    Shared,
    Exclusive,
    Upgrade,
}

#[derive(Debug)]
struct Waiter {
    ts: Ts,
    mode: WaitMode,
    waiting: CachePadded<AtomicBool>,
}

impl Waiter {
    fn new(ts: Ts, mode: WaitMode) -> Arc<Self> {
        Arc::new(Waiter {
            ts,
            mode,
            waiting: CachePadded::new(AtomicBool::new(true)),
        })
    }
}

#[derive(Debug)]
struct State {
    mode: Mode,
    /// Owner timestamps, ascending (oldest first).
    owners: Vec<Ts>,
    /// Waiters, ascending by timestamp (oldest first).
    waiters: VecDeque<Arc<Waiter>>,
}

impl Default for State {
    fn default() -> Self {
        State {
            mode: Mode::Free,
            owners: Vec::new(),
            waiters: VecDeque::new(),
        }
    }
}

impl State {
    fn min_owner_ts(&self) -> Ts {
        debug_assert!(!self.owners.is_empty());
        self.owners[0]
    }

    fn add_owner(&mut self, ts: Ts, mode: Mode) {
        let pos = self.owners.partition_point(|&o| o < ts);
        self.owners.insert(pos, ts);
        self.mode = mode;
    }

    fn remove_owner(&mut self, ts: Ts) {
        let pos = self
            .owners
            .iter()
            .position(|&o| o == ts)
            .expect("releasing a wait-die lock that is not held");
        self.owners.remove(pos);
        if self.owners.is_empty() {
            self.mode = Mode::Free;
        }
    }

    fn enqueue(&mut self, waiter: Arc<Waiter>) {
        let pos = self.waiters.partition_point(|w| w.ts < waiter.ts);
        self.waiters.insert(pos, waiter);
    }

    /// Grant as many waiters as the mode allows, oldest first.
    fn promote_waiters(&mut self) {
        loop {
            let Some(front) = self.waiters.front() else {
                return;
            };
            let (ts, mode) = (front.ts, front.mode);
            let granted = match mode {
                WaitMode::Shared if self.mode != Mode::Exclusive => {
                    self.add_owner(ts, Mode::Shared);
                    true
                }
                WaitMode::Exclusive if self.owners.is_empty() => {
                    self.add_owner(ts, Mode::Exclusive);
                    true
                }
                WaitMode::Upgrade
                    if self.mode == Mode::Shared
                        && self.owners.len() == 1
                        && self.owners[0] == ts =>
                {
                    self.mode = Mode::Exclusive;
                    true
                }
                _ => false,
            };
            if !granted {
                return;
            }
            let waiter = self.waiters.pop_front().expect("front checked above");
            waiter.waiting.store(false, Ordering::Release);
        }
    }
}

/// Wait-die lock. See the module docs for the policy.
#[derive(Debug, Default)]
pub struct WaitDieLock {
    state: Mutex<State>,
}

impl WaitDieLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        WaitDieLock::default()
    }

    /// Acquire in shared mode. Returns `false` when the requester must die.
    pub fn try_lock_shared(&self, ts: Ts) -> bool {
        let mut state = self.state.lock();
        let no_waiter = state.waiters.is_empty();
        match state.mode {
            Mode::Free | Mode::Shared if no_waiter => {
                state.add_owner(ts, Mode::Shared);
                true
            }
            Mode::Free => {
                let waiter = Waiter::new(ts, WaitMode::Shared);
                state.enqueue(Arc::clone(&waiter));
                drop(state);
                Self::wait(&waiter);
                true
            }
            Mode::Shared | Mode::Exclusive => {
                if state.min_owner_ts() > ts {
                    let waiter = Waiter::new(ts, WaitMode::Shared);
                    state.enqueue(Arc::clone(&waiter));
                    drop(state);
                    Self::wait(&waiter);
                    true
                } else {
                    trace!(ts, "wait-die: shared requester dies");
                    false
                }
            }
        }
    }

    /// Acquire in exclusive mode. Returns `false` when the requester must
    /// die.
    pub fn try_lock(&self, ts: Ts) -> bool {
        let mut state = self.state.lock();
        let no_waiter = state.waiters.is_empty();
        match state.mode {
            Mode::Free if no_waiter => {
                state.add_owner(ts, Mode::Exclusive);
                true
            }
            Mode::Free => {
                let waiter = Waiter::new(ts, WaitMode::Exclusive);
                state.enqueue(Arc::clone(&waiter));
                drop(state);
                Self::wait(&waiter);
                true
            }
            Mode::Shared | Mode::Exclusive => {
                if state.min_owner_ts() > ts {
                    let waiter = Waiter::new(ts, WaitMode::Exclusive);
                    state.enqueue(Arc::clone(&waiter));
                    drop(state);
                    Self::wait(&waiter);
                    true
                } else {
                    trace!(ts, "wait-die: exclusive requester dies");
                    false
                }
            }
        }
    }

    /// Upgrade a held shared lock to exclusive. Waits when the requester is
    /// the oldest owner among several; dies otherwise. The caller must hold
    /// the lock in shared mode.
    pub fn try_lock_upgrade(&self, ts: Ts) -> bool {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Shared, "upgrade without shared lock");
        if state.mode != Mode::Shared {
            return false;
        }
        let min_ts = state.min_owner_ts();
        let num_owners = state.owners.len();
        if min_ts == ts && num_owners == 1 {
            state.mode = Mode::Exclusive;
            true
        } else if min_ts == ts {
            let waiter = Waiter::new(ts, WaitMode::Upgrade);
            state.enqueue(Arc::clone(&waiter));
            drop(state);
            Self::wait(&waiter);
            true
        } else {
            trace!(ts, "wait-die: upgrade requester dies");
            false
        }
    }

    /// Release a shared hold and promote waiters.
    pub fn unlock_shared(&self, ts: Ts) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Shared);
        state.remove_owner(ts);
        state.promote_waiters();
    }

    /// Release the exclusive hold and promote waiters.
    pub fn unlock(&self, ts: Ts) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Exclusive);
        state.remove_owner(ts);
        state.promote_waiters();
    }

    /// Demote an exclusive hold back to shared, keeping the owner slot.
    ///
    /// Used to undo a provisional next-key upgrade; other readers may become
    /// grantable.
    pub fn downgrade(&self, ts: Ts) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Exclusive);
        debug_assert_eq!(state.owners.as_slice(), &[ts]);
        state.mode = Mode::Shared;
        state.promote_waiters();
    }

    fn wait(waiter: &Waiter) {
        while waiter.waiting.load(Ordering::Acquire) {
            hint::spin_loop();
        }
    }
}
