//! Lock primitives for the Bedrock engine
//!
//! Two primitives:
//! - [`SpinRwLock`]: a reader-writer spinlock over a signed counter, with an
//!   upgrade path for a sole reader. Used as the per-cell lock by the no-wait
//!   protocol and as the short chain lock by the multi-version protocol.
//! - [`WaitDieLock`]: a timestamp-ordered lock implementing the wait-die
//!   policy: older requesters queue and sleep, younger requesters fail.
//!
//! Neither primitive promises fairness beyond what its policy states.

#![warn(clippy::all)]

mod rwlock;
mod waitdie;

pub use rwlock::SpinRwLock;
pub use waitdie::WaitDieLock;
