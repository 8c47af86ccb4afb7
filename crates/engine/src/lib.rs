//! Concurrency-control protocol engines
//!
//! Four interchangeable protocols over the shared read/write-set contract:
//!
//! - [`silo`]: optimistic, epoch-committed (tidword validation)
//! - [`mvto`]: multi-version timestamp ordering (version chains)
//! - [`nowait`]: strict 2PL, failing lock requests abort immediately
//! - [`waitdie`]: strict 2PL with the wait-die policy
//!
//! Workload code drives any of them through the [`facade`]: a typed
//! transaction wrapper plus the retry driver. The [`protocol`] traits are
//! the seam: an engine hands out worker handles, a worker begins raw
//! transactions, and the facade turns raw record pointers into byte slices
//! and abort reasons into statuses.

#![warn(clippy::all)]

pub mod facade;
pub mod mvto;
pub mod nowait;
pub mod protocol;
pub mod rwset;
pub mod silo;
pub mod tidword;
pub mod waitdie;

pub use facade::{run_with_retry, Tx};
pub use mvto::{MvtoEngine, MvtoTx, MvtoWorker};
pub use nowait::{NoWaitEngine, NoWaitTx, NoWaitWorker};
pub use protocol::{CcTx, TxSource};
pub use silo::{SiloEngine, SiloTx, SiloWorker};
pub use tidword::TidWord;
pub use waitdie::{WaitDieEngine, WaitDieTx, WaitDieWorker};
