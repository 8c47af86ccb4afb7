//! Runtime services for the Bedrock engine
//!
//! - Epoch management: a global epoch advanced only when every worker has
//!   published the current value; the reclamation barrier for the
//!   epoch-based protocols.
//! - Timestamp management: per-worker commit counters with smallest/largest
//!   watermark publication for the timestamp-ordered protocols.
//! - Garbage collection: thread-local deferred-free queues keyed by epoch or
//!   timestamp.
//! - Record caches: per-thread freelists of record-sized buffers.

#![warn(clippy::all)]

pub mod cache;
pub mod epoch;
pub mod gc;
pub mod timestamp;

pub use cache::RecordCache;
pub use epoch::{EpochManager, EpochWorker};
pub use gc::{Garbage, GcQueue};
pub use timestamp::{TimestampManager, TsWorker};
