//! Core types for the Bedrock transaction engine
//!
//! This crate defines the foundational vocabulary shared by every layer:
//! - Table ids, keys, epochs, timestamps and transaction ids
//! - Raw record buffers (opaque fixed-size byte records)
//! - The write-once schema catalog
//! - The transaction error model (conflict / user abort / bug)
//! - Per-worker statistics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod record;
pub mod schema;
pub mod stats;
pub mod types;

pub use error::{AbortReason, TxError, TxResult};
pub use record::{alloc_record, RecordPtr};
pub use schema::{Schema, SchemaBuilder, TableInfo};
pub use stats::{PerTxStat, Stat};
pub use types::{Epoch, Key, TableId, Ts, TxId, WorkerId};
