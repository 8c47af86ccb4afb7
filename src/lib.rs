//! Bedrock: an in-memory OLTP engine with pluggable concurrency control
//!
//! Four interchangeable protocols — optimistic epoch-committed (Silo
//! lineage), multi-version timestamp ordering, no-wait 2PL, and wait-die
//! 2PL — share one read/write-set contract over an ordered, leaf-versioned
//! index. Workload code registers a schema, picks an engine, hands each
//! thread a worker, and drives transactions through the typed facade:
//!
//! ```
//! use bedrock::{run_with_retry, SiloEngine, Tx};
//! use bedrock_core::{PerTxStat, Schema};
//!
//! let schema = Schema::builder().table(1, 8).freeze();
//! let engine = SiloEngine::new(schema, 1);
//! let worker = engine.worker(0);
//!
//! let mut stat = PerTxStat::default();
//! let committed = run_with_retry(&worker, &mut stat, |tx| {
//!     tx.prepare_upsert(1, 42)?.copy_from_slice(&7u64.to_le_bytes());
//!     Ok(())
//! });
//! assert!(committed);
//!
//! let mut tx = Tx::begin(&worker);
//! assert_eq!(tx.get(1, 42).unwrap(), &7u64.to_le_bytes());
//! tx.commit().unwrap();
//! ```

pub use bedrock_core as core;
pub use bedrock_engine as engine;
pub use bedrock_index as index;
pub use bedrock_runtime as runtime;
pub use bedrock_sync as sync;

pub use bedrock_core::{AbortReason, Key, PerTxStat, Schema, Stat, TableId, TxError, TxResult};
pub use bedrock_engine::{
    run_with_retry, CcTx, MvtoEngine, NoWaitEngine, SiloEngine, Tx, TxSource, WaitDieEngine,
};
pub use bedrock_runtime::{EpochManager, TimestampManager};
