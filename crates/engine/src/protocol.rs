//! The protocol contract
//!
//! [`CcTx`] is the one read/write-set surface every protocol implements;
//! the facade and the workload depend only on it. Operations return raw
//! record pointers (the facade turns them into byte slices using the
//! schema's record sizes) or the [`AbortReason`] that classifies the
//! failure for the retry driver's histogram.
//!
//! [`TxSource`] is implemented by the per-protocol worker handles: it
//! begins raw transactions and exposes the schema.

use bedrock_core::{AbortReason, Key, RecordPtr, Schema, TableId};
use std::sync::Arc;

/// Lifecycle of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    Active,
    Committed,
    Aborted,
}

/// Result of a single record operation.
pub type OpResult = Result<RecordPtr, AbortReason>;

/// Per-transaction protocol operations.
///
/// All methods are local to the owning worker thread. No shared memory is
/// mutated before [`CcTx::precommit`]; failed operations leave the shared
/// structures untouched (aside from protocol-sanctioned housekeeping such
/// as lock acquisition or version-chain trimming).
pub trait CcTx {
    /// Committed value visible to this transaction, or the local write.
    fn read(&mut self, table: TableId, key: Key) -> OpResult;

    /// Writable zero-initialized buffer for a key that must be absent.
    fn insert(&mut self, table: TableId, key: Key) -> OpResult;

    /// Writable copy of the current committed value.
    fn update(&mut self, table: TableId, key: Key) -> OpResult;

    /// Read-or-insert: update when present, insert when absent, with
    /// deleted-version reuse under multi-version protocols.
    fn upsert(&mut self, table: TableId, key: Key) -> OpResult;

    /// Record the intent to delete at commit; returns the old record.
    fn remove(&mut self, table: TableId, key: Key) -> OpResult;

    /// Visit up to `limit` live keys in `[lkey, rkey)` (forward) or
    /// `(lkey, rkey]` (reverse), with per-key semantics equivalent to
    /// [`CcTx::read`].
    fn read_scan(
        &mut self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        limit: Option<usize>,
        reverse: bool,
        visit: &mut dyn FnMut(Key, RecordPtr),
    ) -> Result<(), AbortReason>;

    /// As [`CcTx::read_scan`] with per-key semantics of [`CcTx::update`];
    /// visited buffers are writable copies registered in the write set.
    fn update_scan(
        &mut self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        limit: Option<usize>,
        reverse: bool,
        visit: &mut dyn FnMut(Key, RecordPtr),
    ) -> Result<(), AbortReason>;

    /// Validation and publication. On `Ok` every write is visible; on
    /// `Err` nothing was published and the caller must abort.
    fn precommit(&mut self) -> Result<(), AbortReason>;

    /// Undo local state: withdraw never-published cells from the index,
    /// free local buffers, release all locks. Idempotent.
    fn abort(&mut self);

    /// Refresh the serialization context after an abort, before the retry:
    /// a boosted start timestamp or a re-read global epoch.
    fn restart(&mut self);
}

/// Hands out transactions; implemented by the per-protocol workers.
pub trait TxSource {
    /// The protocol transaction type.
    type Tx<'a>: CcTx
    where
        Self: 'a;

    /// Begin a transaction on this worker.
    fn begin(&self) -> Self::Tx<'_>;

    /// The table catalog.
    fn schema(&self) -> &Arc<Schema>;
}
