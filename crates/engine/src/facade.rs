//! Transaction facade and retry driver
//!
//! The thin, typed wrapper workload code drives: records surface as byte
//! slices sized by the schema, outcomes as [`TxResult`]. The wrapper owns
//! the handle lifecycle — operations on a finished handle report a bug, a
//! failed commit aborts internally, and `abort` is idempotent.
//!
//! [`run_with_retry`] is the standard driver: it runs the body, commits on
//! success, gives up without retry on a user abort, and restarts the handle
//! (boosted timestamp or fresh epoch) on every system abort, keeping the
//! per-profile statistics current.

use crate::protocol::{CcTx, TxSource, TxState};
use bedrock_core::{Key, PerTxStat, TableId, TxError, TxResult};
use std::time::Instant;
use tracing::trace;

/// A typed transaction over any protocol.
pub struct Tx<'w, S: TxSource> {
    source: &'w S,
    proto: S::Tx<'w>,
    state: TxState,
}

impl<'w, S: TxSource> Tx<'w, S> {
    /// Begin a transaction on `source`.
    pub fn begin(source: &'w S) -> Self {
        Tx {
            source,
            proto: source.begin(),
            state: TxState::Active,
        }
    }

    fn record_size(&self, table: TableId) -> usize {
        self.source.schema().record_size(table)
    }

    fn check_active(&self) -> TxResult<()> {
        match self.state {
            TxState::Active => Ok(()),
            _ => Err(TxError::Bug("operation on a finished transaction")),
        }
    }

    /// Read the committed value visible to this transaction.
    pub fn get(&mut self, table: TableId, key: Key) -> TxResult<&[u8]> {
        self.check_active()?;
        let size = self.record_size(table);
        let rec = self.proto.read(table, key).map_err(TxError::Conflict)?;
        Ok(unsafe { rec.as_slice(size) })
    }

    /// Writable zero-initialized buffer for a new key.
    pub fn prepare_insert(&mut self, table: TableId, key: Key) -> TxResult<&mut [u8]> {
        self.check_active()?;
        let size = self.record_size(table);
        let rec = self.proto.insert(table, key).map_err(TxError::Conflict)?;
        Ok(unsafe { rec.as_mut_slice(size) })
    }

    /// Hook after populating an inserted record. Secondary tables are
    /// workload-maintained, so there is nothing to do beyond state checks.
    pub fn finish_insert(&mut self, _table: TableId, _key: Key) -> TxResult<()> {
        self.check_active()
    }

    /// Writable copy of the current committed value.
    pub fn prepare_update(&mut self, table: TableId, key: Key) -> TxResult<&mut [u8]> {
        self.check_active()?;
        let size = self.record_size(table);
        let rec = self.proto.update(table, key).map_err(TxError::Conflict)?;
        Ok(unsafe { rec.as_mut_slice(size) })
    }

    /// Hook after populating an updated record.
    pub fn finish_update(&mut self, _table: TableId, _key: Key) -> TxResult<()> {
        self.check_active()
    }

    /// Read-or-insert: writable buffer seeded from the committed value when
    /// the key exists, zeroed otherwise.
    pub fn prepare_upsert(&mut self, table: TableId, key: Key) -> TxResult<&mut [u8]> {
        self.check_active()?;
        let size = self.record_size(table);
        let rec = self.proto.upsert(table, key).map_err(TxError::Conflict)?;
        Ok(unsafe { rec.as_mut_slice(size) })
    }

    /// Mark `key` for deletion at commit; returns the old record.
    pub fn prepare_delete(&mut self, table: TableId, key: Key) -> TxResult<&[u8]> {
        self.check_active()?;
        let size = self.record_size(table);
        let rec = self.proto.remove(table, key).map_err(TxError::Conflict)?;
        Ok(unsafe { rec.as_slice(size) })
    }

    /// Hook after a delete.
    pub fn finish_delete(&mut self, _table: TableId, _key: Key) -> TxResult<()> {
        self.check_active()
    }

    /// Visit up to `limit` live keys of `[lkey, rkey)` (forward) or
    /// `(lkey, rkey]` (reverse) with read semantics.
    pub fn range_scan(
        &mut self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        limit: Option<usize>,
        reverse: bool,
        mut visit: impl FnMut(Key, &[u8]),
    ) -> TxResult<()> {
        self.check_active()?;
        let size = self.record_size(table);
        self.proto
            .read_scan(table, lkey, rkey, limit, reverse, &mut |key, rec| {
                visit(key, unsafe { rec.as_slice(size) })
            })
            .map_err(TxError::Conflict)
    }

    /// As [`Self::range_scan`] with update semantics: every visited buffer
    /// is a writable copy registered in the write set.
    pub fn range_update(
        &mut self,
        table: TableId,
        lkey: Key,
        rkey: Key,
        limit: Option<usize>,
        reverse: bool,
        mut apply: impl FnMut(Key, &mut [u8]),
    ) -> TxResult<()> {
        self.check_active()?;
        let size = self.record_size(table);
        self.proto
            .update_scan(table, lkey, rkey, limit, reverse, &mut |key, rec| {
                apply(key, unsafe { rec.as_mut_slice(size) })
            })
            .map_err(TxError::Conflict)
    }

    /// Validate and publish. On failure the transaction is already aborted;
    /// the caller may [`Self::restart`] and retry.
    pub fn commit(&mut self) -> TxResult<()> {
        self.check_active()?;
        match self.proto.precommit() {
            Ok(()) => {
                self.state = TxState::Committed;
                Ok(())
            }
            Err(reason) => {
                self.proto.abort();
                self.state = TxState::Aborted;
                Err(TxError::Conflict(reason))
            }
        }
    }

    /// Undo the transaction. Safe to call more than once.
    pub fn abort(&mut self) {
        if self.state == TxState::Active {
            self.proto.abort();
            self.state = TxState::Aborted;
        }
    }

    /// Re-arm an aborted handle for a retry with a refreshed serialization
    /// context.
    pub fn restart(&mut self) {
        if self.state == TxState::Active {
            self.abort();
        }
        self.proto.restart();
        self.state = TxState::Active;
    }
}

/// Run `body` until it commits or rolls back for domain reasons.
///
/// Returns `true` when the transaction committed, `false` on a user abort.
/// System aborts restart the handle and retry; a reported bug aborts the
/// transaction and returns `false` (debug builds panic first).
pub fn run_with_retry<'w, S, F>(source: &'w S, stat: &mut PerTxStat, mut body: F) -> bool
where
    S: TxSource,
    F: FnMut(&mut Tx<'w, S>) -> TxResult<()>,
{
    let mut tx = Tx::begin(source);
    loop {
        let attempt = Instant::now();
        match body(&mut tx) {
            Ok(()) => match tx.commit() {
                Ok(()) => {
                    stat.commit(attempt.elapsed().as_nanos() as u64);
                    return true;
                }
                Err(TxError::Conflict(reason)) => {
                    trace!(?reason, "commit conflict, retrying");
                    stat.sys_abort(reason);
                    tx.restart();
                }
                Err(_) => {
                    debug_assert!(false, "commit returned a non-conflict failure");
                    return false;
                }
            },
            Err(TxError::UserAbort) => {
                tx.abort();
                stat.user_abort();
                return false;
            }
            Err(TxError::Conflict(reason)) => {
                trace!(?reason, "conflict, retrying");
                stat.sys_abort(reason);
                tx.restart();
            }
            Err(TxError::Bug(msg)) => {
                debug_assert!(false, "transaction bug: {msg}");
                tx.abort();
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::silo::SiloEngine;
    use bedrock_core::{AbortReason, Schema};

    const T: TableId = 1;

    fn source() -> crate::silo::SiloWorker {
        let schema = Schema::builder().table(T, 8).freeze();
        let engine = SiloEngine::new(schema, 1);
        engine.worker(0)
    }

    #[test]
    fn test_finished_handle_reports_bug() {
        let w = source();
        let mut tx = Tx::begin(&w);
        tx.prepare_insert(T, 1)
            .unwrap()
            .copy_from_slice(&5u64.to_le_bytes());
        tx.commit().unwrap();
        assert!(matches!(tx.get(T, 1), Err(TxError::Bug(_))));
        assert!(matches!(tx.commit(), Err(TxError::Bug(_))));
    }

    #[test]
    fn test_abort_is_idempotent() {
        let w = source();
        let mut tx = Tx::begin(&w);
        let _ = tx.prepare_insert(T, 2);
        tx.abort();
        tx.abort();
        assert!(matches!(tx.get(T, 2), Err(TxError::Bug(_))));
    }

    #[test]
    fn test_run_with_retry_commits() {
        let w = source();
        let mut stat = PerTxStat::default();
        let ok = run_with_retry(&w, &mut stat, |tx| {
            tx.prepare_upsert(T, 3)?.copy_from_slice(&9u64.to_le_bytes());
            Ok(())
        });
        assert!(ok);
        assert_eq!(stat.commits, 1);
        assert_eq!(stat.sys_aborts, 0);
    }

    #[test]
    fn test_run_with_retry_user_abort_not_retried() {
        let w = source();
        let mut stat = PerTxStat::default();
        let mut attempts = 0;
        let ok = run_with_retry(&w, &mut stat, |tx| {
            attempts += 1;
            tx.prepare_upsert(T, 4)?.copy_from_slice(&1u64.to_le_bytes());
            Err(TxError::UserAbort)
        });
        assert!(!ok);
        assert_eq!(attempts, 1);
        assert_eq!(stat.user_aborts, 1);

        // Nothing the body wrote survived.
        let mut tx = Tx::begin(&w);
        assert!(matches!(
            tx.get(T, 4),
            Err(TxError::Conflict(AbortReason::NotFound))
        ));
        tx.abort();
    }

    #[test]
    fn test_run_with_retry_retries_conflicts() {
        let w = source();
        let mut stat = PerTxStat::default();
        let mut attempts = 0;
        let ok = run_with_retry(&w, &mut stat, |tx| {
            attempts += 1;
            if attempts < 3 {
                return Err(TxError::Conflict(AbortReason::LockFailed));
            }
            tx.prepare_upsert(T, 5)?.copy_from_slice(&2u64.to_le_bytes());
            Ok(())
        });
        assert!(ok);
        assert_eq!(attempts, 3);
        assert_eq!(stat.commits, 1);
        assert_eq!(stat.sys_aborts, 2);
        assert_eq!(stat.abort_reasons[AbortReason::LockFailed.index()], 2);
    }
}
