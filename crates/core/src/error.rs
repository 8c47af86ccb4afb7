//! Transaction error model
//!
//! Every failure is a value; no panics cross component boundaries in release
//! builds. The protocol layer reports impossible operations as `None`; the
//! facade maps those into [`TxError::Conflict`] carrying an [`AbortReason`],
//! which the retry driver treats as a system abort. A user abort is a
//! legitimate domain rollback and is never retried. `Bug` is reserved for
//! contract violations (e.g. operating on a finished handle).

use thiserror::Error;

/// Result alias for facade operations.
pub type TxResult<T> = std::result::Result<T, TxError>;

/// Why a transaction could not proceed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Concurrency conflict: abort and let the retry driver restart.
    #[error("transaction conflict: {0}")]
    Conflict(AbortReason),

    /// Domain-level rollback requested by the workload; do not retry.
    #[error("user-requested rollback")]
    UserAbort,

    /// Contract violation, reachable only through misuse of the API.
    #[error("contract violation: {0}")]
    Bug(&'static str),
}

impl TxError {
    /// Whether the retry driver should restart the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::Conflict(_))
    }
}

/// Classified cause of a system abort. Doubles as the index into the
/// per-worker abort histogram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Key absent (or invisible) where presence was required.
    #[error("key not found")]
    NotFound,
    /// Key present where absence was required.
    #[error("key already present")]
    AlreadyPresent,
    /// A lock could not be acquired under the protocol's policy.
    #[error("lock acquisition failed")]
    LockFailed,
    /// A captured tidword no longer matches the shared cell.
    #[error("read validation failed")]
    ReadValidation,
    /// An observed index leaf changed (phantom window).
    #[error("node validation failed")]
    NodeValidation,
    /// A timestamp-ordered visibility check failed.
    #[error("timestamp order violated")]
    TsOrder,
    /// The cell was found detached from the index.
    #[error("cell detached")]
    Detached,
    /// The successor needed for next-key locking was unavailable.
    #[error("next-key lock unavailable")]
    NextKey,
    /// Commit-time validation failed.
    #[error("commit validation failed")]
    Validation,
}

/// Number of abort-reason histogram buckets.
pub const ABORT_REASONS: usize = 9;

impl AbortReason {
    /// Histogram bucket for this reason.
    pub fn index(self) -> usize {
        match self {
            AbortReason::NotFound => 0,
            AbortReason::AlreadyPresent => 1,
            AbortReason::LockFailed => 2,
            AbortReason::ReadValidation => 3,
            AbortReason::NodeValidation => 4,
            AbortReason::TsOrder => 5,
            AbortReason::Detached => 6,
            AbortReason::NextKey => 7,
            AbortReason::Validation => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(TxError::Conflict(AbortReason::LockFailed).is_retryable());
        assert!(!TxError::UserAbort.is_retryable());
        assert!(!TxError::Bug("double commit").is_retryable());
    }

    #[test]
    fn test_reason_indexes_are_distinct() {
        let reasons = [
            AbortReason::NotFound,
            AbortReason::AlreadyPresent,
            AbortReason::LockFailed,
            AbortReason::ReadValidation,
            AbortReason::NodeValidation,
            AbortReason::TsOrder,
            AbortReason::Detached,
            AbortReason::NextKey,
            AbortReason::Validation,
        ];
        let mut seen = [false; ABORT_REASONS];
        for r in reasons {
            assert!(!seen[r.index()]);
            seen[r.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
