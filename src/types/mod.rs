//! Identifier aliases, sentinels and the error type shared by the
//! reconciliation modules.

use std::io;

use thiserror::Error;

/// Transaction identifier assigned by the transaction manager.
pub type TxnId = u64;

/// Commit, start or durable timestamp.
pub type Timestamp = u64;

/// Transaction id of updates that predate transactional tracking.
pub const TXN_NONE: TxnId = 0;
/// Open-ended stop transaction: no transaction has removed the value.
pub const TXN_MAX: TxnId = u64::MAX - 10;
/// Marker written into an update's transaction id when it rolls back.
pub const TXN_ABORTED: TxnId = u64::MAX;

/// Timestamp carried by non-timestamped updates.
pub const TS_NONE: Timestamp = 0;
/// Open-ended stop timestamp.
pub const TS_MAX: Timestamp = u64::MAX;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Failures surfaced to the page reconciliation driver.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The attempt should be abandoned and retried later.
    #[error("reconciliation busy: {0}")]
    Busy(&'static str),
    /// An update was not visible and the run treats that as a correctness bug.
    #[error("reconciliation error, update not visible")]
    UpdateNotVisible,
    /// Allocation failed; nothing was linked into the chain.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// An internal invariant did not hold.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    /// Options could not be parsed.
    #[error("configuration: {0}")]
    Config(String),
    /// I/O error while loading options or scenarios.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ReconcileError {
    /// Returns `true` when the caller may retry the reconciliation attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Busy(_))
    }

    /// Returns `true` when the process should halt rather than persist state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::UpdateNotVisible | ReconcileError::Invariant(_)
        )
    }
}
