//! Transaction state.

use crate::error::{CoreError, CoreResult};

/// State of a transaction.
///
/// ```text
/// Started -> Committing -> Committed
///         \-> Aborting  -> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Mutations are being logged and applied.
    Started,
    /// Dirty ranges are being persisted; the lane is still active.
    Committing,
    /// The lane was cleared; the transaction is durable.
    Committed,
    /// Undo entries are being applied.
    Aborting,
    /// Every logged range was restored.
    Aborted,
}

impl TransactionState {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Fails unless the transaction still accepts mutations.
    pub(crate) fn ensure_started(self) -> CoreResult<()> {
        match self {
            Self::Started => Ok(()),
            other => Err(CoreError::transaction_failed(format!(
                "transaction is {other:?}, not started"
            ))),
        }
    }
}

/// Points where a test can simulate process death inside a transaction.
///
/// When the armed point is reached the transaction stops without rolling
/// back, the pool is poisoned, and the caller gets `TransactionFailed`. The
/// persistent state is exactly what a crash at that point would leave, and
/// the next open runs recovery over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// All mutations applied, nothing persisted by commit yet.
    BeforeCommit,
    /// Dirty ranges persisted, lane still active.
    DuringCommit,
    /// Lane cleared, commit hooks and frees not yet run.
    AfterCommit,
}
