//! Transaction error types.

use thiserror::Error;

use crate::session::{EntityId, SessionError, Version};
use crate::transaction::lock::LockMode;
use crate::transaction::registry::ContextId;
use crate::transaction::state::{TxId, TxStatus};

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Session layer error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Commit attempted on a transaction marked rollback-only.
    ///
    /// The transaction has been rolled back by the time this is returned.
    #[error("transaction {tx_id} was marked rollback-only and has been rolled back")]
    RollbackOnly { tx_id: TxId },

    /// Pessimistic lock not granted within the wait bound.
    #[error("timed out after {waited_ms}ms waiting for {mode} lock on {target}")]
    LockTimeout {
        target: EntityId,
        mode: LockMode,
        waited_ms: u64,
    },

    /// Version captured by an optimistic lock no longer matches the store.
    #[error("optimistic lock failure on {target}: locked at version {expected}, store has {found}")]
    OptimisticLockFailure {
        target: EntityId,
        expected: Version,
        found: Version,
    },

    /// Requested propagation or isolation cannot be honoured by the current
    /// transaction.
    #[error("propagation conflict: {0}")]
    PropagationConflict(String),

    /// Operation not allowed in the transaction's current state.
    #[error("transaction {tx_id} is {state}: {reason}")]
    InvalidState {
        tx_id: TxId,
        state: TxStatus,
        reason: String,
    },

    /// An operation needed a bound transaction and the context has none.
    #[error("no transaction bound to {0}")]
    NoTransaction(ContextId),
}

impl TransactionError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::LockTimeout { .. }
            | TransactionError::OptimisticLockFailure { .. } => true,
            TransactionError::Session(e) => e.is_stale(),
            _ => false,
        }
    }

    pub(crate) fn invalid_state(tx_id: TxId, state: TxStatus, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            tx_id,
            state,
            reason: reason.into(),
        }
    }
}
