//! Error types for the Peergrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// The precondition variants (`MissingNode`, `MissingService`, `MissingCheck`,
/// `CheckCritical`) reject a command without mutating anything; the remaining
/// variants wrap faults from the embedded engine, after which the state
/// machine can no longer be assumed to match the consensus log.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state environment: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Txn(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid index key: {0}")]
    IndexKey(String),

    #[error("write attempted on a read-only transaction")]
    ReadOnlyTxn,

    #[error("missing node registration: {0}")]
    MissingNode(String),

    #[error("missing service registration: {0}")]
    MissingService(String),

    #[error("missing check '{0}' registration")]
    MissingCheck(String),

    #[error("check '{0}' is in {1} state")]
    CheckCritical(String, String),
}

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;
