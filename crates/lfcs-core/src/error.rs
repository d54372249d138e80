//! Error types for CRDT operations.

use lfcs_mem::MemError;
use thiserror::Error;

/// Errors that can occur in CRDT and vector-clock operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Element not found")]
    NotFound,

    #[error("Element already exists")]
    AlreadyExists,

    #[error("Capacity exceeded: {0}")]
    Full(String),

    #[error("Container is empty")]
    Empty,

    #[error("Operation timed out")]
    Timeout,

    #[error("Concurrent modification detected")]
    ConcurrentModification,

    #[error("Causal dependency not satisfied")]
    CausalDependency,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CrdtError {
    /// Stable numeric code for this error. Success is 0 and never an error.
    pub fn code(&self) -> i32 {
        match self {
            CrdtError::OutOfMemory => -1,
            CrdtError::InvalidArgument(_) => -2,
            CrdtError::NotFound => -3,
            CrdtError::AlreadyExists => -4,
            CrdtError::Full(_) => -5,
            CrdtError::Empty => -6,
            CrdtError::Timeout => -7,
            CrdtError::ConcurrentModification => -8,
            CrdtError::CausalDependency => -9,
            CrdtError::Network(_) => -10,
            CrdtError::Internal(_) => -11,
        }
    }

    pub(crate) fn malformed(what: impl std::fmt::Display) -> Self {
        CrdtError::InvalidArgument(format!("malformed input: {what}"))
    }
}

impl From<MemError> for CrdtError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfMemory { .. } => CrdtError::OutOfMemory,
            MemError::PoolExhausted { .. } | MemError::RecordsExhausted(_) => {
                CrdtError::Full(err.to_string())
            }
            MemError::InvalidConfig(_)
            | MemError::InvalidSlot(_)
            | MemError::ForeignGuard => CrdtError::InvalidArgument(err.to_string()),
            MemError::InvalidBlock => CrdtError::Internal(err.to_string()),
        }
    }
}

/// Result type for CRDT operations.
pub type Result<T> = std::result::Result<T, CrdtError>;
