//! Error types for the memory subsystem.

use thiserror::Error;

/// Errors raised by the block pool and the hazard domain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    #[error("Pool exhausted: limit of {max_blocks} blocks reached")]
    PoolExhausted { max_blocks: usize },

    #[error("Block handle is stale or does not belong to this pool")]
    InvalidBlock,

    #[error("Hazard slot {0} out of range")]
    InvalidSlot(usize),

    #[error("All {0} hazard records are in use")]
    RecordsExhausted(usize),

    #[error("Hazard guard belongs to a different domain")]
    ForeignGuard,
}

/// Result type for memory operations.
pub type Result<T> = std::result::Result<T, MemError>;
