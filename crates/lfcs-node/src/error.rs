//! Error types for node contexts and the library handle.

use lfcs_core::{CrdtError, NodeId};
use lfcs_mem::MemError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Node id {node_id} is outside the cluster range 0..{max}")]
    InvalidNodeId { node_id: NodeId, max: usize },

    #[error("Node {0} already has a live context in this library")]
    NodeInUse(NodeId),

    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),

    #[error("Memory error: {0}")]
    Mem(#[from] MemError),
}

impl NodeError {
    /// Stable negative code in the CRDT error taxonomy.
    pub fn code(&self) -> i32 {
        match self {
            NodeError::InvalidNodeId { .. } => CrdtError::InvalidArgument(String::new()).code(),
            NodeError::NodeInUse(_) => CrdtError::AlreadyExists.code(),
            NodeError::Crdt(err) => err.code(),
            NodeError::Mem(err) => CrdtError::from(err.clone()).code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
