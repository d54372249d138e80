//! Unique operation identifiers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of a replica within a cluster.
pub type NodeId = u64;

/// Per-node logical timestamp. Monotonic on each node.
pub type Timestamp = u64;

/// Largest cluster a vector clock or G-Counter can describe.
pub const MAX_NODES: usize = 64;

/// A `(node, timestamp)` pair naming exactly one operation.
///
/// Ordered by timestamp first and node id second, so equal timestamps from
/// different nodes still compare deterministically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid {
    pub node_id: NodeId,
    pub timestamp: Timestamp,
}

impl Uid {
    pub const fn new(node_id: NodeId, timestamp: Timestamp) -> Self {
        Self { node_id, timestamp }
    }
}

impl Ord for Uid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Uid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.node_id)
    }
}
