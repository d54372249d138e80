//! G-Counter (Grow-only Counter) CRDT
//!
//! Each node owns one slot of a dense counter array and only ever raises
//! its own slot. The value is the sum of all slots; the join takes the
//! component-wise max, never the sum, so re-delivered states are harmless.

use crate::codec::WireCodec;
use crate::error::Result;
use crate::lattice::{CrdtKind, Lattice};
use crate::uid::NodeId;
use crate::vclock::{Causality, NodeCounters};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// A grow-only counter over at most [`MAX_NODES`](crate::MAX_NODES) nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    counts: NodeCounters,
}

impl GCounter {
    /// Create a counter with `num_nodes` active slots, all zero
    pub fn new(num_nodes: u32) -> Result<Self> {
        Ok(Self {
            counts: NodeCounters::with_active(num_nodes)?,
        })
    }

    /// Increment the slot of `node` by one
    pub fn increment(&mut self, node: NodeId) -> Result<()> {
        self.add(node, 1)
    }

    /// Increment the slot of `node` by `delta` (saturating)
    pub fn add(&mut self, node: NodeId, delta: u64) -> Result<()> {
        self.counts.add(node, delta)?;
        Ok(())
    }

    /// Sum of all slots
    pub fn value(&self) -> u64 {
        self.counts.sum()
    }

    /// Count contributed by one node
    pub fn get(&self, node: NodeId) -> u64 {
        self.counts.get(node)
    }

    pub fn num_nodes(&self) -> u32 {
        self.counts.active()
    }

    /// Per-node slots in node-id order
    pub fn counts(&self) -> &[u64] {
        self.counts.as_slice()
    }

    /// Causal relation of the two states, slot by slot
    pub fn compare(&self, other: &Self) -> Causality {
        self.counts.compare(&other.counts)
    }
}

impl Lattice for GCounter {
    const KIND: CrdtKind = CrdtKind::GCounter;

    fn merge(&mut self, other: &Self) -> Result<()> {
        self.counts.merge_max(&other.counts);
        Ok(())
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(self.clone())
    }
}

impl WireCodec for GCounter {
    fn serialized_size(&self) -> usize {
        self.counts.encoded_len()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.counts.encode(buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            counts: NodeCounters::decode(buf)?,
        })
    }
}
