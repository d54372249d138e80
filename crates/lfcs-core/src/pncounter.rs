//! PN-Counter (Positive-Negative Counter) CRDT
//!
//! A PN-Counter supports both increment and decrement operations by maintaining
//! two separate G-Counters: one for increments (P) and one for decrements (N).
//! The value is P - N, computed on demand and never stored.

use crate::codec::WireCodec;
use crate::error::Result;
use crate::gcounter::GCounter;
use crate::lattice::{CrdtKind, Lattice};
use crate::uid::NodeId;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// A Positive-Negative Counter CRDT
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    positive: GCounter,
    negative: GCounter,
}

impl PnCounter {
    pub fn new(num_nodes: u32) -> Result<Self> {
        Ok(Self {
            positive: GCounter::new(num_nodes)?,
            negative: GCounter::new(num_nodes)?,
        })
    }

    pub fn increment(&mut self, node: NodeId) -> Result<()> {
        self.positive.increment(node)
    }

    pub fn decrement(&mut self, node: NodeId) -> Result<()> {
        self.negative.increment(node)
    }

    /// Apply a signed delta on behalf of `node`
    pub fn add(&mut self, node: NodeId, delta: i64) -> Result<()> {
        if delta >= 0 {
            self.positive.add(node, delta as u64)
        } else {
            self.negative.add(node, delta.unsigned_abs())
        }
    }

    /// Current value: sum(P) - sum(N), clamped to the i64 range
    pub fn value(&self) -> i64 {
        let diff = self.positive.value() as i128 - self.negative.value() as i128;
        diff.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn positive(&self) -> &GCounter {
        &self.positive
    }

    pub fn negative(&self) -> &GCounter {
        &self.negative
    }
}

impl Lattice for PnCounter {
    const KIND: CrdtKind = CrdtKind::PnCounter;

    /// Merges both sides independently
    fn merge(&mut self, other: &Self) -> Result<()> {
        self.positive.merge(&other.positive)?;
        self.negative.merge(&other.negative)
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(self.clone())
    }
}

impl WireCodec for PnCounter {
    fn serialized_size(&self) -> usize {
        self.positive.serialized_size() + self.negative.serialized_size()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.positive.encode(buf);
        self.negative.encode(buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let positive = GCounter::decode(buf)?;
        let negative = GCounter::decode(buf)?;
        Ok(Self { positive, negative })
    }
}
