//! Vector clocks for causal ordering across nodes.
//!
//! A vector clock holds one logical counter per node in a dense array of
//! [`MAX_NODES`] positions, of which the first `num_nodes` are active.
//! Positions outside the active prefix read as zero.

use crate::codec::{read_count, read_u64, WireCodec};
use crate::error::{CrdtError, Result};
use crate::uid::{NodeId, MAX_NODES};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Causal relation between two clocks (or counter states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Causality {
    HappensBefore,
    HappensAfter,
    Concurrent,
    Equal,
}

/// Dense per-node counters, shared by [`VectorClock`] and the G-Counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(into = "Vec<u64>", try_from = "Vec<u64>")]
pub(crate) struct NodeCounters {
    entries: [u64; MAX_NODES],
    active: u32,
}

impl Default for NodeCounters {
    fn default() -> Self {
        Self {
            entries: [0; MAX_NODES],
            active: 0,
        }
    }
}

/// Positions outside the active prefix count as zero, so clocks of
/// different widths are equal whenever [`NodeCounters::compare`] says so.
impl PartialEq for NodeCounters {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Causality::Equal
    }
}

impl Eq for NodeCounters {}

impl From<NodeCounters> for Vec<u64> {
    fn from(counters: NodeCounters) -> Self {
        counters.as_slice().to_vec()
    }
}

impl TryFrom<Vec<u64>> for NodeCounters {
    type Error = CrdtError;

    fn try_from(values: Vec<u64>) -> Result<Self> {
        if values.len() > MAX_NODES {
            return Err(CrdtError::InvalidArgument(format!(
                "{} entries exceed {MAX_NODES} nodes",
                values.len()
            )));
        }
        let mut counters = Self::default();
        counters.entries[..values.len()].copy_from_slice(&values);
        counters.active = values.len() as u32;
        Ok(counters)
    }
}

impl NodeCounters {
    pub(crate) fn with_active(num_nodes: u32) -> Result<Self> {
        if num_nodes as usize > MAX_NODES {
            return Err(CrdtError::Full(format!(
                "{num_nodes} nodes exceed the cluster maximum of {MAX_NODES}"
            )));
        }
        Ok(Self {
            active: num_nodes,
            ..Self::default()
        })
    }

    pub(crate) fn active(&self) -> u32 {
        self.active
    }

    pub(crate) fn as_slice(&self) -> &[u64] {
        &self.entries[..self.active as usize]
    }

    pub(crate) fn get(&self, node: NodeId) -> u64 {
        self.as_slice().get(node as usize).copied().unwrap_or(0)
    }

    /// Index of `node`, widening the active prefix to include it.
    fn slot(&mut self, node: NodeId) -> Result<usize> {
        if node >= MAX_NODES as u64 {
            return Err(CrdtError::Full(format!(
                "node {node} is beyond the cluster maximum of {MAX_NODES}"
            )));
        }
        let idx = node as usize;
        if idx >= self.active as usize {
            self.active = idx as u32 + 1;
        }
        Ok(idx)
    }

    pub(crate) fn set(&mut self, node: NodeId, value: u64) -> Result<()> {
        let idx = self.slot(node)?;
        self.entries[idx] = value;
        Ok(())
    }

    pub(crate) fn add(&mut self, node: NodeId, delta: u64) -> Result<u64> {
        let idx = self.slot(node)?;
        self.entries[idx] = self.entries[idx].saturating_add(delta);
        Ok(self.entries[idx])
    }

    pub(crate) fn merge_max(&mut self, other: &Self) {
        let n = self.active.max(other.active) as usize;
        for i in 0..n {
            self.entries[i] = self.entries[i].max(other.entries[i]);
        }
        self.active = n as u32;
    }

    pub(crate) fn min_common(&mut self, other: &Self) {
        let n = self.active.min(other.active) as usize;
        for i in 0..n {
            self.entries[i] = self.entries[i].min(other.entries[i]);
        }
    }

    pub(crate) fn compare(&self, other: &Self) -> Causality {
        let n = self.active.max(other.active) as u64;
        let mut less = false;
        let mut greater = false;
        for i in 0..n {
            let (a, b) = (self.get(i), other.get(i));
            less |= a < b;
            greater |= a > b;
        }
        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::HappensBefore,
            (false, true) => Causality::HappensAfter,
            (true, true) => Causality::Concurrent,
        }
    }

    pub(crate) fn sum(&self) -> u64 {
        self.as_slice().iter().fold(0u64, |acc, &v| acc.saturating_add(v))
    }

    pub(crate) fn encoded_len(&self) -> usize {
        4 + 8 * self.active as usize
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.active);
        for &v in self.as_slice() {
            buf.put_u64_le(v);
        }
    }

    pub(crate) fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let n = read_count(buf, MAX_NODES, 8, "node count")?;
        let mut counters = Self::default();
        for i in 0..n {
            counters.entries[i] = read_u64(buf, "node entry")?;
        }
        counters.active = n as u32;
        Ok(counters)
    }
}

/// Which entries [`VectorClock::prune`] may drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunePolicy {
    /// Acknowledged value an entry must reach cluster-wide before it qualifies.
    pub threshold: u64,
    /// Shrink `num_nodes` past trailing zero entries afterwards.
    pub shrink: bool,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            threshold: 1,
            shrink: true,
        }
    }
}

/// A fixed-capacity vector clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: NodeCounters,
}

impl VectorClock {
    /// A zeroed clock with `num_nodes` active positions.
    pub fn new(num_nodes: u32) -> Result<Self> {
        Ok(Self {
            entries: NodeCounters::with_active(num_nodes)?,
        })
    }

    /// Builds a clock whose active prefix is `values`.
    pub fn from_entries(values: impl IntoIterator<Item = u64>) -> Result<Self> {
        let values: Vec<u64> = values.into_iter().collect();
        Ok(Self {
            entries: NodeCounters::try_from(values)?,
        })
    }

    pub fn num_nodes(&self) -> u32 {
        self.entries.active()
    }

    /// Active entries in node-id order.
    pub fn entries(&self) -> &[u64] {
        self.entries.as_slice()
    }

    pub fn get(&self, node: NodeId) -> u64 {
        self.entries.get(node)
    }

    pub fn set(&mut self, node: NodeId, value: u64) -> Result<()> {
        self.entries.set(node, value)
    }

    /// Records one local event on `node` and returns its new counter.
    ///
    /// Only the owning node may increment its own position.
    pub fn increment(&mut self, node: NodeId) -> Result<u64> {
        self.entries.add(node, 1)
    }

    /// Pointwise maximum; widens the active prefix to cover `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        self.entries.merge_max(&other.entries);
    }

    pub fn merged_with(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    pub fn compare(&self, other: &VectorClock) -> Causality {
        self.entries.compare(&other.entries)
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == Causality::HappensBefore
    }

    pub fn concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == Causality::Concurrent
    }

    /// True if every entry of `self` is at least the matching entry of `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            Causality::HappensAfter | Causality::Equal
        )
    }

    /// Whether every active entry is zero.
    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|&v| v == 0)
    }

    /// Total events recorded across all nodes.
    pub fn sum(&self) -> u64 {
        self.entries.sum()
    }

    /// Pointwise minimum over the positions active in both clocks.
    pub fn min_with(&mut self, other: &VectorClock) {
        self.entries.min_common(&other.entries);
    }

    /// Pointwise minimum over many clocks: the point every one of them has reached.
    pub fn stable_frontier<'a>(clocks: impl IntoIterator<Item = &'a VectorClock>) -> Option<Self> {
        let mut iter = clocks.into_iter();
        let mut frontier = iter.next()?.clone();
        for clock in iter {
            frontier.min_with(clock);
        }
        Some(frontier)
    }

    /// Drops entries the whole cluster has acknowledged.
    ///
    /// An entry qualifies when `stable` records at least `policy.threshold`
    /// events for that node and this clock knows of nothing beyond
    /// `stable`. Qualifying entries are zeroed. Returns the number zeroed.
    pub fn prune(&mut self, stable: &VectorClock, policy: PrunePolicy) -> usize {
        let mut pruned = 0;
        for node in 0..self.num_nodes() as u64 {
            let own = self.get(node);
            let acked = stable.get(node);
            if own != 0 && acked >= policy.threshold && own <= acked {
                // Cannot fail: node is inside the active prefix.
                let _ = self.entries.set(node, 0);
                pruned += 1;
            }
        }

        if policy.shrink {
            let keep = self.entries().iter().rposition(|&v| v != 0).map_or(0, |i| i + 1);
            self.entries.active = keep as u32;
        }

        if pruned > 0 {
            debug!(pruned, num_nodes = self.num_nodes(), "vector clock pruned");
        }
        pruned
    }
}

impl WireCodec for VectorClock {
    fn serialized_size(&self) -> usize {
        self.entries.encoded_len()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.entries.encode(buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            entries: NodeCounters::decode(buf)?,
        })
    }
}
