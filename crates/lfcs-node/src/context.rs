//! Per-node state: identity, local clock, pool and hazard domain.
//!
//! A [`NodeContext`] is the only place UIDs are minted. Each call to
//! [`NodeContext::gen_uid`] advances the node's own clock entry and returns
//! `(node, new entry)`, so tags from one node are strictly increasing and
//! tags from different nodes never collide.

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use lfcs_core::{
    GSet, LwwRegister, NodeId, OrSet, SetMemory, TableConfig, Timestamp, TwoPSet, Uid,
    VectorClock, MAX_NODES,
};
use lfcs_mem::{HazardDomain, HazardGuard, MemoryPool, PoolStats};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Releases a node id back to its library when the context goes away.
pub(crate) struct NodeLease {
    pub(crate) live: Arc<Mutex<HashSet<NodeId>>>,
    pub(crate) node_id: NodeId,
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.live.lock().remove(&self.node_id);
    }
}

/// One replica's identity and resources.
///
/// Mutating methods take `&mut self`: a context belongs to the thread that
/// drives its node. Other threads read the node's sets through readers and
/// guards from [`register_thread`](Self::register_thread).
pub struct NodeContext {
    node_id: NodeId,
    clock: VectorClock,
    op_count: u64,
    memory: SetMemory,
    table: TableConfig,
    _lease: Option<NodeLease>,
}

impl NodeContext {
    /// Creates a standalone context.
    pub fn new(node_id: NodeId, config: &NodeConfig) -> Result<Self> {
        Self::build(node_id, config, None)
    }

    pub(crate) fn build(
        node_id: NodeId,
        config: &NodeConfig,
        lease: Option<NodeLease>,
    ) -> Result<Self> {
        if node_id >= MAX_NODES as u64 {
            return Err(NodeError::InvalidNodeId {
                node_id,
                max: MAX_NODES,
            });
        }
        config.validate()?;

        let pool = Arc::new(MemoryPool::new(config.pool.clone())?);
        let domain = Arc::new(HazardDomain::with_config(config.hazard.clone())?);
        let clock = VectorClock::new(node_id as u32 + 1)?;
        debug!(node_id, block_size = pool.block_size(), "node context created");

        Ok(Self {
            node_id,
            clock,
            op_count: 0,
            memory: SetMemory::new(pool, domain),
            table: config.table,
            _lease: lease,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Mints a fresh UID, advancing the local clock.
    pub fn gen_uid(&mut self) -> Result<Uid> {
        let timestamp = self.clock.increment(self.node_id)?;
        self.op_count += 1;
        Ok(Uid::new(self.node_id, timestamp))
    }

    /// Advances the local clock without minting a UID.
    pub fn tick(&mut self) -> Result<Timestamp> {
        Ok(self.clock.increment(self.node_id)?)
    }

    /// Receive rule: merge `remote` into the local clock, then tick.
    pub fn merge_clock(&mut self, remote: &VectorClock) -> Result<Timestamp> {
        self.clock.merge(remote);
        let timestamp = self.tick()?;
        trace!(node_id = self.node_id, timestamp, "merged remote clock");
        Ok(timestamp)
    }

    /// The node's own clock entry
    pub fn timestamp(&self) -> Timestamp {
        self.clock.get(self.node_id)
    }

    /// UIDs minted so far
    pub fn op_count(&self) -> u64 {
        self.op_count
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.memory.pool.stats()
    }

    pub fn set_memory(&self) -> &SetMemory {
        &self.memory
    }

    pub fn table_config(&self) -> TableConfig {
        self.table
    }

    /// Registers the calling thread with the node's hazard domain.
    pub fn register_thread(&self) -> Result<HazardGuard> {
        Ok(self.memory.domain.register()?)
    }

    pub fn new_gset(&self) -> Result<GSet> {
        Ok(GSet::with_memory(self.memory.clone(), self.table)?)
    }

    pub fn new_twopset(&self) -> Result<TwoPSet> {
        Ok(TwoPSet::with_memory(self.memory.clone(), self.table)?)
    }

    pub fn new_orset(&self) -> Result<OrSet> {
        Ok(OrSet::with_memory(self.memory.clone(), self.table)?)
    }

    /// Adds `data` to `set` under a freshly minted tag.
    pub fn orset_add(&mut self, set: &mut OrSet, data: &[u8]) -> Result<Uid> {
        let tag = self.gen_uid()?;
        set.add(tag, data)?;
        Ok(tag)
    }

    /// Ticks, then writes `value` stamped with the new local timestamp.
    pub fn write_register(&mut self, register: &mut LwwRegister, value: &[u8]) -> Result<bool> {
        let timestamp = self.tick()?;
        Ok(register.set(value, timestamp, self.node_id)?)
    }
}

impl Drop for NodeContext {
    fn drop(&mut self) {
        let reclaimed = self.memory.domain.reclaim_orphans();
        debug!(node_id = self.node_id, reclaimed, "node context dropped");
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("clock", &self.clock)
            .field("op_count", &self.op_count)
            .finish()
    }
}
