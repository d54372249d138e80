//! Caller-owned library handle.
//!
//! Replaces process-wide init/shutdown: each [`Library`] carries its own
//! configuration and the set of node ids it has handed out, and two
//! libraries never share state.

use crate::config::LibraryConfig;
use crate::context::{NodeContext, NodeLease};
use crate::error::{NodeError, Result};
use lfcs_core::{CrdtKind, NodeId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

const fn parse_component(digits: &str) -> u32 {
    let bytes = digits.as_bytes();
    let mut value = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

const VERSION_MAJOR: u32 = parse_component(env!("CARGO_PKG_VERSION_MAJOR"));
const VERSION_MINOR: u32 = parse_component(env!("CARGO_PKG_VERSION_MINOR"));
const VERSION_PATCH: u32 = parse_component(env!("CARGO_PKG_VERSION_PATCH"));

pub struct Library {
    config: LibraryConfig,
    live: Arc<Mutex<HashSet<NodeId>>>,
}

impl Library {
    pub fn new(config: LibraryConfig) -> Result<Self> {
        config.node.validate()?;
        info!(version = Self::version(), "library initialised");
        Ok(Self {
            config,
            live: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// `(major, minor, patch)`
    pub fn version_info() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Kinds with a shipped implementation.
    pub fn supported_kinds() -> impl Iterator<Item = CrdtKind> {
        CrdtKind::ALL.into_iter().filter(CrdtKind::is_implemented)
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    /// Creates the context for `node_id`.
    ///
    /// Fails with [`NodeError::NodeInUse`] while another context for the
    /// same node is alive in this library.
    pub fn create_node(&self, node_id: NodeId) -> Result<NodeContext> {
        if !self.live.lock().insert(node_id) {
            return Err(NodeError::NodeInUse(node_id));
        }
        let lease = NodeLease {
            live: Arc::clone(&self.live),
            node_id,
        };
        // The lease drops with a failed context and frees the id.
        NodeContext::build(node_id, &self.config.node, Some(lease))
    }

    /// Node ids with a live context.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.live.lock().iter().copied().collect();
        nodes.sort_unstable();
        nodes
    }
}

impl Default for Library {
    fn default() -> Self {
        Self {
            config: LibraryConfig::default(),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        info!(live_nodes = self.live.lock().len(), "library shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(Library::version(), "0.1.0");
        assert_eq!(Library::version_info(), (0, 1, 0));
    }

    #[test]
    fn test_supported_kinds() {
        let names: Vec<&str> = Library::supported_kinds().map(|k| k.name()).collect();
        assert_eq!(
            names,
            ["G-Counter", "PN-Counter", "LWW-Register", "G-Set", "2P-Set", "OR-Set"]
        );
    }
}
