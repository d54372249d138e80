//! Last-Write-Wins (LWW) Register CRDT
//!
//! The register holds one byte value tagged with the [`Uid`] of the write
//! that produced it. A write or merge replaces the value only when its uid
//! is strictly greater: timestamps first, node ids breaking ties. Arrival
//! order never matters, at the price of dropping one of two truly
//! concurrent writes.

use crate::codec::{ensure_remaining, read_u64, WireCodec};
use crate::error::{CrdtError, Result};
use crate::lattice::{CrdtKind, Lattice};
use crate::uid::{NodeId, Timestamp, Uid};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Largest value a register accepts, in bytes.
pub const LWW_MAX_VALUE_SIZE: usize = 256;

/// A Last-Write-Wins Register over byte values
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LwwRegister {
    value: Vec<u8>,
    timestamp: Timestamp,
    node_id: NodeId,
}

impl LwwRegister {
    /// An empty register at uid (0, 0)
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `value` if `(timestamp, node)` beats the current uid.
    ///
    /// Returns whether the write was applied. Values longer than
    /// [`LWW_MAX_VALUE_SIZE`] fail with [`CrdtError::Full`].
    pub fn set(&mut self, value: &[u8], timestamp: Timestamp, node: NodeId) -> Result<bool> {
        if value.len() > LWW_MAX_VALUE_SIZE {
            return Err(CrdtError::Full(format!(
                "value of {} bytes exceeds {LWW_MAX_VALUE_SIZE}",
                value.len()
            )));
        }
        if Uid::new(node, timestamp) <= self.uid() {
            return Ok(false);
        }
        self.value.clear();
        self.value.extend_from_slice(value);
        self.timestamp = timestamp;
        self.node_id = node;
        Ok(true)
    }

    /// The current value, or `None` when the register is empty
    pub fn get(&self) -> Option<&[u8]> {
        self.has_value().then_some(self.value.as_slice())
    }

    pub fn has_value(&self) -> bool {
        !self.value.is_empty()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Uid of the write currently held
    pub fn uid(&self) -> Uid {
        Uid::new(self.node_id, self.timestamp)
    }

    /// Stores a `u64` as 8 little-endian bytes
    pub fn set_u64(&mut self, value: u64, timestamp: Timestamp, node: NodeId) -> Result<bool> {
        self.set(&value.to_le_bytes(), timestamp, node)
    }

    /// Reads the value back as a `u64`, if it is exactly 8 bytes
    pub fn get_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.value.as_slice().try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    pub fn set_str(&mut self, value: &str, timestamp: Timestamp, node: NodeId) -> Result<bool> {
        self.set(value.as_bytes(), timestamp, node)
    }

    /// Reads the value back as UTF-8
    pub fn get_str(&self) -> Option<&str> {
        std::str::from_utf8(self.get()?).ok()
    }
}

impl Lattice for LwwRegister {
    const KIND: CrdtKind = CrdtKind::LwwRegister;

    /// Keep the state with the highest uid. Identical uids carrying
    /// different bytes fall back to comparing the bytes for determinism.
    fn merge(&mut self, other: &Self) -> Result<()> {
        let other_wins = match other.uid().cmp(&self.uid()) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => other.value > self.value,
        };
        if other_wins {
            self.clone_from(other);
        }
        Ok(())
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(self.clone())
    }
}

impl WireCodec for LwwRegister {
    fn serialized_size(&self) -> usize {
        8 + 8 + 8 + self.value.len()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.timestamp);
        buf.put_u64_le(self.node_id);
        buf.put_u64_le(self.value.len() as u64);
        buf.put_slice(&self.value);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let timestamp = read_u64(buf, "timestamp")?;
        let node_id = read_u64(buf, "node id")?;
        let size = read_u64(buf, "value size")?;
        if size > LWW_MAX_VALUE_SIZE as u64 {
            return Err(CrdtError::malformed(format!(
                "value size {size} exceeds {LWW_MAX_VALUE_SIZE}"
            )));
        }
        ensure_remaining(buf, size as usize, "value")?;
        let mut value = vec![0u8; size as usize];
        buf.copy_to_slice(&mut value);
        Ok(Self {
            value,
            timestamp,
            node_id,
        })
    }
}
