//! Two-Phase Set (2P-Set) CRDT
//!
//! A pair of G-Sets: `added` and `removed`. An element is present when it
//! was added and never removed. Removal is permanent: once an element's
//! bytes are tombstoned, adding the same bytes again is silently ignored.

use crate::codec::WireCodec;
use crate::error::{CrdtError, Result};
use crate::gset::{check_element, GSet, GSetReader};
use crate::lattice::{CrdtKind, Lattice};
use crate::table::{SetMemory, TableConfig};
use bytes::{Buf, BufMut, Bytes};
use lfcs_mem::HazardGuard;
use std::fmt;

/// A Two-Phase Set CRDT over byte strings
pub struct TwoPSet {
    added: GSet,
    removed: GSet,
}

impl TwoPSet {
    /// Create an empty set with its own private memory
    pub fn new() -> Result<Self> {
        let added = GSet::new()?;
        let removed = GSet::with_memory(added.memory().clone(), TableConfig::default())?;
        Ok(Self { added, removed })
    }

    /// Create an empty set whose two halves allocate from `memory`
    pub fn with_memory(memory: SetMemory, config: TableConfig) -> Result<Self> {
        Ok(Self {
            added: GSet::with_memory(memory.clone(), config)?,
            removed: GSet::with_memory(memory, config)?,
        })
    }

    /// Add an element. A no-op if the element is already tombstoned.
    pub fn add(&mut self, data: &[u8]) -> Result<()> {
        check_element(data)?;
        if self.removed.contains(data) {
            return Ok(());
        }
        self.added.add(data)
    }

    /// Tombstone an element. Fails with [`CrdtError::NotFound`] if it was
    /// never added.
    pub fn remove(&mut self, data: &[u8]) -> Result<()> {
        check_element(data)?;
        if !self.added.contains(data) {
            return Err(CrdtError::NotFound);
        }
        self.removed.add(data)
    }

    pub fn add_str(&mut self, data: &str) -> Result<()> {
        self.add(data.as_bytes())
    }

    pub fn remove_str(&mut self, data: &str) -> Result<()> {
        self.remove(data.as_bytes())
    }

    /// Present: added and not removed
    pub fn contains(&self, data: &[u8]) -> bool {
        self.added.contains(data) && !self.removed.contains(data)
    }

    pub fn contains_str(&self, data: &str) -> bool {
        self.contains(data.as_bytes())
    }

    pub fn was_added(&self, data: &[u8]) -> bool {
        self.added.contains(data)
    }

    pub fn was_removed(&self, data: &[u8]) -> bool {
        self.removed.contains(data)
    }

    /// Live elements, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.added.iter().filter(|e| !self.removed.contains(e))
    }

    /// Number of live elements
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn added(&self) -> &GSet {
        &self.added
    }

    pub fn removed(&self) -> &GSet {
        &self.removed
    }

    pub fn reader(&self) -> TwoPSetReader {
        TwoPSetReader {
            added: self.added.reader(),
            removed: self.removed.reader(),
        }
    }

    pub fn memory(&self) -> &SetMemory {
        self.added.memory()
    }

    pub fn reclaim(&mut self) -> usize {
        self.added.reclaim() + self.removed.reclaim()
    }

    /// Decode a snapshot into a set allocating from `memory`
    pub fn decode_in<B: Buf>(memory: SetMemory, config: TableConfig, buf: &mut B) -> Result<Self> {
        let added = GSet::decode_in(memory.clone(), config, buf)?;
        let removed = GSet::decode_in(memory, config, buf)?;
        Ok(Self { added, removed })
    }
}

impl PartialEq for TwoPSet {
    fn eq(&self, other: &Self) -> bool {
        self.added == other.added && self.removed == other.removed
    }
}

impl fmt::Debug for TwoPSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoPSet")
            .field("added", &self.added)
            .field("removed", &self.removed)
            .finish()
    }
}

impl Lattice for TwoPSet {
    const KIND: CrdtKind = CrdtKind::TwoPSet;

    fn merge(&mut self, other: &Self) -> Result<()> {
        self.added.merge(&other.added)?;
        self.removed.merge(&other.removed)
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            added: self.added.try_clone()?,
            removed: self.removed.try_clone()?,
        })
    }
}

impl WireCodec for TwoPSet {
    fn serialized_size(&self) -> usize {
        self.added.serialized_size() + self.removed.serialized_size()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.added.encode(buf);
        self.removed.encode(buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let memory = SetMemory::for_entries::<Bytes>()?;
        Self::decode_in(memory, TableConfig::default(), buf)
    }
}

/// Concurrent, read-only view of a [`TwoPSet`].
#[derive(Clone)]
pub struct TwoPSetReader {
    added: GSetReader,
    removed: GSetReader,
}

impl TwoPSetReader {
    /// Presence test safe against a concurrent writer.
    pub fn contains(&self, guard: &HazardGuard, data: &[u8]) -> Result<bool> {
        // Tombstones only grow, so checking them second can only err on the
        // side of reporting an element removed a moment early.
        Ok(self.added.contains(guard, data)? && !self.removed.contains(guard, data)?)
    }

    pub fn was_removed(&self, guard: &HazardGuard, data: &[u8]) -> Result<bool> {
        self.removed.contains(guard, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twopset_basic_operations() {
        let mut set = TwoPSet::new().unwrap();
        set.add_str("a").unwrap();
        set.add_str("b").unwrap();
        assert_eq!(set.len(), 2);

        set.remove_str("a").unwrap();
        assert!(!set.contains_str("a"));
        assert!(set.contains_str("b"));
        assert!(set.was_added(b"a"));
        assert!(set.was_removed(b"a"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_twopset_tombstone_is_permanent() {
        let mut set = TwoPSet::new().unwrap();
        set.add_str("x").unwrap();
        set.remove_str("x").unwrap();

        // Re-adding is accepted but has no effect.
        set.add_str("x").unwrap();
        assert!(!set.contains_str("x"));
        assert!(set.was_removed(b"x"));
    }

    #[test]
    fn test_twopset_remove_unknown() {
        let mut set = TwoPSet::new().unwrap();
        assert_eq!(set.remove_str("ghost"), Err(CrdtError::NotFound));
        assert!(set.is_empty());
    }

    #[test]
    fn test_twopset_merge_propagates_tombstones() {
        let mut a = TwoPSet::new().unwrap();
        a.add_str("k").unwrap();

        let mut b = a.try_clone().unwrap();
        b.remove_str("k").unwrap();
        a.add_str("other").unwrap();

        a.merge(&b).unwrap();
        b.merge(&a.try_clone().unwrap()).unwrap();

        assert!(!a.contains_str("k"));
        assert!(a.contains_str("other"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_twopset_wire_roundtrip() {
        let mut set = TwoPSet::new().unwrap();
        set.add_str("keep").unwrap();
        set.add_str("drop").unwrap();
        set.remove_str("drop").unwrap();

        let bytes = set.to_bytes();
        let back = TwoPSet::from_bytes(&bytes).unwrap();
        assert_eq!(back, set);
        assert!(back.contains_str("keep"));
        assert!(!back.contains_str("drop"));
    }

    #[test]
    fn test_twopset_reader() {
        let mut set = TwoPSet::new().unwrap();
        set.add_str("a").unwrap();
        set.add_str("b").unwrap();
        set.remove_str("b").unwrap();

        let reader = set.reader();
        let guard = set.memory().domain.register().unwrap();
        assert!(reader.contains(&guard, b"a").unwrap());
        assert!(!reader.contains(&guard, b"b").unwrap());
        assert!(reader.was_removed(&guard, b"b").unwrap());
    }
}
