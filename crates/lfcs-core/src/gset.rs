//! Grow-only Set (G-Set) CRDT
//!
//! A G-Set is a set that only supports additions. Once an element is added,
//! it can never be removed. Elements are opaque byte strings identified by
//! their content; the join operation is set union.
//!
//! Entries live in a hash-bucketed table allocated from a [`SetMemory`].
//! Lookups hash the content with XXH3 and resolve collisions by comparing
//! the full bytes.

use crate::codec::{blob_size, put_blob, read_blob, read_count, WireCodec};
use crate::error::{CrdtError, Result};
use crate::lattice::{CrdtKind, Lattice};
use crate::table::{BucketTable, SetMemory, TableConfig, TableReader};
use bytes::{Buf, BufMut, Bytes};
use lfcs_mem::HazardGuard;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Hash under which set contents are bucketed.
pub fn content_hash(data: &[u8]) -> u64 {
    xxh3_64(data)
}

pub(crate) fn check_element(data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(CrdtError::InvalidArgument("set elements must be non-empty".into()));
    }
    if data.len() > u32::MAX as usize {
        return Err(CrdtError::InvalidArgument("set element too large".into()));
    }
    Ok(())
}

/// A Grow-only Set CRDT over byte strings
pub struct GSet {
    table: BucketTable<Bytes>,
}

impl GSet {
    /// Create an empty set with its own private memory
    pub fn new() -> Result<Self> {
        Ok(Self {
            table: BucketTable::standalone(TableConfig::default())?,
        })
    }

    /// Create an empty set allocating from `memory`
    pub fn with_memory(memory: SetMemory, config: TableConfig) -> Result<Self> {
        Ok(Self {
            table: BucketTable::new(memory, config)?,
        })
    }

    /// Add an element. Adding an element already present is a no-op.
    pub fn add(&mut self, data: &[u8]) -> Result<()> {
        check_element(data)?;
        if self.contains(data) {
            return Ok(());
        }
        self.table.insert(content_hash(data), Bytes::copy_from_slice(data))
    }

    fn add_shared(&mut self, data: &Bytes) -> Result<()> {
        if self.contains(data) {
            return Ok(());
        }
        self.table.insert(content_hash(data), data.clone())
    }

    pub fn add_str(&mut self, data: &str) -> Result<()> {
        self.add(data.as_bytes())
    }

    /// Check if the set contains an element
    pub fn contains(&self, data: &[u8]) -> bool {
        self.table.find(content_hash(data), |e| e[..] == *data).is_some()
    }

    pub fn contains_str(&self, data: &str) -> bool {
        self.contains(data.as_bytes())
    }

    /// Get the number of elements
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all elements, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.table.iter().map(|e| &e[..])
    }

    /// Check if every element of `self` is in `other`
    pub fn is_subset(&self, other: &GSet) -> bool {
        self.len() <= other.len() && self.iter().all(|e| other.contains(e))
    }

    /// Handle for hazard-protected lookups from other threads
    pub fn reader(&self) -> GSetReader {
        GSetReader {
            table: self.table.reader(),
        }
    }

    pub fn memory(&self) -> &SetMemory {
        self.table.memory()
    }

    /// Frees entries retired by past resizes once no reader protects them
    pub fn reclaim(&mut self) -> usize {
        self.table.reclaim()
    }

    /// Decode a snapshot into a set allocating from `memory`
    pub fn decode_in<B: Buf>(memory: SetMemory, config: TableConfig, buf: &mut B) -> Result<Self> {
        let mut set = Self::with_memory(memory, config)?;
        let count = read_count(buf, u32::MAX as usize, 5, "element count")?;
        for _ in 0..count {
            let data = read_blob(buf, "element")?;
            set.add_shared(&data)?;
        }
        Ok(set)
    }
}

impl PartialEq for GSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_subset(other)
    }
}

impl fmt::Debug for GSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.table.iter()).finish()
    }
}

impl Lattice for GSet {
    const KIND: CrdtKind = CrdtKind::GSet;

    /// Union by content
    fn merge(&mut self, other: &Self) -> Result<()> {
        for data in other.table.iter() {
            self.add_shared(data)?;
        }
        Ok(())
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            table: self.table.try_clone()?,
        })
    }
}

impl WireCodec for GSet {
    fn serialized_size(&self) -> usize {
        4 + self.iter().map(blob_size).sum::<usize>()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.len() as u32);
        for data in self.iter() {
            put_blob(buf, data);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Self::decode_in(SetMemory::for_entries::<Bytes>()?, TableConfig::default(), buf)
    }
}

/// Concurrent, read-only view of a [`GSet`].
#[derive(Clone)]
pub struct GSetReader {
    table: TableReader<Bytes>,
}

impl GSetReader {
    /// Membership test safe against a concurrent writer.
    ///
    /// `guard` must be registered with the set's hazard domain.
    pub fn contains(&self, guard: &HazardGuard, data: &[u8]) -> Result<bool> {
        Ok(self
            .table
            .find_map(guard, content_hash(data), |e| e[..] == *data, |_| ())?
            .is_some())
    }

    /// Number of elements at the time of the call
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory(&self) -> &SetMemory {
        self.table.memory()
    }
}
