//! Observed-Remove Set (OR-Set) CRDT
//!
//! Each add creates a unique tag (a [`Uid`]). Remove tombstones every tag
//! the local replica has observed for the content. Merging unions entries
//! by tag and ORs their tombstones, so an add concurrent with a remove
//! survives (add-wins semantics).

use crate::codec::{
    blob_size, put_blob, read_blob, read_count, read_u64, read_u8, reject, WireCodec,
};
use crate::error::{CrdtError, Result};
use crate::gset::{check_element, content_hash};
use crate::lattice::{CrdtKind, Lattice};
use crate::table::{BucketTable, SetMemory, TableConfig, TableReader};
use crate::uid::Uid;
use bytes::{Buf, BufMut, Bytes};
use lfcs_mem::{HazardGuard, OrderedAtomic};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::AtomicBool;

/// Bytes per encoded entry before its content: node, timestamp, flag, length.
const ENTRY_HEADER: usize = 8 + 8 + 1 + 4;

pub(crate) struct OrEntry {
    tag: Uid,
    data: Bytes,
    removed: AtomicBool,
}

impl OrEntry {
    fn new(tag: Uid, data: Bytes, removed: bool) -> Self {
        Self {
            tag,
            data,
            removed: AtomicBool::new(removed),
        }
    }

    fn is_live(&self) -> bool {
        !self.removed.load_acquire()
    }
}

impl Clone for OrEntry {
    fn clone(&self) -> Self {
        Self::new(self.tag, self.data.clone(), self.removed.load_acquire())
    }
}

/// Snapshot of one tagged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrSetEntry<'a> {
    pub tag: Uid,
    pub data: &'a [u8],
    pub removed: bool,
}

/// An Observed-Remove Set CRDT over byte strings
pub struct OrSet {
    table: BucketTable<OrEntry>,
    /// Content hash of every tag held, tombstones included.
    tags: HashMap<Uid, u64>,
}

impl OrSet {
    /// Create an empty set with its own private memory
    pub fn new() -> Result<Self> {
        Ok(Self {
            table: BucketTable::standalone(TableConfig::default())?,
            tags: HashMap::new(),
        })
    }

    /// Create an empty set allocating from `memory`
    pub fn with_memory(memory: SetMemory, config: TableConfig) -> Result<Self> {
        Ok(Self {
            table: BucketTable::new(memory, config)?,
            tags: HashMap::new(),
        })
    }

    /// Add `data` under a fresh `tag`.
    ///
    /// Tags are unique across the whole set; reusing one already held, for
    /// any content, fails with [`CrdtError::AlreadyExists`].
    pub fn add(&mut self, tag: Uid, data: &[u8]) -> Result<()> {
        check_element(data)?;
        if self.tags.contains_key(&tag) {
            return Err(CrdtError::AlreadyExists);
        }
        self.insert_entry(OrEntry::new(tag, Bytes::copy_from_slice(data), false))
    }

    pub fn add_str(&mut self, tag: Uid, data: &str) -> Result<()> {
        self.add(tag, data.as_bytes())
    }

    /// Tombstone every live tag observed for `data`.
    ///
    /// Returns how many tags were tombstoned, or [`CrdtError::NotFound`]
    /// if the content has no live tag here.
    pub fn remove(&mut self, data: &[u8]) -> Result<usize> {
        check_element(data)?;
        let mut removed = 0;
        for entry in self.table.bucket(content_hash(data)) {
            if entry.data[..] == *data && entry.is_live() {
                entry.removed.store_release(true);
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(CrdtError::NotFound);
        }
        Ok(removed)
    }

    pub fn remove_str(&mut self, data: &str) -> Result<usize> {
        self.remove(data.as_bytes())
    }

    /// Present: at least one live tag for the content
    pub fn contains(&self, data: &[u8]) -> bool {
        self.table
            .find(content_hash(data), |e| e.data[..] == *data && e.is_live())
            .is_some()
    }

    pub fn contains_str(&self, data: &str) -> bool {
        self.contains(data.as_bytes())
    }

    /// Live tags held for `data`
    pub fn tags_of(&self, data: &[u8]) -> Vec<Uid> {
        self.table
            .bucket(content_hash(data))
            .filter(|e| e.data[..] == *data && e.is_live())
            .map(|e| e.tag)
            .collect()
    }

    /// Distinct live contents, in no particular order
    pub fn elements(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut seen = HashSet::new();
        self.table
            .iter()
            .filter(|e| e.is_live())
            .map(|e| &e.data[..])
            .filter(move |data| seen.insert(*data))
    }

    /// Every entry, tombstones included
    pub fn entries(&self) -> impl Iterator<Item = OrSetEntry<'_>> + '_ {
        self.table.iter().map(|e| OrSetEntry {
            tag: e.tag,
            data: &e.data[..],
            removed: !e.is_live(),
        })
    }

    /// Number of distinct live contents
    pub fn len(&self) -> usize {
        self.elements().count()
    }

    pub fn is_empty(&self) -> bool {
        !self.table.iter().any(OrEntry::is_live)
    }

    /// Number of entries, tombstones included
    pub fn entry_count(&self) -> usize {
        self.table.len()
    }

    pub fn live_tag_count(&self) -> usize {
        self.table.iter().filter(|e| e.is_live()).count()
    }

    /// Whether both replicas expose the same live contents, regardless of
    /// which tags carry them.
    pub fn same_elements(&self, other: &OrSet) -> bool {
        let mine: HashSet<&[u8]> = self.elements().collect();
        let theirs: HashSet<&[u8]> = other.elements().collect();
        mine == theirs
    }

    pub fn reader(&self) -> OrSetReader {
        OrSetReader {
            table: self.table.reader(),
        }
    }

    pub fn memory(&self) -> &SetMemory {
        self.table.memory()
    }

    pub fn reclaim(&mut self) -> usize {
        self.table.reclaim()
    }

    /// Whether `tag` is held, for any content
    pub fn has_tag(&self, tag: Uid) -> bool {
        self.tags.contains_key(&tag)
    }

    fn find_tag(&self, tag: Uid) -> Option<&OrEntry> {
        let hash = *self.tags.get(&tag)?;
        self.table.find(hash, |e| e.tag == tag)
    }

    fn insert_entry(&mut self, entry: OrEntry) -> Result<()> {
        let hash = content_hash(&entry.data);
        let tag = entry.tag;
        self.table.insert(hash, entry)?;
        self.tags.insert(tag, hash);
        Ok(())
    }

    /// Decode a snapshot into a set allocating from `memory`
    pub fn decode_in<B: Buf>(memory: SetMemory, config: TableConfig, buf: &mut B) -> Result<Self> {
        let mut set = Self::with_memory(memory, config)?;
        let count = read_count(buf, u32::MAX as usize, ENTRY_HEADER + 1, "entry count")?;
        set.tags.reserve(count);
        for _ in 0..count {
            let node_id = read_u64(buf, "tag node")?;
            let timestamp = read_u64(buf, "tag timestamp")?;
            let removed = match read_u8(buf, "tombstone flag")? {
                0 => false,
                1 => true,
                _ => return Err(reject("invalid tombstone flag")),
            };
            let data = read_blob(buf, "element")?;
            let tag = Uid::new(node_id, timestamp);
            if set.has_tag(tag) {
                return Err(reject(format!("duplicate tag {tag}")));
            }
            set.insert_entry(OrEntry::new(tag, data, removed))?;
        }
        Ok(set)
    }
}

impl PartialEq for OrSet {
    /// Full state equality: same tags, contents and tombstones.
    fn eq(&self, other: &Self) -> bool {
        if self.entry_count() != other.entry_count() {
            return false;
        }
        let theirs: HashMap<Uid, OrSetEntry<'_>> =
            other.entries().map(|e| (e.tag, e)).collect();
        self.entries().all(|e| theirs.get(&e.tag) == Some(&e))
    }
}

impl fmt::Debug for OrSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}

impl Lattice for OrSet {
    const KIND: CrdtKind = CrdtKind::OrSet;

    /// Union by tag; tombstones are sticky.
    ///
    /// Fails with [`CrdtError::AlreadyExists`], leaving `self` untouched, if
    /// `other` holds a tag that carries different content here.
    fn merge(&mut self, other: &Self) -> Result<()> {
        for entry in other.table.iter() {
            if self.has_tag(entry.tag) {
                match self.find_tag(entry.tag) {
                    Some(mine) if mine.data == entry.data => {}
                    _ => return Err(CrdtError::AlreadyExists),
                }
            }
        }

        for entry in other.table.iter() {
            match self.find_tag(entry.tag) {
                Some(mine) => {
                    if !entry.is_live() {
                        mine.removed.store_release(true);
                    }
                }
                None => self.insert_entry(entry.clone())?,
            }
        }
        Ok(())
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            table: self.table.try_clone()?,
            tags: self.tags.clone(),
        })
    }
}

impl WireCodec for OrSet {
    fn serialized_size(&self) -> usize {
        4 + self
            .table
            .iter()
            .map(|e| ENTRY_HEADER - 4 + blob_size(&e.data))
            .sum::<usize>()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.entry_count() as u32);
        for entry in self.entries() {
            buf.put_u64_le(entry.tag.node_id);
            buf.put_u64_le(entry.tag.timestamp);
            buf.put_u8(entry.removed as u8);
            put_blob(buf, entry.data);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Self::decode_in(SetMemory::for_entries::<OrEntry>()?, TableConfig::default(), buf)
    }
}

/// Concurrent, read-only view of an [`OrSet`].
#[derive(Clone)]
pub struct OrSetReader {
    table: TableReader<OrEntry>,
}

impl OrSetReader {
    /// Presence test safe against a concurrent writer.
    pub fn contains(&self, guard: &HazardGuard, data: &[u8]) -> Result<bool> {
        Ok(self
            .table
            .find_map(
                guard,
                content_hash(data),
                |e| e.data[..] == *data && e.is_live(),
                |_| (),
            )?
            .is_some())
    }

    /// Live tags for `data` at the time of the call
    pub fn count_tags(&self, guard: &HazardGuard, data: &[u8]) -> Result<usize> {
        self.table
            .count(guard, content_hash(data), |e| e.data[..] == *data && e.is_live())
    }

    pub fn memory(&self) -> &SetMemory {
        self.table.memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(node: u64, ts: u64) -> Uid {
        Uid::new(node, ts)
    }

    #[test]
    fn test_orset_add_remove() {
        let mut set = OrSet::new().unwrap();
        set.add_str(tag(1, 1), "apple").unwrap();
        set.add_str(tag(1, 2), "banana").unwrap();
        assert_eq!(set.len(), 2);

        assert_eq!(set.remove_str("apple").unwrap(), 1);
        assert!(!set.contains_str("apple"));
        assert!(set.contains_str("banana"));
        assert_eq!(set.entry_count(), 2);
        assert_eq!(set.live_tag_count(), 1);
    }

    #[test]
    fn test_orset_multiple_tags_per_content() {
        let mut set = OrSet::new().unwrap();
        set.add_str(tag(1, 1), "x").unwrap();
        set.add_str(tag(2, 1), "x").unwrap();

        assert_eq!(set.len(), 1);
        let mut tags = set.tags_of(b"x");
        tags.sort();
        assert_eq!(tags, vec![tag(1, 1), tag(2, 1)]);

        // Remove tombstones every observed tag.
        assert_eq!(set.remove_str("x").unwrap(), 2);
        assert!(set.is_empty());
        assert_eq!(set.remove_str("x"), Err(CrdtError::NotFound));
    }

    #[test]
    fn test_orset_duplicate_tag_rejected() {
        let mut set = OrSet::new().unwrap();
        set.add_str(tag(1, 1), "x").unwrap();
        assert_eq!(set.add_str(tag(1, 1), "x"), Err(CrdtError::AlreadyExists));
        assert!(matches!(set.add(tag(1, 2), b""), Err(CrdtError::InvalidArgument(_))));
        assert!(matches!(set.remove(b""), Err(CrdtError::InvalidArgument(_))));
    }

    #[test]
    fn test_orset_tag_unique_across_contents() {
        let mut set = OrSet::new().unwrap();
        set.add_str(tag(1, 1), "a").unwrap();
        assert_eq!(set.add_str(tag(1, 1), "b"), Err(CrdtError::AlreadyExists));
        assert!(!set.contains_str("b"));
        assert_eq!(set.entry_count(), 1);

        // A tombstoned tag stays claimed.
        set.remove_str("a").unwrap();
        assert_eq!(set.add_str(tag(1, 1), "b"), Err(CrdtError::AlreadyExists));

        let back = OrSet::from_bytes(&set.to_bytes()).unwrap();
        assert_eq!(back, set);
        assert_eq!(set, set.try_clone().unwrap());
    }

    #[test]
    fn test_orset_merge_rejects_tag_with_other_content() {
        let mut a = OrSet::new().unwrap();
        a.add_str(tag(1, 1), "a").unwrap();
        let mut b = OrSet::new().unwrap();
        b.add_str(tag(2, 1), "shared").unwrap();
        b.add_str(tag(1, 1), "b").unwrap();

        let before = a.try_clone().unwrap();
        assert_eq!(a.merge(&b), Err(CrdtError::AlreadyExists));
        assert_eq!(a, before);
        assert!(!a.contains_str("shared"));

        // Merging a copy of itself is a no-op.
        let mut copy = a.try_clone().unwrap();
        copy.merge(&a).unwrap();
        assert_eq!(copy, a);
        assert!(copy.has_tag(tag(1, 1)));
    }

    #[test]
    fn test_orset_add_wins() {
        let mut a = OrSet::new().unwrap();
        let mut b = OrSet::new().unwrap();

        a.add_str(tag(1, 1), "item").unwrap();
        b.add_str(tag(2, 1), "item").unwrap();
        b.remove_str("item").unwrap();

        a.merge(&b).unwrap();
        b.merge(&a.try_clone().unwrap()).unwrap();

        assert!(a.contains_str("item"));
        assert!(b.contains_str("item"));
        assert_eq!(a.tags_of(b"item"), vec![tag(1, 1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_orset_observed_remove_propagates() {
        let mut a = OrSet::new().unwrap();
        a.add_str(tag(1, 1), "gone").unwrap();

        let mut b = a.try_clone().unwrap();
        b.remove_str("gone").unwrap();

        a.merge(&b).unwrap();
        assert!(!a.contains_str("gone"));
        assert_eq!(a.entry_count(), 1);
    }

    #[test]
    fn test_orset_merge_idempotent() {
        let mut a = OrSet::new().unwrap();
        a.add_str(tag(1, 1), "p").unwrap();
        a.add_str(tag(1, 2), "q").unwrap();
        a.remove_str("q").unwrap();

        let before = a.try_clone().unwrap();
        a.merge(&before).unwrap();
        assert_eq!(a, before);
    }

    #[test]
    fn test_orset_same_elements_ignores_tags() {
        let mut a = OrSet::new().unwrap();
        let mut b = OrSet::new().unwrap();
        a.add_str(tag(1, 1), "v").unwrap();
        b.add_str(tag(2, 7), "v").unwrap();

        assert!(a.same_elements(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_orset_wire_roundtrip() {
        let mut set = OrSet::new().unwrap();
        set.add_str(tag(3, 10), "live").unwrap();
        set.add_str(tag(3, 11), "dead").unwrap();
        set.remove_str("dead").unwrap();

        let bytes = set.to_bytes();
        assert_eq!(bytes.len(), set.serialized_size());
        let back = OrSet::from_bytes(&bytes).unwrap();
        assert_eq!(back, set);
        assert!(back.contains_str("live"));
        assert!(!back.contains_str("dead"));
    }

    #[test]
    fn test_orset_decode_rejects_bad_flag_and_duplicates() {
        let mut raw = Vec::new();
        raw.put_u32_le(1);
        raw.put_u64_le(1);
        raw.put_u64_le(1);
        raw.put_u8(2);
        put_blob(&mut raw, b"a");
        assert!(OrSet::from_bytes(&raw).is_err());

        let mut raw = Vec::new();
        raw.put_u32_le(2);
        for data in [&b"a"[..], &b"b"[..]] {
            raw.put_u64_le(1);
            raw.put_u64_le(1);
            raw.put_u8(0);
            put_blob(&mut raw, data);
        }
        assert!(OrSet::from_bytes(&raw).is_err());
    }

    #[test]
    fn test_orset_reader() {
        let mut set = OrSet::new().unwrap();
        set.add_str(tag(1, 1), "r").unwrap();
        set.add_str(tag(2, 1), "r").unwrap();
        set.add_str(tag(1, 2), "s").unwrap();
        set.remove_str("s").unwrap();

        let reader = set.reader();
        let guard = set.memory().domain.register().unwrap();
        assert!(reader.contains(&guard, b"r").unwrap());
        assert!(!reader.contains(&guard, b"s").unwrap());
        assert_eq!(reader.count_tags(&guard, b"r").unwrap(), 2);
    }
}
