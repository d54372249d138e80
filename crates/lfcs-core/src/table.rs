//! Hash-bucketed entry table over pool blocks.
//!
//! The storage engine behind the set types. Entries live in blocks of a
//! [`MemoryPool`]; bucket heads and chain links hold [`BlockHandle`] words
//! rather than addresses. A single writer owns the table (`&mut` access for
//! every mutation) while any number of [`TableReader`]s look entries up from
//! other threads under hazard protection.
//!
//! Growing the table copies every entry into fresh blocks under a new bucket
//! array, swaps the array pointer and retires the old array and old blocks
//! through the [`HazardDomain`]. A reader protects the array pointer first,
//! then walks a chain hand-over-hand through two node slots, re-checking
//! after every step that the array it started from is still current.

use crate::error::{CrdtError, Result};
use lfcs_mem::{
    AtomicArith, Block, BlockHandle, HazardDomain, HazardGuard, MemError, MemoryPool,
    OrderedAtomic, PoolConfig, RetireList,
};
use serde::{Deserialize, Serialize};
use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Link word meaning "end of chain".
const NIL: u64 = 0;

const ARRAY_SLOT: usize = 0;
const NODE_SLOTS: [usize; 2] = [1, 2];

const MAX_BUCKETS: usize = 1 << 30;

/// Bucket table sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub initial_buckets: usize,
    /// Entries per bucket above which the table doubles.
    pub max_load_factor: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            initial_buckets: 16,
            max_load_factor: 0.75,
        }
    }
}

impl TableConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_buckets == 0 || self.initial_buckets > MAX_BUCKETS {
            return Err(CrdtError::InvalidArgument(format!(
                "initial_buckets must be in 1..={MAX_BUCKETS}"
            )));
        }
        if !(self.max_load_factor.is_finite() && self.max_load_factor > 0.0) {
            return Err(CrdtError::InvalidArgument(
                "max_load_factor must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// The pool and hazard domain a set allocates from.
///
/// Cloning shares both; sets created from the same memory may exchange
/// readers' guards.
#[derive(Debug, Clone)]
pub struct SetMemory {
    pub pool: Arc<MemoryPool>,
    pub domain: Arc<HazardDomain>,
}

impl SetMemory {
    pub fn new(pool: Arc<MemoryPool>, domain: Arc<HazardDomain>) -> Self {
        Self { pool, domain }
    }

    /// Private memory sized for entries of type `E`.
    pub(crate) fn for_entries<E>() -> Result<Self> {
        let pool = MemoryPool::new(PoolConfig::for_layout(Layout::new::<Node<E>>()))?;
        Ok(Self::new(Arc::new(pool), Arc::new(HazardDomain::new())))
    }

    /// Whether two handles point at the same pool and domain.
    pub fn same_as(&self, other: &SetMemory) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool) && Arc::ptr_eq(&self.domain, &other.domain)
    }

    fn check_fits<E>(&self) -> Result<()> {
        let layout = Layout::new::<Node<E>>();
        if self.pool.block_size() < layout.size() || self.pool.alignment() < layout.align() {
            return Err(CrdtError::InvalidArgument(format!(
                "pool blocks ({} bytes, align {}) cannot hold set entries ({} bytes, align {})",
                self.pool.block_size(),
                self.pool.alignment(),
                layout.size(),
                layout.align()
            )));
        }
        Ok(())
    }
}

pub(crate) struct Node<E> {
    next: AtomicU64,
    hash: u64,
    value: E,
}

struct BucketArray {
    heads: Box<[AtomicU64]>,
}

impl BucketArray {
    fn new(buckets: usize) -> Box<Self> {
        Box::new(Self {
            heads: (0..buckets).map(|_| AtomicU64::new(NIL)).collect(),
        })
    }

    fn head(&self, hash: u64) -> &AtomicU64 {
        &self.heads[(hash % self.heads.len() as u64) as usize]
    }
}

/// Moves a raw bucket-array pointer into a retirement closure.
struct ArrayPtr(*mut BucketArray);

// SAFETY: the array is unreachable by the time the closure runs.
unsafe impl Send for ArrayPtr {}

struct Shared<E> {
    buckets: AtomicPtr<BucketArray>,
    len: AtomicUsize,
    memory: SetMemory,
    _entries: PhantomData<E>,
}

impl<E> Shared<E> {
    fn node(&self, word: u64) -> Option<(BlockHandle, &Node<E>)> {
        let handle = BlockHandle::from_word(word)?;
        let ptr = self.memory.pool.resolve(handle)?;
        // SAFETY: live blocks of this pool hold an initialised `Node<E>`
        // written by the table; callers keep the block from being freed.
        Some((handle, unsafe { &*ptr.as_ptr().cast::<Node<E>>() }))
    }

    fn array(&self) -> &BucketArray {
        // SAFETY: the pointer is never null and only replaced by the writer,
        // which cannot run while `&self` borrows from the table or readers
        // protect it.
        unsafe { &*self.buckets.load_acquire() }
    }
}

impl<E> Drop for Shared<E> {
    fn drop(&mut self) {
        let array = *self.buckets.get_mut();
        if array.is_null() {
            return;
        }
        // SAFETY: last owner; the current array and its chains are ours.
        let array = unsafe { Box::from_raw(array) };
        for head in array.heads.iter() {
            let mut word = head.load_acquire();
            while let Some(block) = BlockHandle::from_word(word).and_then(|h| self.memory.pool.block(h)) {
                let node = block.ptr.as_ptr().cast::<Node<E>>();
                // SAFETY: the node is initialised and unreachable from now on.
                unsafe {
                    word = (*node).next.load_acquire();
                    ptr::drop_in_place(node);
                }
                if let Err(err) = self.memory.pool.free(block) {
                    warn!(%err, "failed to return set entry on drop");
                }
            }
        }
    }
}

/// Single-writer hash table of `E` entries keyed by a caller-supplied hash.
pub(crate) struct BucketTable<E: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<E>>,
    retired: RetireList,
    config: TableConfig,
}

impl<E: Clone + Send + Sync + 'static> BucketTable<E> {
    pub(crate) fn new(memory: SetMemory, config: TableConfig) -> Result<Self> {
        config.validate()?;
        memory.check_fits::<E>()?;
        let array = Box::into_raw(BucketArray::new(config.initial_buckets));
        Ok(Self {
            shared: Arc::new(Shared {
                buckets: AtomicPtr::new(array),
                len: AtomicUsize::new(0),
                memory,
                _entries: PhantomData,
            }),
            retired: RetireList::new(),
            config,
        })
    }

    /// A table backed by private memory sized for `E`.
    pub(crate) fn standalone(config: TableConfig) -> Result<Self> {
        Self::new(SetMemory::for_entries::<E>()?, config)
    }

    pub(crate) fn memory(&self) -> &SetMemory {
        &self.shared.memory
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.len.load_acquire()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.shared.array().heads.len()
    }

    pub(crate) fn reader(&self) -> TableReader<E> {
        TableReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Entries stored under `hash`, in chain order.
    pub(crate) fn bucket(&self, hash: u64) -> Chain<'_, E> {
        Chain {
            shared: &self.shared,
            word: self.shared.array().head(hash).load_acquire(),
            hash: Some(hash),
        }
    }

    pub(crate) fn find(&self, hash: u64, pred: impl Fn(&E) -> bool) -> Option<&E> {
        self.bucket(hash).find(|e| pred(e))
    }

    pub(crate) fn iter(&self) -> Iter<'_, E> {
        Iter {
            shared: &self.shared,
            array: self.shared.array(),
            bucket: 0,
            chain: None,
        }
    }

    /// Links a new entry at the head of its bucket.
    pub(crate) fn insert(&mut self, hash: u64, value: E) -> Result<()> {
        self.maybe_grow();

        let block = self.shared.memory.pool.alloc()?;
        let head = self.shared.array().head(hash);
        let node = Node {
            next: AtomicU64::new(head.load_acquire()),
            hash,
            value,
        };
        // SAFETY: the block is fresh, sized and aligned for `Node<E>` (checked
        // at construction), and unreachable until the head store below.
        unsafe { ptr::write(block.ptr.as_ptr().cast::<Node<E>>(), node) };
        head.store_release(block.handle.to_word());
        self.shared.len.fetch_add_acq_rel(1);
        Ok(())
    }

    fn maybe_grow(&mut self) {
        let buckets = self.bucket_count();
        let load = (self.len() + 1) as f64 / buckets as f64;
        if load <= self.config.max_load_factor || buckets >= MAX_BUCKETS {
            return;
        }
        if let Err(err) = self.rebuild(buckets * 2) {
            warn!(%err, buckets, "bucket table resize failed; keeping current buckets");
        }
    }

    /// Copies every entry into a fresh array of `buckets` buckets, publishes
    /// it and retires the previous array and blocks.
    fn rebuild(&mut self, buckets: usize) -> Result<()> {
        let fresh = BucketArray::new(buckets);
        let mut copied: Vec<Block> = Vec::with_capacity(self.len());
        let mut old_blocks: Vec<Block> = Vec::with_capacity(self.len());

        for (block, node) in self.nodes() {
            let new_block = match self.shared.memory.pool.alloc() {
                Ok(b) => b,
                Err(err) => {
                    self.discard_unpublished(copied);
                    return Err(err.into());
                }
            };
            let head = fresh.head(node.hash);
            let copy = Node {
                next: AtomicU64::new(head.load_acquire()),
                hash: node.hash,
                value: node.value.clone(),
            };
            // SAFETY: as in `insert`; `fresh` is not yet published.
            unsafe { ptr::write(new_block.ptr.as_ptr().cast::<Node<E>>(), copy) };
            head.store_release(new_block.handle.to_word());
            copied.push(new_block);
            old_blocks.push(block);
        }

        let old_array = self.shared.buckets.swap_acq_rel(Box::into_raw(fresh));
        debug!(buckets, entries = copied.len(), "bucket table resized");
        self.retire_blocks(old_blocks);
        self.retire_array(old_array);
        Ok(())
    }

    /// Copy of this table on the same memory, with the same bucket count.
    pub(crate) fn try_clone(&self) -> Result<Self> {
        let config = TableConfig {
            initial_buckets: self.bucket_count(),
            ..self.config
        };
        let mut copy = Self::new(self.shared.memory.clone(), config)?;
        for (_, node) in self.nodes() {
            copy.insert(node.hash, node.value.clone())?;
        }
        Ok(copy)
    }

    /// Runs a reclamation pass over this table's retirements.
    pub(crate) fn reclaim(&mut self) -> usize {
        self.shared.memory.domain.reclaim(&mut self.retired)
    }

    fn nodes(&self) -> impl Iterator<Item = (Block, &Node<E>)> + '_ {
        let array = self.shared.array();
        array.heads.iter().flat_map(move |head| {
            let mut word = head.load_acquire();
            std::iter::from_fn(move || {
                let (handle, node) = self.shared.node(word)?;
                word = node.next.load_acquire();
                let block = self.shared.memory.pool.block(handle)?;
                Some((block, node))
            })
        })
    }

    fn discard_unpublished(&self, blocks: Vec<Block>) {
        for block in blocks {
            // SAFETY: written by `rebuild`, never published.
            unsafe { ptr::drop_in_place(block.ptr.as_ptr().cast::<Node<E>>()) };
            let _ = self.shared.memory.pool.free(block);
        }
    }

    fn retire_blocks(&mut self, blocks: Vec<Block>) {
        let domain = Arc::clone(&self.shared.memory.domain);
        for block in blocks {
            let pool = Arc::clone(&self.shared.memory.pool);
            let cleanup = move || {
                // SAFETY: unreachable and unprotected once reclaimed.
                unsafe { ptr::drop_in_place(block.ptr.as_ptr().cast::<Node<E>>()) };
                if let Err(err) = pool.free_zeroed(block) {
                    warn!(%err, "failed to return retired set entry");
                }
            };
            domain.retire(&mut self.retired, block.handle.to_word(), Box::new(cleanup));
        }
    }

    fn retire_array(&mut self, array: *mut BucketArray) {
        let word = array as usize as u64;
        let array = ArrayPtr(array);
        let cleanup = move || {
            let array = array;
            let ArrayPtr(raw) = array;
            // SAFETY: boxed in `BucketArray::new`, swapped out, unprotected.
            drop(unsafe { Box::from_raw(raw) });
        };
        let domain = Arc::clone(&self.shared.memory.domain);
        domain.retire(&mut self.retired, word, Box::new(cleanup));
    }
}

impl<E: Clone + Send + Sync + 'static> Drop for BucketTable<E> {
    fn drop(&mut self) {
        let domain = Arc::clone(&self.shared.memory.domain);
        domain.reclaim(&mut self.retired);
        domain.abandon(mem::take(&mut self.retired));
    }
}

/// Entries of one bucket chain, optionally filtered by hash.
pub(crate) struct Chain<'a, E> {
    shared: &'a Shared<E>,
    word: u64,
    hash: Option<u64>,
}

impl<'a, E> Iterator for Chain<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<&'a E> {
        loop {
            let (_, node) = self.shared.node(self.word)?;
            self.word = node.next.load_acquire();
            if self.hash.map_or(true, |h| h == node.hash) {
                return Some(&node.value);
            }
        }
    }
}

/// Every entry of a table, bucket by bucket.
pub(crate) struct Iter<'a, E> {
    shared: &'a Shared<E>,
    array: &'a BucketArray,
    bucket: usize,
    chain: Option<Chain<'a, E>>,
}

impl<'a, E> Iterator for Iter<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<&'a E> {
        loop {
            if let Some(value) = self.chain.as_mut().and_then(Iterator::next) {
                return Some(value);
            }
            let head = self.array.heads.get(self.bucket)?;
            self.bucket += 1;
            self.chain = Some(Chain {
                shared: self.shared,
                word: head.load_acquire(),
                hash: None,
            });
        }
    }
}

/// Concurrent lookup handle for a [`BucketTable`].
pub(crate) struct TableReader<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for TableReader<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> TableReader<E> {
    pub(crate) fn len(&self) -> usize {
        self.shared.len.load_acquire()
    }

    pub(crate) fn memory(&self) -> &SetMemory {
        &self.shared.memory
    }

    /// Finds the first entry under `hash` matching `pred` and maps it while
    /// it is still protected.
    pub(crate) fn find_map<R>(
        &self,
        guard: &HazardGuard,
        hash: u64,
        pred: impl Fn(&E) -> bool,
        map: impl FnOnce(&E) -> R,
    ) -> Result<Option<R>> {
        let result = self.visit(guard, hash, |e| pred(e), || {}).map(|found| found.map(map));
        Self::release(guard)?;
        result
    }

    /// Counts entries under `hash` matching `pred`.
    pub(crate) fn count(
        &self,
        guard: &HazardGuard,
        hash: u64,
        pred: impl Fn(&E) -> bool,
    ) -> Result<usize> {
        let count = Cell::new(0);
        let result = self.visit(
            guard,
            hash,
            |e| {
                if pred(e) {
                    count.set(count.get() + 1);
                }
                false
            },
            || count.set(0),
        );
        Self::release(guard)?;
        result.map(|_| count.get())
    }

    fn release(guard: &HazardGuard) -> Result<()> {
        for slot in [ARRAY_SLOT, NODE_SLOTS[0], NODE_SLOTS[1]] {
            guard.clear(slot)?;
        }
        Ok(())
    }

    /// Walks the chain for `hash` until `stop` returns true, returning the
    /// entry it stopped on. `restarted` runs whenever the walk starts over
    /// on a newer bucket array. The returned reference stays protected until
    /// the caller releases the guard's slots.
    fn visit<'g>(
        &'g self,
        guard: &HazardGuard,
        hash: u64,
        mut stop: impl FnMut(&E) -> bool,
        mut restarted: impl FnMut(),
    ) -> Result<Option<&'g E>> {
        if !guard.belongs_to(&self.shared.memory.domain) {
            return Err(MemError::ForeignGuard.into());
        }

        let mut first = true;
        'restart: loop {
            if !mem::take(&mut first) {
                restarted();
            }
            let array_ptr = guard.protect_ptr(ARRAY_SLOT, &self.shared.buckets)?;
            // SAFETY: protected and validated current by `protect_ptr`.
            let array = unsafe { &*array_ptr };
            let mut src: &AtomicU64 = array.head(hash);
            let mut step = 0;

            loop {
                let word = guard.protect(NODE_SLOTS[step % 2], src)?;
                if word == NIL {
                    return Ok(None);
                }
                // Blocks of a superseded array may already be retired.
                if self.shared.buckets.load_acquire() != array_ptr {
                    continue 'restart;
                }
                let Some((_, node)) = self.shared.node(word) else {
                    continue 'restart;
                };
                if node.hash == hash && stop(&node.value) {
                    return Ok(Some(&node.value));
                }
                src = &node.next;
                step += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn table() -> BucketTable<Bytes> {
        BucketTable::standalone(TableConfig {
            initial_buckets: 2,
            max_load_factor: 0.75,
        })
        .unwrap()
    }

    #[test]
    fn test_insert_find_iter() {
        let mut t = table();
        t.insert(1, Bytes::from_static(b"a")).unwrap();
        t.insert(3, Bytes::from_static(b"b")).unwrap();
        t.insert(1, Bytes::from_static(b"c")).unwrap();

        assert_eq!(t.len(), 3);
        assert_eq!(t.find(1, |v| v == "c").map(|v| &v[..]), Some(&b"c"[..]));
        assert!(t.find(3, |v| v == "a").is_none());
        assert_eq!(t.bucket(1).count(), 2);
        assert_eq!(t.iter().count(), 3);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut t = table();
        for i in 0..100u64 {
            t.insert(i, Bytes::from(i.to_le_bytes().to_vec())).unwrap();
        }
        assert!(t.bucket_count() >= 128);
        assert_eq!(t.len(), 100);
        for i in 0..100u64 {
            assert!(t.find(i, |v| v[..] == i.to_le_bytes()).is_some());
        }

        t.reclaim();
        // Only the live copies remain allocated.
        assert_eq!(t.memory().pool.stats().in_use, 100);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut t = table();
        for i in 0..10u64 {
            t.insert(i, Bytes::from_static(b"x")).unwrap();
        }
        let copy = t.try_clone().unwrap();
        t.insert(99, Bytes::from_static(b"late")).unwrap();
        assert_eq!(t.len(), 11);
        assert_eq!(copy.len(), 10);
        assert_eq!(copy.iter().count(), 10);
        assert!(copy.find(99, |_| true).is_none());
    }

    #[test]
    fn test_reader_lookup() {
        let mut t = table();
        t.insert(7, Bytes::from_static(b"seven")).unwrap();
        let reader = t.reader();
        let guard = t.memory().domain.register().unwrap();

        let hit = reader.find_map(&guard, 7, |v| v == "seven", |v| v.len()).unwrap();
        assert_eq!(hit, Some(5));
        assert_eq!(reader.find_map(&guard, 8, |_| true, |_| ()).unwrap(), None);
        assert_eq!(reader.count(&guard, 7, |_| true).unwrap(), 1);
        assert_eq!(guard.announced(ARRAY_SLOT).unwrap(), 0);
    }

    #[test]
    fn test_reader_rejects_foreign_guard() {
        let t = table();
        let other = Arc::new(HazardDomain::new());
        let guard = other.register().unwrap();
        assert!(matches!(
            t.reader().find_map(&guard, 0, |_| true, |_| ()),
            Err(CrdtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_small_pool_rejected() {
        let pool = MemoryPool::new(PoolConfig::default().with_block_size(8).with_alignment(8)).unwrap();
        let memory = SetMemory::new(Arc::new(pool), Arc::new(HazardDomain::new()));
        assert!(BucketTable::<Bytes>::new(memory, TableConfig::default()).is_err());
    }

    #[test]
    fn test_drop_returns_blocks() {
        let memory = SetMemory::for_entries::<Bytes>().unwrap();
        {
            let mut t = BucketTable::new(memory.clone(), TableConfig::default()).unwrap();
            for i in 0..40u64 {
                t.insert(i, Bytes::from_static(b"y")).unwrap();
            }
        }
        memory.domain.reclaim_orphans();
        assert_eq!(memory.pool.stats().in_use, 0);
    }

    #[test]
    fn test_last_reader_returns_blocks() {
        let memory = SetMemory::for_entries::<Bytes>().unwrap();
        let reader = {
            let mut t = BucketTable::new(memory.clone(), TableConfig::default()).unwrap();
            for i in 0..40u64 {
                t.insert(i, Bytes::from_static(b"z")).unwrap();
            }
            t.reader()
        };
        memory.domain.reclaim_orphans();
        // The reader keeps the live chains alive.
        assert_eq!(memory.pool.stats().in_use, 40);

        drop(reader);
        assert_eq!(memory.pool.stats().in_use, 0);
    }
}
