//! Lock-free fixed-size block pool.
//!
//! Blocks are addressed by index. A directory of lazily installed pages
//! maps each index to a slot holding the block address, its free-list link
//! and a generation counter. The free list head is a [`TaggedIndex`], so
//! push and pop are single-word CAS operations that cannot suffer ABA.
//!
//! The initial blocks are carved out of one contiguous, aligned base region.
//! When the free list runs dry the pool falls back to allocating individual
//! blocks from the global allocator, up to `max_blocks`.

use crate::atomic::{
    secure_zero, spin_hint, AtomicArith, AtomicTaggedIndex, CacheAligned, OrderedAtomic,
    TaggedIndex, CACHE_LINE_SIZE,
};
use crate::error::{MemError, Result};
use serde::{Deserialize, Serialize};
use std::alloc::{self, Layout};
use std::num::NonZeroU64;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

const PAGE_SHIFT: u32 = 10;
const PAGE_LEN: usize = 1 << PAGE_SHIFT;
const PAGE_MASK: u32 = (PAGE_LEN as u32) - 1;
const DIRECTORY_LEN: usize = 4096;

/// Largest number of blocks one pool can address.
pub const MAX_POOL_BLOCKS: usize = PAGE_LEN * DIRECTORY_LEN;

/// Pool sizing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Usable bytes per block. Rounded up to a multiple of `alignment`.
    pub block_size: usize,
    /// Blocks pre-allocated in the contiguous base region.
    pub initial_blocks: usize,
    /// Hard cap on blocks. Zero means [`MAX_POOL_BLOCKS`].
    pub max_blocks: usize,
    /// Block alignment. Zero means [`CACHE_LINE_SIZE`].
    pub alignment: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            initial_blocks: 1024,
            max_blocks: 0,
            alignment: CACHE_LINE_SIZE,
        }
    }
}

impl PoolConfig {
    /// Configuration whose blocks can hold one value of `layout`.
    pub fn for_layout(layout: Layout) -> Self {
        Self {
            block_size: layout.size().max(1),
            initial_blocks: 64,
            max_blocks: 0,
            alignment: layout.align().max(std::mem::align_of::<usize>()),
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_initial_blocks(mut self, initial_blocks: usize) -> Self {
        self.initial_blocks = initial_blocks;
        self
    }

    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    fn effective_alignment(&self) -> usize {
        if self.alignment == 0 {
            CACHE_LINE_SIZE
        } else {
            self.alignment
        }
    }

    fn effective_max_blocks(&self) -> usize {
        if self.max_blocks == 0 {
            MAX_POOL_BLOCKS
        } else {
            self.max_blocks
        }
    }

    pub fn validate(&self) -> Result<()> {
        let alignment = self.effective_alignment();
        if !alignment.is_power_of_two() {
            return Err(MemError::InvalidConfig(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        if self.block_size == 0 {
            return Err(MemError::InvalidConfig("block_size must be non-zero".into()));
        }
        let max_blocks = self.effective_max_blocks();
        if max_blocks > MAX_POOL_BLOCKS {
            return Err(MemError::InvalidConfig(format!(
                "max_blocks {max_blocks} exceeds {MAX_POOL_BLOCKS}"
            )));
        }
        if self.initial_blocks > max_blocks {
            return Err(MemError::InvalidConfig(format!(
                "initial_blocks {} exceeds max_blocks {max_blocks}",
                self.initial_blocks
            )));
        }
        Ok(())
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Successful allocations.
    pub allocated: u64,
    pub freed: u64,
    pub in_use: u64,
    pub peak_use: u64,
    /// Allocation attempts, failed ones included.
    pub total_allocs: u64,
    /// CAS retries on the free list.
    pub contention: u64,
    /// Blocks that currently exist, free or not.
    pub capacity: u64,
}

/// Generation-checked reference to a pool block.
///
/// Packs the block index in the low half and the generation in the high
/// half. Generations start at 1, so a handle is never the zero word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(NonZeroU64);

impl BlockHandle {
    fn new(index: u32, generation: u32) -> Option<Self> {
        NonZeroU64::new(((generation as u64) << 32) | index as u64).map(Self)
    }

    pub fn index(&self) -> u32 {
        self.0.get() as u32
    }

    pub fn generation(&self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    /// The handle as a plain word, suitable for atomics and hazard slots.
    pub fn to_word(self) -> u64 {
        self.0.get()
    }

    /// Inverse of [`to_word`](Self::to_word). Zero yields `None`.
    pub fn from_word(word: u64) -> Option<Self> {
        NonZeroU64::new(word).map(Self)
    }
}

/// An allocated block: its handle plus its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub handle: BlockHandle,
    pub ptr: NonNull<u8>,
}

// SAFETY: a block is an address plus an index. Access to the memory behind
// it is governed by whoever owns the block, not by this value.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

struct BlockSlot {
    ptr: AtomicPtr<u8>,
    next_free: AtomicU32,
    generation: AtomicU32,
}

impl BlockSlot {
    fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            next_free: AtomicU32::new(TaggedIndex::NIL),
            generation: AtomicU32::new(1),
        }
    }
}

/// Lock-free pool of equally sized, equally aligned blocks.
pub struct MemoryPool {
    free_head: CacheAligned<AtomicTaggedIndex>,
    next_index: CacheAligned<AtomicU32>,
    directory: Box<[AtomicPtr<BlockSlot>]>,

    allocated: AtomicU64,
    freed: AtomicU64,
    peak_use: AtomicU64,
    total_allocs: AtomicU64,
    contention: AtomicU64,
    capacity: AtomicU64,

    block_layout: Layout,
    initial_blocks: usize,
    max_blocks: usize,
    base: Option<(NonNull<u8>, Layout)>,
}

// SAFETY: all shared state is atomic; the raw base pointer is only
// dereferenced through blocks handed out by the free list, and freed once
// in `Drop`.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let alignment = config.effective_alignment();
        let block_size = config.block_size.div_ceil(alignment) * alignment;
        let block_layout = Layout::from_size_align(block_size, alignment)
            .map_err(|e| MemError::InvalidConfig(e.to_string()))?;

        let directory = (0..DIRECTORY_LEN)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut pool = Self {
            free_head: CacheAligned::new(AtomicTaggedIndex::new(TaggedIndex::nil())),
            next_index: CacheAligned::new(AtomicU32::new(0)),
            directory,
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            peak_use: AtomicU64::new(0),
            total_allocs: AtomicU64::new(0),
            contention: AtomicU64::new(0),
            capacity: AtomicU64::new(0),
            block_layout,
            initial_blocks: config.initial_blocks,
            max_blocks: config.effective_max_blocks(),
            base: None,
        };

        if config.initial_blocks > 0 {
            pool.carve_base_region(config.initial_blocks)?;
        }

        debug!(
            block_size,
            alignment,
            initial_blocks = config.initial_blocks,
            max_blocks = pool.max_blocks,
            "memory pool created"
        );
        Ok(pool)
    }

    fn carve_base_region(&mut self, count: usize) -> Result<()> {
        let block_size = self.block_layout.size();
        let total = block_size
            .checked_mul(count)
            .ok_or_else(|| MemError::InvalidConfig("initial region size overflows".into()))?;
        let layout = Layout::from_size_align(total, self.block_layout.align())
            .map_err(|e| MemError::InvalidConfig(e.to_string()))?;

        // SAFETY: `layout` has non-zero size (block_size > 0, count > 0).
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or(MemError::OutOfMemory { size: total })?;
        self.base = Some((base, layout));

        for i in 0..count {
            let slot = self.ensure_slot(i as u32);
            // SAFETY: i * block_size < total, within the base allocation.
            slot.ptr.store_release(unsafe { base.as_ptr().add(i * block_size) });
            let next = if i + 1 < count { (i + 1) as u32 } else { TaggedIndex::NIL };
            slot.next_free.store_release(next);
        }

        self.next_index.store_release(count as u32);
        self.capacity.store_release(count as u64);
        self.free_head.store(TaggedIndex::new(0, 0));
        Ok(())
    }

    fn slot(&self, index: u32) -> Option<&BlockSlot> {
        let page = (index >> PAGE_SHIFT) as usize;
        let slots = self.directory.get(page)?.load_acquire();
        if slots.is_null() {
            return None;
        }
        // SAFETY: installed pages hold PAGE_LEN slots and live until drop.
        Some(unsafe { &*slots.add((index & PAGE_MASK) as usize) })
    }

    /// Returns the slot for `index`, installing its page if needed.
    /// Callers guarantee `index < max_blocks`.
    fn ensure_slot(&self, index: u32) -> &BlockSlot {
        let page = (index >> PAGE_SHIFT) as usize;
        let entry = &self.directory[page];
        let mut slots = entry.load_acquire();
        if slots.is_null() {
            let fresh: Box<[BlockSlot]> = (0..PAGE_LEN).map(|_| BlockSlot::empty()).collect();
            let fresh = Box::into_raw(fresh) as *mut BlockSlot;
            match entry.compare_swap(ptr::null_mut(), fresh) {
                Ok(_) => slots = fresh,
                Err(installed) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, PAGE_LEN)) });
                    slots = installed;
                }
            }
        }
        // SAFETY: see `slot`.
        unsafe { &*slots.add((index & PAGE_MASK) as usize) }
    }

    /// Pops a block off the free list, or allocates a fresh one.
    pub fn alloc(&self) -> Result<Block> {
        self.total_allocs.fetch_add_acq_rel(1);

        let index = loop {
            let head = self.free_head.load();
            if head.is_nil() {
                return self.alloc_fresh();
            }
            let slot = self.slot(head.index).ok_or(MemError::InvalidBlock)?;
            let next = slot.next_free.load_acquire();
            if self.free_head.compare_swap(head, head.advance(next)).is_ok() {
                break head.index;
            }
            self.contention.fetch_add_acq_rel(1);
            spin_hint();
        };

        let slot = self.slot(index).ok_or(MemError::InvalidBlock)?;
        let ptr = NonNull::new(slot.ptr.load_acquire()).ok_or(MemError::InvalidBlock)?;
        let handle = BlockHandle::new(index, slot.generation.load_acquire())
            .ok_or(MemError::InvalidBlock)?;
        self.record_alloc();
        Ok(Block { handle, ptr })
    }

    fn alloc_fresh(&self) -> Result<Block> {
        let limit = self.max_blocks as u32;
        let index = match self.next_index.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < limit).then_some(n + 1)
        }) {
            Ok(index) => index,
            Err(_) => {
                warn!(max_blocks = self.max_blocks, "memory pool exhausted");
                return Err(MemError::PoolExhausted { max_blocks: self.max_blocks });
            }
        };

        let slot = self.ensure_slot(index);
        // SAFETY: block_layout has non-zero size.
        let raw = unsafe { alloc::alloc(self.block_layout) };
        let ptr = NonNull::new(raw).ok_or(MemError::OutOfMemory {
            size: self.block_layout.size(),
        })?;
        slot.ptr.store_release(ptr.as_ptr());
        self.capacity.fetch_add_acq_rel(1);
        trace!(index, "free list empty, allocated fresh block");

        let handle = BlockHandle::new(index, slot.generation.load_acquire())
            .ok_or(MemError::InvalidBlock)?;
        self.record_alloc();
        Ok(Block { handle, ptr })
    }

    fn record_alloc(&self) {
        let allocated = self.allocated.fetch_add_acq_rel(1) + 1;
        let in_use = allocated.saturating_sub(self.freed.load_acquire());
        self.peak_use.fetch_max_acq_rel(in_use);
    }

    /// Returns a block to the free list.
    ///
    /// The slot generation is bumped first, so a second `free` of the same
    /// block (or of any stale copy of its handle) fails with
    /// [`MemError::InvalidBlock`] instead of corrupting the list.
    pub fn free(&self, block: Block) -> Result<()> {
        let index = block.handle.index();
        let slot = self.slot(index).ok_or(MemError::InvalidBlock)?;
        if slot.ptr.load_acquire() != block.ptr.as_ptr() {
            return Err(MemError::InvalidBlock);
        }

        let generation = block.handle.generation();
        let next_generation = if generation == u32::MAX { 1 } else { generation + 1 };
        slot.generation
            .compare_swap(generation, next_generation)
            .map_err(|_| MemError::InvalidBlock)?;

        loop {
            let head = self.free_head.load();
            slot.next_free.store_release(head.index);
            if self.free_head.compare_swap(head, head.advance(index)).is_ok() {
                break;
            }
            self.contention.fetch_add_acq_rel(1);
            spin_hint();
        }

        self.freed.fetch_add_acq_rel(1);
        Ok(())
    }

    /// Zeroes the block contents, then frees it.
    pub fn free_zeroed(&self, block: Block) -> Result<()> {
        if !self.is_live(block.handle) {
            return Err(MemError::InvalidBlock);
        }
        // SAFETY: the handle is live, so the caller owns `block_size` bytes at `ptr`.
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(block.ptr.as_ptr(), self.block_layout.size()) };
        secure_zero(bytes);
        self.free(block)
    }

    /// Address of a live block, or `None` if the handle is stale.
    pub fn resolve(&self, handle: BlockHandle) -> Option<NonNull<u8>> {
        let slot = self.slot(handle.index())?;
        if slot.generation.load_acquire() != handle.generation() {
            return None;
        }
        NonNull::new(slot.ptr.load_acquire())
    }

    /// Rebuilds the [`Block`] for a live handle.
    pub fn block(&self, handle: BlockHandle) -> Option<Block> {
        self.resolve(handle).map(|ptr| Block { handle, ptr })
    }

    pub fn is_live(&self, handle: BlockHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Whether `handle` indexes a block this pool created.
    pub fn owns(&self, handle: BlockHandle) -> bool {
        handle.index() < self.next_index.load_acquire()
            && self.slot(handle.index()).is_some_and(|s| !s.ptr.load_acquire().is_null())
    }

    pub fn block_size(&self) -> usize {
        self.block_layout.size()
    }

    pub fn alignment(&self) -> usize {
        self.block_layout.align()
    }

    pub fn block_layout(&self) -> Layout {
        self.block_layout
    }

    /// Blocks that currently exist, free or in use.
    pub fn capacity(&self) -> usize {
        self.capacity.load_acquire() as usize
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn stats(&self) -> PoolStats {
        let allocated = self.allocated.load_acquire();
        let freed = self.freed.load_acquire();
        PoolStats {
            allocated,
            freed,
            in_use: allocated.saturating_sub(freed),
            peak_use: self.peak_use.load_acquire(),
            total_allocs: self.total_allocs.load_acquire(),
            contention: self.contention.load_acquire(),
            capacity: self.capacity.load_acquire(),
        }
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("block_size", &self.block_layout.size())
            .field("alignment", &self.block_layout.align())
            .field("max_blocks", &self.max_blocks)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let created = *self.next_index.get_mut() as usize;
        for index in self.initial_blocks..created {
            if let Some(slot) = self.slot(index as u32) {
                let ptr = slot.ptr.load(Ordering::Relaxed);
                if !ptr.is_null() {
                    // SAFETY: fallback blocks come from `alloc(block_layout)`.
                    unsafe { alloc::dealloc(ptr, self.block_layout) };
                }
            }
        }

        if let Some((base, layout)) = self.base.take() {
            // SAFETY: allocated in `carve_base_region` with this layout.
            unsafe { alloc::dealloc(base.as_ptr(), layout) };
        }

        for entry in self.directory.iter() {
            let slots = entry.load(Ordering::Relaxed);
            if !slots.is_null() {
                // SAFETY: pages are boxed slices of PAGE_LEN slots.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(slots, PAGE_LEN)) });
            }
        }

        let stats = self.stats();
        debug!(
            allocated = stats.allocated,
            freed = stats.freed,
            peak_use = stats.peak_use,
            "memory pool destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(initial: usize, max: usize) -> MemoryPool {
        MemoryPool::new(
            PoolConfig::default()
                .with_block_size(48)
                .with_initial_blocks(initial)
                .with_max_blocks(max),
        )
        .unwrap()
    }

    #[test]
    fn test_block_size_rounding() {
        let pool = MemoryPool::new(PoolConfig::default().with_block_size(100).with_alignment(64))
            .unwrap();
        assert_eq!(pool.block_size(), 128);
        assert_eq!(pool.capacity(), 1024);
        assert_eq!(pool.alignment(), 64);

        let pool = MemoryPool::new(
            PoolConfig::default().with_block_size(8).with_alignment(0).with_initial_blocks(1),
        )
        .unwrap();
        assert_eq!(pool.alignment(), CACHE_LINE_SIZE);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            MemoryPool::new(PoolConfig::default().with_alignment(24)),
            Err(MemError::InvalidConfig(_))
        ));
        assert!(matches!(
            MemoryPool::new(PoolConfig::default().with_block_size(0)),
            Err(MemError::InvalidConfig(_))
        ));
        assert!(matches!(
            MemoryPool::new(PoolConfig::default().with_initial_blocks(10).with_max_blocks(4)),
            Err(MemError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_alloc_is_aligned_and_distinct() {
        let pool = small_pool(4, 0);
        let blocks: Vec<_> = (0..8).map(|_| pool.alloc().unwrap()).collect();
        for b in &blocks {
            assert_eq!(b.ptr.as_ptr() as usize % pool.alignment(), 0);
        }
        let mut addrs: Vec<_> = blocks.iter().map(|b| b.ptr.as_ptr() as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 8);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 8);
        assert_eq!(stats.in_use, 8);
        assert_eq!(stats.capacity, 8);
    }

    #[test]
    fn test_free_and_reuse() {
        let pool = small_pool(2, 0);
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        let b = pool.alloc().unwrap();

        // Same memory, newer generation.
        assert_eq!(a.ptr, b.ptr);
        assert_eq!(a.handle.index(), b.handle.index());
        assert_ne!(a.handle.generation(), b.handle.generation());
        assert!(pool.resolve(a.handle).is_none());
        assert_eq!(pool.resolve(b.handle), Some(b.ptr));
    }

    #[test]
    fn test_double_free_detected() {
        let pool = small_pool(2, 0);
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.free(a), Err(MemError::InvalidBlock));
        assert_eq!(pool.stats().freed, 1);
    }

    #[test]
    fn test_exhaustion() {
        let pool = small_pool(1, 2);
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert_eq!(pool.alloc(), Err(MemError::PoolExhausted { max_blocks: 2 }));

        let stats = pool.stats();
        assert_eq!(stats.total_allocs, 3);
        assert_eq!(stats.allocated, 2);
    }

    #[test]
    fn test_peak_tracking() {
        let pool = small_pool(8, 0);
        let blocks: Vec<_> = (0..5).map(|_| pool.alloc().unwrap()).collect();
        for b in blocks {
            pool.free(b).unwrap();
        }
        let _c = pool.alloc().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.peak_use, 5);
        assert_eq!(stats.in_use, 1);
    }

    #[test]
    fn test_free_zeroed_clears_contents() {
        let pool = small_pool(1, 0);
        let a = pool.alloc().unwrap();
        unsafe { ptr::write_bytes(a.ptr.as_ptr(), 0xEE, pool.block_size()) };
        pool.free_zeroed(a).unwrap();

        let b = pool.alloc().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(b.ptr.as_ptr(), pool.block_size()) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_foreign_block_rejected() {
        let p1 = small_pool(1, 0);
        let p2 = small_pool(1, 0);
        let a = p1.alloc().unwrap();
        let b = p2.alloc().unwrap();
        // Same index and generation, different address.
        assert_eq!(p2.free(a), Err(MemError::InvalidBlock));
        assert!(p1.owns(a.handle));
        p1.free(a).unwrap();
        p2.free(b).unwrap();
    }

    #[test]
    fn test_handle_word_roundtrip() {
        let pool = small_pool(1, 0);
        let a = pool.alloc().unwrap();
        let word = a.handle.to_word();
        assert_ne!(word, 0);
        assert_eq!(BlockHandle::from_word(word), Some(a.handle));
        assert_eq!(BlockHandle::from_word(0), None);
        assert_eq!(pool.block(a.handle), Some(a));
    }

    #[test]
    fn test_stats_serialize() {
        let pool = small_pool(2, 0);
        let _a = pool.alloc().unwrap();
        let json = serde_json::to_string(&pool.stats()).unwrap();
        let back: PoolStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pool.stats());
    }

    proptest::proptest! {
        #[test]
        fn alloc_free_sequences_keep_accounting(ops in proptest::collection::vec(proptest::bool::ANY, 1..200)) {
            let pool = small_pool(8, 0);
            let mut live: Vec<Block> = Vec::new();
            let mut dead: Vec<BlockHandle> = Vec::new();

            for alloc in ops {
                if alloc || live.is_empty() {
                    live.push(pool.alloc().unwrap());
                } else {
                    let block = live.swap_remove(0);
                    pool.free(block).unwrap();
                    dead.push(block.handle);
                }
            }

            proptest::prop_assert_eq!(pool.stats().in_use, live.len() as u64);
            proptest::prop_assert!(live.iter().all(|b| pool.is_live(b.handle)));
            proptest::prop_assert!(dead.iter().all(|h| !pool.is_live(*h)));
        }
    }
}
