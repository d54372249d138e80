//! # lfcs-mem
//!
//! The memory subsystem underneath the Lock-Free Convergence Store.
//!
//! ## Architecture
//!
//! - **atomic**: Ordered atomic helpers, tagged indices, cache-line padding
//! - **pool**: Lock-free fixed-size block pool with generation-checked handles
//! - **hazard**: Hazard-pointer domains, per-thread guards and retire lists
//!
//! Containers built on top allocate their nodes from a [`MemoryPool`] and
//! defer freeing them through a [`HazardDomain`], so readers on other
//! threads never observe reclaimed memory.

pub mod atomic;
pub mod error;
pub mod hazard;
pub mod pool;

pub use atomic::{
    fence_acquire, fence_release, fence_seq_cst, secure_zero, AtomicArith, AtomicTaggedIndex,
    CacheAligned, OrderedAtomic, TaggedIndex, CACHE_LINE_SIZE,
};
pub use error::{MemError, Result};
pub use hazard::{
    Cleanup, HazardConfig, HazardDomain, HazardGuard, RetireList, MAX_HAZARD_POINTERS,
    MAX_HAZARD_THREADS,
};
pub use pool::{Block, BlockHandle, MemoryPool, PoolConfig, PoolStats, MAX_POOL_BLOCKS};
