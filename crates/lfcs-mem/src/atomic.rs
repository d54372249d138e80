//! Ordered atomic primitives.
//!
//! Every operation here carries a fixed memory ordering: loads acquire,
//! stores release, read-modify-write operations are acquire-release.
//! The pool and the hazard domain go through these helpers only, so the
//! ordering contract of the whole memory subsystem is readable in one file.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{
    compiler_fence, fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// Cache line size assumed for padding hot atomics. Matches the alignment
/// of [`CacheAligned`] on every target.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86"))]
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache line size assumed for padding hot atomics. Matches the alignment
/// of [`CacheAligned`] on every target.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86")))]
pub const CACHE_LINE_SIZE: usize = 32;

/// Atomic operations with the acquire/release discipline baked in.
pub trait OrderedAtomic {
    type Value: Copy + PartialEq;

    fn load_acquire(&self) -> Self::Value;
    fn store_release(&self, value: Self::Value);
    fn swap_acq_rel(&self, value: Self::Value) -> Self::Value;

    /// Strong compare-and-swap. `Err` carries the value actually observed.
    fn compare_swap(&self, current: Self::Value, new: Self::Value)
        -> Result<Self::Value, Self::Value>;

    /// Weak compare-and-swap; may fail spuriously, use inside retry loops.
    fn compare_swap_weak(
        &self,
        current: Self::Value,
        new: Self::Value,
    ) -> Result<Self::Value, Self::Value>;
}

/// Integer read-modify-write operations, all acquire-release.
pub trait AtomicArith: OrderedAtomic {
    fn fetch_add_acq_rel(&self, value: Self::Value) -> Self::Value;
    fn fetch_sub_acq_rel(&self, value: Self::Value) -> Self::Value;
    fn fetch_or_acq_rel(&self, value: Self::Value) -> Self::Value;
    fn fetch_and_acq_rel(&self, value: Self::Value) -> Self::Value;
    fn fetch_max_acq_rel(&self, value: Self::Value) -> Self::Value;
}

macro_rules! impl_ordered_atomic {
    ($atomic:ty, $value:ty) => {
        impl OrderedAtomic for $atomic {
            type Value = $value;

            #[inline]
            fn load_acquire(&self) -> $value {
                self.load(Ordering::Acquire)
            }

            #[inline]
            fn store_release(&self, value: $value) {
                self.store(value, Ordering::Release)
            }

            #[inline]
            fn swap_acq_rel(&self, value: $value) -> $value {
                self.swap(value, Ordering::AcqRel)
            }

            #[inline]
            fn compare_swap(&self, current: $value, new: $value) -> Result<$value, $value> {
                self.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            }

            #[inline]
            fn compare_swap_weak(&self, current: $value, new: $value) -> Result<$value, $value> {
                self.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            }
        }
    };
}

macro_rules! impl_atomic_arith {
    ($atomic:ty) => {
        impl AtomicArith for $atomic {
            #[inline]
            fn fetch_add_acq_rel(&self, value: Self::Value) -> Self::Value {
                self.fetch_add(value, Ordering::AcqRel)
            }

            #[inline]
            fn fetch_sub_acq_rel(&self, value: Self::Value) -> Self::Value {
                self.fetch_sub(value, Ordering::AcqRel)
            }

            #[inline]
            fn fetch_or_acq_rel(&self, value: Self::Value) -> Self::Value {
                self.fetch_or(value, Ordering::AcqRel)
            }

            #[inline]
            fn fetch_and_acq_rel(&self, value: Self::Value) -> Self::Value {
                self.fetch_and(value, Ordering::AcqRel)
            }

            #[inline]
            fn fetch_max_acq_rel(&self, value: Self::Value) -> Self::Value {
                self.fetch_max(value, Ordering::AcqRel)
            }
        }
    };
}

impl_ordered_atomic!(AtomicBool, bool);
impl_ordered_atomic!(AtomicU32, u32);
impl_ordered_atomic!(AtomicU64, u64);
impl_ordered_atomic!(AtomicUsize, usize);

impl_atomic_arith!(AtomicU32);
impl_atomic_arith!(AtomicU64);
impl_atomic_arith!(AtomicUsize);

impl<T> OrderedAtomic for AtomicPtr<T> {
    type Value = *mut T;

    #[inline]
    fn load_acquire(&self) -> *mut T {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn store_release(&self, value: *mut T) {
        self.store(value, Ordering::Release)
    }

    #[inline]
    fn swap_acq_rel(&self, value: *mut T) -> *mut T {
        self.swap(value, Ordering::AcqRel)
    }

    #[inline]
    fn compare_swap(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        self.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    #[inline]
    fn compare_swap_weak(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        self.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

#[inline]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

#[inline]
pub fn fence_release() {
    fence(Ordering::Release);
}

/// Full sequentially-consistent fence. Hazard publication depends on it.
#[inline]
pub fn fence_seq_cst() {
    fence(Ordering::SeqCst);
}

/// Busy-wait hint for CAS retry loops.
#[inline]
pub fn spin_hint() {
    std::hint::spin_loop();
}

/// Overwrites `buf` with zeros in a way the optimizer may not elide.
pub fn secure_zero(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, exclusive reference into `buf`.
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Pads and aligns a value to its own cache line.
#[derive(Debug, Default)]
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86"),
    repr(align(64))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86")),
    repr(align(32))
)]
pub struct CacheAligned<T>(pub T);

impl<T> CacheAligned<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// A 32-bit index paired with a 32-bit version tag.
///
/// Packed into a single `u64` so that a list head can be swapped with one
/// compare-and-swap. Every successful update bumps the tag, which is what
/// defeats the ABA problem on free lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedIndex {
    pub index: u32,
    pub tag: u32,
}

impl TaggedIndex {
    /// Sentinel index meaning "no entry".
    pub const NIL: u32 = u32::MAX;

    pub const fn new(index: u32, tag: u32) -> Self {
        Self { index, tag }
    }

    pub const fn nil() -> Self {
        Self::new(Self::NIL, 0)
    }

    pub const fn is_nil(&self) -> bool {
        self.index == Self::NIL
    }

    /// The successor head: a new index and the next tag.
    pub const fn advance(&self, index: u32) -> Self {
        Self::new(index, self.tag.wrapping_add(1))
    }

    pub const fn pack(self) -> u64 {
        ((self.tag as u64) << 32) | self.index as u64
    }

    pub const fn unpack(word: u64) -> Self {
        Self::new(word as u32, (word >> 32) as u32)
    }
}

/// Atomic cell holding a [`TaggedIndex`].
#[derive(Debug)]
pub struct AtomicTaggedIndex(AtomicU64);

impl AtomicTaggedIndex {
    pub const fn new(value: TaggedIndex) -> Self {
        Self(AtomicU64::new(value.pack()))
    }

    pub fn load(&self) -> TaggedIndex {
        TaggedIndex::unpack(self.0.load_acquire())
    }

    pub fn store(&self, value: TaggedIndex) {
        self.0.store_release(value.pack())
    }

    /// Installs `new` if the cell still holds `current`, index and tag both.
    pub fn compare_swap(&self, current: TaggedIndex, new: TaggedIndex) -> Result<(), TaggedIndex> {
        self.0
            .compare_swap(current.pack(), new.pack())
            .map(|_| ())
            .map_err(TaggedIndex::unpack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_index_packing() {
        let t = TaggedIndex::new(7, 3);
        assert_eq!(TaggedIndex::unpack(t.pack()), t);
        assert_eq!(t.pack(), (3u64 << 32) | 7);

        let nil = TaggedIndex::nil();
        assert!(nil.is_nil());
        assert!(!t.is_nil());
    }

    #[test]
    fn test_advance_bumps_tag() {
        let t = TaggedIndex::new(1, u32::MAX);
        let next = t.advance(2);
        assert_eq!(next.index, 2);
        assert_eq!(next.tag, 0);
    }

    #[test]
    fn test_tagged_cas_rejects_stale_tag() {
        let cell = AtomicTaggedIndex::new(TaggedIndex::new(5, 0));
        let seen = cell.load();

        // Same index, different tag: a stale observer must fail.
        cell.store(TaggedIndex::new(5, 1));
        assert_eq!(cell.compare_swap(seen, seen.advance(9)), Err(TaggedIndex::new(5, 1)));

        let seen = cell.load();
        assert!(cell.compare_swap(seen, seen.advance(9)).is_ok());
        assert_eq!(cell.load(), TaggedIndex::new(9, 2));
    }

    #[test]
    fn test_ordered_ops() {
        let v = AtomicU64::new(10);
        assert_eq!(v.fetch_add_acq_rel(5), 10);
        assert_eq!(v.fetch_sub_acq_rel(3), 15);
        assert_eq!(v.fetch_max_acq_rel(100), 12);
        assert_eq!(v.load_acquire(), 100);
        assert_eq!(v.compare_swap(1, 2), Err(100));
        assert_eq!(v.compare_swap(100, 2), Ok(100));
        assert_eq!(v.swap_acq_rel(0b1100), 2);
        assert_eq!(v.fetch_and_acq_rel(0b0100), 0b1100);
        assert_eq!(v.fetch_or_acq_rel(0b0001), 0b0100);
        assert_eq!(v.load_acquire(), 0b0101);

        let flag = AtomicBool::new(false);
        assert!(flag.compare_swap(false, true).is_ok());
        assert!(flag.load_acquire());
    }

    #[test]
    fn test_secure_zero() {
        let mut buf = [0xAAu8; 37];
        secure_zero(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_cache_aligned_layout() {
        assert_eq!(std::mem::align_of::<CacheAligned<AtomicU64>>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::align_of::<CacheAligned<u8>>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::size_of::<CacheAligned<u8>>() % CACHE_LINE_SIZE, 0);
        let c = CacheAligned::new(AtomicU32::new(4));
        assert_eq!(c.load_acquire(), 4);
    }
}
