//! Hazard-pointer safe memory reclamation.
//!
//! A [`HazardDomain`] owns a lock-free list of per-thread records. Each
//! record carries [`MAX_HAZARD_POINTERS`] slots in which a thread announces
//! the words (block handles, object addresses) it is about to dereference.
//! Retired words are only reclaimed once no announced slot holds them.
//!
//! Threads join a domain through [`HazardDomain::register`], which hands
//! back a [`HazardGuard`]. The guard is pinned to its thread; dropping it
//! clears its slots, passes any still-protected retirements to the domain
//! and frees the record for reuse.

use crate::atomic::{fence_seq_cst, AtomicArith, OrderedAtomic};
use crate::error::{MemError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Hazard slots per thread.
pub const MAX_HAZARD_POINTERS: usize = 4;

/// Default cap on registered threads per domain.
pub const MAX_HAZARD_THREADS: usize = 128;

/// Deferred destruction of a retired word.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Hazard domain parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HazardConfig {
    /// Maximum simultaneously registered threads.
    pub max_threads: usize,
    /// Retire-list length that triggers a reclamation scan.
    pub reclaim_threshold: usize,
}

impl Default for HazardConfig {
    fn default() -> Self {
        Self {
            max_threads: MAX_HAZARD_THREADS,
            reclaim_threshold: MAX_HAZARD_THREADS * MAX_HAZARD_POINTERS * 2,
        }
    }
}

impl HazardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(MemError::InvalidConfig("max_threads must be non-zero".into()));
        }
        if self.reclaim_threshold == 0 {
            return Err(MemError::InvalidConfig("reclaim_threshold must be non-zero".into()));
        }
        Ok(())
    }
}

struct HazardRecord {
    hazards: [AtomicU64; MAX_HAZARD_POINTERS],
    active: AtomicBool,
    next: *mut HazardRecord,
}

struct Retired {
    word: u64,
    cleanup: Cleanup,
}

/// Words retired by one owner and not yet reclaimed.
#[derive(Default)]
pub struct RetireList {
    items: Vec<Retired>,
}

impl RetireList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push(&mut self, word: u64, cleanup: Cleanup) {
        self.items.push(Retired { word, cleanup });
    }
}

impl std::fmt::Debug for RetireList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetireList").field("len", &self.items.len()).finish()
    }
}

struct OrphanBatch {
    items: Vec<Retired>,
    next: *mut OrphanBatch,
}

/// A set of hazard records plus the retirements abandoned by departed owners.
pub struct HazardDomain {
    head: AtomicPtr<HazardRecord>,
    record_count: AtomicUsize,
    orphans: AtomicPtr<OrphanBatch>,
    reclaimed: AtomicU64,
    config: HazardConfig,
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::from_valid_config(HazardConfig::default())
    }
}

impl HazardDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: HazardConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: HazardConfig) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            record_count: AtomicUsize::new(0),
            orphans: AtomicPtr::new(ptr::null_mut()),
            reclaimed: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &HazardConfig {
        &self.config
    }

    /// Registers the calling thread, reusing an inactive record when one exists.
    pub fn register(self: &Arc<Self>) -> Result<HazardGuard> {
        let record = match self.acquire_record() {
            Some(record) => record,
            None => self.push_record()?,
        };
        Ok(HazardGuard {
            domain: Arc::clone(self),
            record,
            retired: RetireList::new(),
            _not_send: PhantomData,
        })
    }

    fn acquire_record(&self) -> Option<NonNull<HazardRecord>> {
        let mut cur = self.head.load_acquire();
        while let Some(record) = NonNull::new(cur) {
            // SAFETY: records are never freed before the domain.
            let r = unsafe { record.as_ref() };
            if r.active.compare_swap(false, true).is_ok() {
                trace!("reused hazard record");
                return Some(record);
            }
            cur = r.next;
        }
        None
    }

    fn push_record(&self) -> Result<NonNull<HazardRecord>> {
        let max = self.config.max_threads;
        self.record_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| MemError::RecordsExhausted(max))?;

        let record = Box::into_raw(Box::new(HazardRecord {
            hazards: Default::default(),
            active: AtomicBool::new(true),
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.head.load_acquire();
            // SAFETY: `record` is not yet published; we are its only user.
            unsafe { (*record).next = head };
            if self.head.compare_swap_weak(head, record).is_ok() {
                break;
            }
        }
        debug!(records = self.record_count(), "hazard record registered");
        // SAFETY: Box::into_raw never returns null.
        Ok(unsafe { NonNull::new_unchecked(record) })
    }

    fn records(&self) -> impl Iterator<Item = &HazardRecord> {
        let mut cur = self.head.load_acquire();
        std::iter::from_fn(move || {
            // SAFETY: records live as long as the domain.
            let r = unsafe { cur.as_ref()? };
            cur = r.next;
            Some(r)
        })
    }

    /// Records ever created, active or not.
    pub fn record_count(&self) -> usize {
        self.record_count.load_acquire()
    }

    pub fn active_records(&self) -> usize {
        self.records().filter(|r| r.active.load_acquire()).count()
    }

    /// Whether any registered thread currently announces `word`.
    pub fn is_protected(&self, word: u64) -> bool {
        word != 0
            && self
                .records()
                .filter(|r| r.active.load_acquire())
                .any(|r| r.hazards.iter().any(|h| h.load_acquire() == word))
    }

    fn protected_words(&self) -> HashSet<u64> {
        self.records()
            .filter(|r| r.active.load_acquire())
            .flat_map(|r| r.hazards.iter().map(|h| h.load_acquire()))
            .filter(|&w| w != 0)
            .collect()
    }

    /// Adds `word` to `list`, scanning once the list reaches the threshold.
    /// Returns the number of words reclaimed by this call.
    pub fn retire(&self, list: &mut RetireList, word: u64, cleanup: Cleanup) -> usize {
        list.push(word, cleanup);
        if list.len() >= self.config.reclaim_threshold {
            self.reclaim(list)
        } else {
            0
        }
    }

    /// Runs the cleanup of every retired word in `list` that no thread protects.
    pub fn reclaim(&self, list: &mut RetireList) -> usize {
        if list.is_empty() {
            return 0;
        }
        fence_seq_cst();
        let hazards = self.protected_words();

        let mut reclaimed = 0;
        for retired in std::mem::take(&mut list.items) {
            if hazards.contains(&retired.word) {
                list.items.push(retired);
            } else {
                (retired.cleanup)();
                reclaimed += 1;
            }
        }

        self.reclaimed.fetch_add_acq_rel(reclaimed as u64);
        trace!(reclaimed, pending = list.len(), "hazard scan");
        reclaimed
    }

    /// Moves every orphaned retirement into `list`.
    pub fn adopt_orphans(&self, list: &mut RetireList) {
        let mut cur = self.orphans.swap_acq_rel(ptr::null_mut());
        while !cur.is_null() {
            // SAFETY: batches are boxed in `abandon` and popped exactly once here.
            let batch = unsafe { Box::from_raw(cur) };
            cur = batch.next;
            list.items.extend(batch.items);
        }
    }

    /// Hands a retire list whose owner is going away to the domain.
    pub fn abandon(&self, list: RetireList) {
        if list.is_empty() {
            return;
        }
        let count = list.len();
        let batch = Box::into_raw(Box::new(OrphanBatch {
            items: list.items,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.orphans.load_acquire();
            // SAFETY: `batch` is unpublished until the CAS succeeds.
            unsafe { (*batch).next = head };
            if self.orphans.compare_swap_weak(head, batch).is_ok() {
                break;
            }
        }
        trace!(count, "retirements orphaned");
    }

    /// Reclaims what it can from the orphan stack; the rest goes back.
    pub fn reclaim_orphans(&self) -> usize {
        let mut list = RetireList::new();
        self.adopt_orphans(&mut list);
        let reclaimed = self.reclaim(&mut list);
        self.abandon(list);
        reclaimed
    }

    /// Total words reclaimed over the domain's life.
    pub fn reclaimed_total(&self) -> u64 {
        self.reclaimed.load_acquire()
    }
}

impl std::fmt::Debug for HazardDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardDomain")
            .field("records", &self.record_count())
            .field("active", &self.active_records())
            .field("reclaimed", &self.reclaimed_total())
            .finish()
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // No guard can be alive here: each one holds an Arc to the domain.
        let mut pending = RetireList::new();
        self.adopt_orphans(&mut pending);
        let count = pending.len();
        for retired in pending.items {
            (retired.cleanup)();
        }

        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: records were boxed in `push_record` and are unreachable now.
            let record = unsafe { Box::from_raw(cur) };
            cur = record.next;
        }
        debug!(drained = count, "hazard domain destroyed");
    }
}

/// A thread's membership in a [`HazardDomain`].
///
/// Not `Send`: the record it owns belongs to the registering thread.
pub struct HazardGuard {
    domain: Arc<HazardDomain>,
    record: NonNull<HazardRecord>,
    retired: RetireList,
    _not_send: PhantomData<*mut ()>,
}

impl HazardGuard {
    fn record(&self) -> &HazardRecord {
        // SAFETY: the record outlives the domain Arc held by this guard.
        unsafe { self.record.as_ref() }
    }

    fn slot(&self, slot: usize) -> Result<&AtomicU64> {
        self.record().hazards.get(slot).ok_or(MemError::InvalidSlot(slot))
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    /// Whether this guard was registered with `domain`.
    pub fn belongs_to(&self, domain: &Arc<HazardDomain>) -> bool {
        Arc::ptr_eq(&self.domain, domain)
    }

    /// Announces the current value of `src` in `slot` and returns it.
    ///
    /// Loops until the value read after the announcement matches the one
    /// announced, so the returned word was protected while still reachable.
    pub fn protect(&self, slot: usize, src: &AtomicU64) -> Result<u64> {
        let hazard = self.slot(slot)?;
        let mut word = src.load_acquire();
        loop {
            hazard.store_release(word);
            fence_seq_cst();
            let again = src.load_acquire();
            if again == word {
                return Ok(word);
            }
            word = again;
        }
    }

    /// Pointer flavour of [`protect`](Self::protect).
    pub fn protect_ptr<T>(&self, slot: usize, src: &AtomicPtr<T>) -> Result<*mut T> {
        let hazard = self.slot(slot)?;
        let mut ptr = src.load_acquire();
        loop {
            hazard.store_release(ptr as usize as u64);
            fence_seq_cst();
            let again = src.load_acquire();
            if again == ptr {
                return Ok(ptr);
            }
            ptr = again;
        }
    }

    /// Current announcement in `slot`; zero when empty.
    pub fn announced(&self, slot: usize) -> Result<u64> {
        Ok(self.slot(slot)?.load_acquire())
    }

    pub fn clear(&self, slot: usize) -> Result<()> {
        self.slot(slot)?.store_release(0);
        Ok(())
    }

    pub fn clear_all(&self) {
        for hazard in &self.record().hazards {
            hazard.store_release(0);
        }
    }

    /// Retires `word` on this thread's list; `cleanup` runs once it is unprotected.
    pub fn retire(&mut self, word: u64, cleanup: impl FnOnce() + Send + 'static) -> usize {
        self.domain.retire(&mut self.retired, word, Box::new(cleanup))
    }

    /// Scans this thread's list, orphans included.
    pub fn reclaim(&mut self) -> usize {
        self.domain.adopt_orphans(&mut self.retired);
        self.domain.reclaim(&mut self.retired)
    }

    pub fn pending(&self) -> usize {
        self.retired.len()
    }
}

impl std::fmt::Debug for HazardGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardGuard").field("pending", &self.retired.len()).finish()
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.clear_all();
        self.domain.reclaim(&mut self.retired);
        self.domain.abandon(std::mem::take(&mut self.retired));
        self.record().active.store_release(false);
        trace!("hazard record released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Cleanup) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let make = move || -> Cleanup {
            let c = Arc::clone(&c);
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn test_register_and_reuse_record() {
        let domain = Arc::new(HazardDomain::new());
        let g1 = domain.register().unwrap();
        assert_eq!(domain.record_count(), 1);
        drop(g1);
        assert_eq!(domain.active_records(), 0);

        let _g2 = domain.register().unwrap();
        assert_eq!(domain.record_count(), 1);
        assert_eq!(domain.active_records(), 1);
    }

    #[test]
    fn test_records_exhausted() {
        let domain = Arc::new(
            HazardDomain::with_config(HazardConfig { max_threads: 2, reclaim_threshold: 8 })
                .unwrap(),
        );
        let _a = domain.register().unwrap();
        let _b = domain.register().unwrap();
        assert_eq!(domain.register().unwrap_err(), MemError::RecordsExhausted(2));
    }

    #[test]
    fn test_protect_announces_value() {
        let domain = Arc::new(HazardDomain::new());
        let guard = domain.register().unwrap();
        let src = AtomicU64::new(42);

        assert_eq!(guard.protect(1, &src).unwrap(), 42);
        assert_eq!(guard.announced(1).unwrap(), 42);
        assert!(domain.is_protected(42));

        guard.clear(1).unwrap();
        assert!(!domain.is_protected(42));
        assert_eq!(guard.protect(MAX_HAZARD_POINTERS, &src), Err(MemError::InvalidSlot(4)));
    }

    #[test]
    fn test_protected_word_survives_reclaim() {
        let domain = Arc::new(HazardDomain::new());
        let reader = domain.register().unwrap();
        let mut writer = domain.register().unwrap();
        let (count, cleanup) = counter();

        let src = AtomicU64::new(7);
        reader.protect(0, &src).unwrap();

        writer.retire(7, cleanup());
        writer.retire(8, cleanup());
        assert_eq!(writer.reclaim(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(writer.pending(), 1);

        reader.clear(0).unwrap();
        assert_eq!(writer.reclaim(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_threshold_triggers_scan() {
        let domain = Arc::new(
            HazardDomain::with_config(HazardConfig { max_threads: 4, reclaim_threshold: 3 })
                .unwrap(),
        );
        let mut guard = domain.register().unwrap();
        let (count, cleanup) = counter();

        assert_eq!(guard.retire(1, cleanup()), 0);
        assert_eq!(guard.retire(2, cleanup()), 0);
        assert_eq!(guard.retire(3, cleanup()), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(domain.reclaimed_total(), 3);
    }

    #[test]
    fn test_guard_drop_orphans_protected_words() {
        let domain = Arc::new(HazardDomain::new());
        let reader = domain.register().unwrap();
        let (count, cleanup) = counter();
        let src = AtomicU64::new(99);
        reader.protect(0, &src).unwrap();

        {
            let mut writer = domain.register().unwrap();
            writer.retire(99, cleanup());
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        drop(reader);
        assert_eq!(domain.reclaim_orphans(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_domain_drop_runs_pending_cleanups() {
        let (count, cleanup) = counter();
        {
            let domain = Arc::new(HazardDomain::new());
            let mut list = RetireList::new();
            domain.retire(&mut list, 5, cleanup());
            domain.retire(&mut list, 6, cleanup());
            domain.abandon(list);
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_config() {
        assert!(HazardDomain::with_config(HazardConfig { max_threads: 0, reclaim_threshold: 1 })
            .is_err());
        assert!(HazardDomain::with_config(HazardConfig { max_threads: 1, reclaim_threshold: 0 })
            .is_err());
    }
}
