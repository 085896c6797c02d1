//! Per-slab metadata, the pagemap entry format, and the intrusive sets that
//! hold slabs.
//!
//! A slab is always in exactly one place: a sizeclass's available set, the
//! owner's laden set (full or large), or back with the backend. `needed`
//! counts deallocations until the next interesting event and means one of
//! two things, disambiguated by `sleeping`: frees until the slab is worth
//! waking (sleeping) or frees until it is completely empty (active). The
//! fast path only ever decrements and tests for zero.

use crate::entropy::LocalEntropy;
use crate::freelist::{FreeObject, Iter, Wild};
use crate::mpscq::RemoteAllocator;
use crate::sizeclass::{
    REMOTE_MIN_ALIGN, SizeClass, sizeclass_to_slab_object_count, threshold_for_waking_slab,
};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "check-client")]
pub type SlabFreeQueue = crate::freelist::Builder<true>;
#[cfg(not(feature = "check-client"))]
pub type SlabFreeQueue = crate::freelist::Builder<false>;

/// Metadata for one slab (or one large allocation).
///
/// Allocated from the backend's metadata arena, never from a slab, so a
/// client overwrite of heap objects cannot reach it directly.
#[repr(C)]
pub struct SlabMetadata {
    /// Intrusive links for the available/laden sets and the metadata
    /// arena's free list. Only the set currently holding the slab touches
    /// them.
    next: *mut SlabMetadata,
    prev: *mut SlabMetadata,

    /// Builder collecting freed objects of this slab.
    pub free_queue: SlabFreeQueue,

    /// Deallocations until the next slow-path event. See the module doc.
    needed: u16,

    /// Not on any available set.
    sleeping: bool,

    /// This "slab" is a single large allocation.
    large: bool,
}

impl SlabMetadata {
    pub const fn new() -> Self {
        Self {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            free_queue: SlabFreeQueue::new(),
            needed: 0,
            sleeping: false,
            large: false,
        }
    }

    /// Set up metadata for a fresh small-object slab. The slab is treated
    /// as if the entire free list were already built, so the bump-carving
    /// path needs no special cases.
    pub fn initialise(&mut self, sizeclass: usize) {
        self.free_queue.init();
        self.set_sleeping(sizeclass, 0);
        self.large = false;
    }

    /// Set up metadata for a large allocation: the first deallocation goes
    /// straight to the slow path.
    pub fn initialise_large(&mut self) {
        self.free_queue.init();
        self.large = true;
        self.needed = 1;
        self.sleeping = false;
    }

    /// Account one returned object. True when the countdown hits zero and
    /// the slow path must run.
    #[inline]
    pub fn return_object(&mut self) -> bool {
        self.needed -= 1;
        self.needed == 0
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.needed == 0
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.large
    }

    #[inline]
    pub fn needed(&self) -> u16 {
        self.needed
    }

    /// The intrusive link doubles as the metadata arena's free-list link
    /// while the metadata is backend-owned.
    pub(crate) fn arena_next(&self) -> *mut SlabMetadata {
        self.next
    }

    pub(crate) fn set_arena_next(&mut self, next: *mut SlabMetadata) {
        self.next = next;
    }

    /// Try to put the slab to sleep given `remaining` free objects. Below
    /// the waking threshold it sleeps and the countdown targets the
    /// threshold; otherwise it stays active and the countdown targets
    /// empty.
    #[inline]
    pub fn set_sleeping(&mut self, sizeclass: usize, remaining: u16) -> bool {
        let threshold = threshold_for_waking_slab(sizeclass);
        if remaining >= threshold {
            self.needed = sizeclass_to_slab_object_count(sizeclass) - remaining;
            self.sleeping = false;
            return false;
        }

        self.sleeping = true;
        self.needed = threshold - remaining;
        true
    }

    /// Wake the slab: it now has `waking` free objects, so the countdown
    /// retargets empty.
    #[inline]
    pub fn set_not_sleeping(&mut self, sizeclass: usize) {
        self.needed =
            sizeclass_to_slab_object_count(sizeclass) - threshold_for_waking_slab(sizeclass);
        // The threshold is strictly below the slab's capacity, so a woken
        // slab always has objects left to free.
        debug_assert!(self.needed != 0);
        self.sleeping = false;
    }

    /// Close the slab's free queue into a fast free list, returning the
    /// first object and whether the slab should stay on the available set.
    ///
    /// With randomisation only part of the slab is handed out, so the slab
    /// may stay available with the retained remainder.
    ///
    /// # Safety
    /// `meta` must be initialised for `sizeclass` with a non-empty free
    /// queue built with `entropy`'s key.
    pub unsafe fn alloc_free_list(
        meta: *mut SlabMetadata,
        fast_free_list: &mut Iter,
        entropy: &mut LocalEntropy,
        sizeclass: usize,
        domesticate: impl Fn(Wild) -> *mut FreeObject,
    ) -> (*mut FreeObject, bool) {
        let key = *entropy.free_list_key();
        let (mut fl, remaining) = unsafe { (*meta).free_queue.close(&key) };
        let p = unsafe { fl.take(&key, domesticate) };
        *fast_free_list = fl;

        #[cfg(feature = "check-client")]
        entropy.refresh_bits();

        let sleeping = unsafe { (*meta).set_sleeping(sizeclass, remaining) };
        (p, !sleeping)
    }
}

impl Default for SlabMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Intrusive doubly-linked set of slabs, linked through `SlabMetadata`'s
/// next/prev fields. Null means empty; every fresh metadata block is
/// explicitly initialised, nothing relies on zeroed heap memory.
pub struct SeqSet {
    head: *mut SlabMetadata,
}

impl SeqSet {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub fn peek(&self) -> *mut SlabMetadata {
        self.head
    }

    /// # Safety
    /// `m` must be valid and not on any set.
    pub unsafe fn insert(&mut self, m: *mut SlabMetadata) {
        unsafe {
            (*m).next = self.head;
            (*m).prev = ptr::null_mut();
            if !self.head.is_null() {
                (*self.head).prev = m;
            }
            self.head = m;
        }
    }

    /// # Safety
    /// The set's links must be intact.
    pub unsafe fn pop(&mut self) -> *mut SlabMetadata {
        let m = self.head;
        if !m.is_null() {
            unsafe { self.remove(m) };
        }
        m
    }

    /// # Safety
    /// `m` must currently be on this set.
    pub unsafe fn remove(&mut self, m: *mut SlabMetadata) {
        unsafe {
            let prev = (*m).prev;
            let next = (*m).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*m).prev = ptr::null_mut();
            (*m).next = ptr::null_mut();
        }
    }

    /// Remove every element `f` returns true for. Once `f` returns true it
    /// owns the element and the set will not touch it again — the splice
    /// uses links captured before the call, since `f` may hand the storage
    /// to another owner.
    ///
    /// # Safety
    /// The set's links must be intact.
    pub unsafe fn filter(&mut self, mut f: impl FnMut(*mut SlabMetadata) -> bool) {
        let mut curr = self.head;
        while !curr.is_null() {
            let (prev, next) = unsafe { ((*curr).prev, (*curr).next) };
            if f(curr) {
                unsafe {
                    if prev.is_null() {
                        self.head = next;
                    } else {
                        (*prev).next = next;
                    }
                    if !next.is_null() {
                        (*next).prev = prev;
                    }
                }
            }
            curr = next;
        }
    }

    /// Visit every element without removing any.
    ///
    /// # Safety
    /// The set's links must be intact; `f` must not mutate them.
    pub unsafe fn iterate(&mut self, mut f: impl FnMut(*mut SlabMetadata)) {
        let mut curr = self.head;
        while !curr.is_null() {
            let next = unsafe { (*curr).next };
            f(curr);
            curr = next;
        }
    }
}

impl Default for SeqSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Discriminates backend-owned pagemap entries from frontend-owned ones.
pub const REMOTE_BACKEND_MARKER: usize = 1 << 7;

/// Marks the first chunk of an OS reservation that must not be merged with
/// the preceding address space.
pub const META_BOUNDARY_BIT: usize = 1 << 0;

const _: () = assert!((REMOTE_MIN_ALIGN >> 1) == REMOTE_BACKEND_MARKER);

/// One pagemap entry per chunk: a pointer to the slab metadata (low bit
/// reserved for the reservation-boundary flag) and the owning message queue
/// bit-packed with the sizeclass (bit 7 reserved for the backend marker).
///
/// Loads are relaxed: entries are written before a chunk is handed out and
/// the chunk pointer itself carries the happens-before edge to any thread
/// that can legitimately look the entry up.
#[repr(C)]
pub struct MetaEntry {
    meta: AtomicUsize,
    remote_and_sizeclass: AtomicUsize,
}

impl MetaEntry {
    pub const fn zeroed() -> Self {
        Self {
            meta: AtomicUsize::new(0),
            remote_and_sizeclass: AtomicUsize::new(0),
        }
    }

    /// Pack an owning queue pointer and a sizeclass into one word. The
    /// queue's 256-byte alignment leaves room for the sizeclass tag and the
    /// backend marker below it.
    #[inline]
    pub fn encode(remote: *const RemoteAllocator, sizeclass: SizeClass) -> usize {
        debug_assert!((remote as usize) % REMOTE_MIN_ALIGN == 0);
        (remote as usize) + sizeclass.raw()
    }

    /// Install frontend ownership of this entry.
    pub fn set(&self, meta: *mut SlabMetadata, ras: usize) {
        debug_assert!((ras & REMOTE_BACKEND_MARKER) == 0);
        let boundary = self.meta.load(Ordering::Relaxed) & META_BOUNDARY_BIT;
        self.meta
            .store(meta as usize | boundary, Ordering::Release);
        self.remote_and_sizeclass.store(ras, Ordering::Release);
    }

    /// Reset to a pristine backend-owned state, preserving the boundary
    /// bit.
    pub fn claim_for_backend(&self) {
        let boundary = self.meta.load(Ordering::Relaxed) & META_BOUNDARY_BIT;
        self.meta.store(boundary, Ordering::Release);
        self.remote_and_sizeclass
            .store(REMOTE_BACKEND_MARKER, Ordering::Release);
    }

    #[inline]
    pub fn is_backend_owned(&self) -> bool {
        (self.remote_and_sizeclass.load(Ordering::Relaxed) & REMOTE_BACKEND_MARKER)
            == REMOTE_BACKEND_MARKER
    }

    #[inline]
    pub fn is_unowned(&self) -> bool {
        let meta = self.meta.load(Ordering::Relaxed);
        (meta == 0 || meta == META_BOUNDARY_BIT)
            && self.remote_and_sizeclass.load(Ordering::Relaxed) == 0
    }

    /// The owning message queue. For backend-owned entries the marker bit
    /// survives the mask, so the result never compares equal to a real
    /// (256-byte-aligned) queue pointer.
    #[inline]
    pub fn get_remote(&self) -> *mut RemoteAllocator {
        (self.remote_and_sizeclass.load(Ordering::Relaxed) & !(REMOTE_BACKEND_MARKER - 1))
            as *mut RemoteAllocator
    }

    #[inline]
    pub fn get_sizeclass(&self) -> SizeClass {
        SizeClass::from_raw(
            self.remote_and_sizeclass.load(Ordering::Relaxed) & (REMOTE_BACKEND_MARKER - 1),
        )
    }

    /// The slab metadata, meaningful only while the entry is
    /// frontend-owned.
    #[inline]
    pub fn get_slab_metadata(&self) -> *mut SlabMetadata {
        debug_assert!(!self.get_remote().is_null());
        (self.meta.load(Ordering::Relaxed) & !META_BOUNDARY_BIT) as *mut SlabMetadata
    }

    pub fn set_boundary(&self) {
        self.meta
            .fetch_or(META_BOUNDARY_BIT, Ordering::Relaxed);
    }

    pub fn is_boundary(&self) -> bool {
        (self.meta.load(Ordering::Relaxed) & META_BOUNDARY_BIT) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizeclass::{size_to_sizeclass, sizeclass_to_slab_object_count, threshold_for_waking_slab};
    use alloc::boxed::Box;

    fn fresh_meta() -> *mut SlabMetadata {
        Box::leak(Box::new(SlabMetadata::new()))
    }

    #[test]
    fn test_initialise_starts_sleeping() {
        let m = unsafe { &mut *fresh_meta() };
        let sc = size_to_sizeclass(48);
        m.initialise(sc);
        assert!(m.is_sleeping());
        assert!(!m.is_large());
        assert_eq!(m.needed(), threshold_for_waking_slab(sc));
    }

    #[test]
    fn test_set_sleeping_thresholds() {
        let m = unsafe { &mut *fresh_meta() };
        let sc = size_to_sizeclass(48);
        let capacity = sizeclass_to_slab_object_count(sc);
        let waking = threshold_for_waking_slab(sc);
        m.initialise(sc);

        // Plenty of objects left: stays active, counting down to empty.
        assert!(!m.set_sleeping(sc, waking));
        assert!(!m.is_sleeping());
        assert_eq!(m.needed(), capacity - waking);

        // Too few left: sleeps, counting down to the waking threshold.
        assert!(m.set_sleeping(sc, 0));
        assert!(m.is_sleeping());
        assert_eq!(m.needed(), waking);
    }

    #[test]
    fn test_wake_transition() {
        let m = unsafe { &mut *fresh_meta() };
        let sc = size_to_sizeclass(128);
        let capacity = sizeclass_to_slab_object_count(sc);
        let waking = threshold_for_waking_slab(sc);
        m.initialise(sc);

        // Frees trickle in until the slab is worth waking.
        let mut woke = false;
        for _ in 0..waking {
            woke = m.return_object();
        }
        assert!(woke);
        m.set_not_sleeping(sc);
        assert!(!m.is_sleeping());
        assert_eq!(m.needed(), capacity - waking);
    }

    #[test]
    fn test_large_lifecycle() {
        let m = unsafe { &mut *fresh_meta() };
        m.initialise_large();
        assert!(m.is_large());
        assert!(!m.is_unused());
        // First (only) dealloc goes straight to the slow path.
        assert!(m.return_object());
        assert!(m.is_unused());
    }

    #[test]
    fn test_seqset_insert_remove() {
        let mut set = SeqSet::new();
        assert!(set.is_empty());

        let a = fresh_meta();
        let b = fresh_meta();
        let c = fresh_meta();
        unsafe {
            set.insert(a);
            set.insert(b);
            set.insert(c);
            assert_eq!(set.peek(), c);

            // Remove the middle element.
            set.remove(b);
            assert_eq!(set.pop(), c);
            assert_eq!(set.pop(), a);
            assert!(set.is_empty());
            assert!(set.pop().is_null());
        }
    }

    #[test]
    fn test_seqset_filter() {
        let mut set = SeqSet::new();
        let metas: alloc::vec::Vec<_> = (0..6).map(|_| fresh_meta()).collect();
        unsafe {
            for &m in &metas {
                set.insert(m);
            }
            // Keep only the even-index elements.
            let mut removed = 0;
            set.filter(|m| {
                let keep = metas.iter().step_by(2).any(|&e| e == m);
                if !keep {
                    removed += 1;
                }
                !keep
            });
            assert_eq!(removed, 3);

            let mut count = 0;
            set.iterate(|_| count += 1);
            assert_eq!(count, 3);
        }
    }

    #[test]
    fn test_metaentry_round_trip() {
        let remote = Box::leak(Box::new(RemoteAllocator::new()));
        let meta = fresh_meta();
        let sc = SizeClass::from_small(size_to_sizeclass(96));

        let entry = MetaEntry::zeroed();
        assert!(entry.is_unowned());

        entry.set(meta, MetaEntry::encode(remote, sc));
        assert!(!entry.is_backend_owned());
        assert_eq!(entry.get_remote(), remote as *mut RemoteAllocator);
        assert_eq!(entry.get_sizeclass(), sc);
        assert_eq!(entry.get_slab_metadata(), meta);
    }

    #[test]
    fn test_metaentry_backend_claim_preserves_boundary() {
        let remote = Box::leak(Box::new(RemoteAllocator::new()));
        let meta = fresh_meta();
        let sc = SizeClass::from_small(0);

        let entry = MetaEntry::zeroed();
        entry.set_boundary();
        entry.set(meta, MetaEntry::encode(remote, sc));
        assert!(entry.is_boundary());

        entry.claim_for_backend();
        assert!(entry.is_backend_owned());
        assert!(entry.is_boundary());
        // A backend-owned entry must never alias a real queue pointer.
        assert_ne!(entry.get_remote(), remote as *mut RemoteAllocator);
    }
}
