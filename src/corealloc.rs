//! The core, stateful part of the allocator. Each `LocalAllocator` owns one
//! `CoreAllocator` once initialised; idle cores are recycled through the
//! pool.
//!
//! The core owns every slab it has handed objects out of. Per sizeclass it
//! keeps an available set of slabs with useful free lists; slabs drained
//! below the waking threshold sleep on the `laden` set until enough frees
//! come back. Frees from other threads arrive on the embedded message
//! queue and are applied lazily, from the slow paths.

use crate::backend::Backend;
use crate::entropy::LocalEntropy;
use crate::freelist::{FreeObject, Iter};
use crate::localcache::LocalCache;
use crate::metadata::{MetaEntry, SeqSet, SlabMetadata};
use crate::mpscq::RemoteAllocator;
use crate::platform;
use crate::sizeclass::{
    NUM_SMALL_SIZECLASSES, SizeClass, large_size_to_chunk_size, size_to_sizeclass,
    size_to_sizeclass_full, sizeclass_to_size, sizeclass_to_slab_size,
};
use crate::stat;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

/// Per-sizeclass slab bookkeeping: the available set plus counters that
/// drive the return-to-backend heuristic.
struct SlabMetadataCache {
    available: SeqSet,
    /// Slabs on `available`.
    length: u16,
    /// Of those, slabs that are completely free (`needed == 0`).
    unused: u16,
}

impl SlabMetadataCache {
    const fn new() -> Self {
        Self {
            available: SeqSet::new(),
            length: 0,
            unused: 0,
        }
    }
}

/// A pool-allocated allocator core. Storage is permanent; see `pool`.
pub struct CoreAllocator<B: Backend> {
    /// Link for the pool's idle stack.
    pub(crate) pool_next: *mut CoreAllocator<B>,
    /// Link for the pool's list of all allocators ever created.
    pub(crate) list_next: *mut CoreAllocator<B>,
    in_use: AtomicBool,

    alloc_classes: [SlabMetadataCache; NUM_SMALL_SIZECLASSES],

    /// Slabs that are full (or large allocations): sleeping, not usable for
    /// allocation until woken by frees.
    pub(crate) laden: SeqSet,

    /// Key material; copied into the attached cache so both verify the
    /// same signatures.
    entropy: LocalEntropy,

    /// Incoming frees from other threads. Its address is this allocator's
    /// identity in the pagemap.
    remote_alloc: RemoteAllocator,

    /// Backend scratch state (address-range caching and the like).
    backend_state: B::LocalState,

    /// The thread-local cache currently using this core, if any.
    pub(crate) attached_cache: *mut LocalCache,
}

impl<B: Backend> CoreAllocator<B> {
    /// A fresh, unusable core; `init` must run at its final address.
    pub fn new() -> Self {
        Self {
            pool_next: ptr::null_mut(),
            list_next: ptr::null_mut(),
            in_use: AtomicBool::new(false),
            alloc_classes: [const { SlabMetadataCache::new() }; NUM_SMALL_SIZECLASSES],
            laden: SeqSet::new(),
            entropy: LocalEntropy::new(),
            remote_alloc: RemoteAllocator::new(),
            backend_state: B::LocalState::default(),
            attached_cache: ptr::null_mut(),
        }
    }

    /// One-time setup: seed entropy (before any free list is built with
    /// its key) and prime the message queue at its final address.
    ///
    /// # Safety
    /// Must run exactly once, before the core is shared.
    pub unsafe fn init(&mut self) {
        self.entropy.init();
        unsafe { self.remote_alloc.init() };

        #[cfg(debug_assertions)]
        for sc in 0..NUM_SMALL_SIZECLASSES {
            let size = sizeclass_to_size(sc);
            debug_assert_eq!(size_to_sizeclass(size), sc);
        }
    }

    pub(crate) fn set_in_use(&self) {
        if self.in_use.swap(true, Ordering::AcqRel) {
            platform::fatal("Critical error: double use of pooled allocator");
        }
    }

    pub(crate) fn reset_in_use(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// The part of this allocator other threads may touch: the message
    /// queue. Its address names this allocator in pagemap entries.
    #[inline]
    pub fn public_state(&self) -> *mut RemoteAllocator {
        &self.remote_alloc as *const _ as *mut RemoteAllocator
    }

    #[inline]
    pub fn get_trunc_id(&self) -> usize {
        self.remote_alloc.trunc_id()
    }

    /// Associate a thread-local cache with this core: hand it the entropy
    /// and queue identity and reset its remote cache.
    ///
    /// # Safety
    /// `cache` must outlive the attachment and not move while attached.
    pub unsafe fn attach(&mut self, cache: *mut LocalCache) {
        self.attached_cache = cache;
        unsafe {
            (*cache).entropy = self.entropy;
            (*cache).remote_allocator = self.public_state();
            (*cache).remote_dealloc_cache.init();
        }
    }

    // ---- Message queue ----

    #[inline]
    pub fn has_messages(&self) -> bool {
        unsafe { self.remote_alloc.can_dequeue() }
    }

    /// Drain incoming frees if there are any. Inlines only the empty
    /// check.
    ///
    /// # Safety
    /// A cache must be attached.
    #[inline]
    pub unsafe fn handle_message_queue(&mut self) {
        if self.has_messages() {
            unsafe { self.handle_message_queue_inner() };
        }
    }

    /// Apply every queued message: frees for this allocator run the local
    /// dealloc paths, misrouted ones are re-batched and forwarded.
    #[cold]
    pub(crate) unsafe fn handle_message_queue_inner(&mut self) {
        let mut need_post = false;
        loop {
            let msg = unsafe { self.remote_alloc.dequeue_one(B::domesticate) };
            let Some(msg) = msg else { break };
            stat!(message_drain_count);
            let entry = B::get_metaentry(msg as usize);
            unsafe { self.handle_dealloc_remote(entry, msg as *mut u8, &mut need_post) };
        }
        if need_post {
            unsafe { self.post() };
        }
    }

    /// Apply one incoming free: locally if it is ours, otherwise stash it
    /// for forwarding (slot collisions and backend reuse races make
    /// mis-delivery legal).
    unsafe fn handle_dealloc_remote(
        &mut self,
        entry: &'static MetaEntry,
        p: *mut u8,
        need_post: &mut bool,
    ) {
        if entry.get_remote() == self.public_state() {
            unsafe {
                if !Self::dealloc_local_object_fast(entry, p, &mut self.entropy) {
                    self.dealloc_local_object_slow(p, entry);
                }
            }
        } else {
            let cache = self.attached_cache;
            debug_assert!(!cache.is_null());
            unsafe {
                if !*need_post && !(*cache).remote_dealloc_cache.reserve_space(entry, 1) {
                    *need_post = true;
                }
                (*cache)
                    .remote_dealloc_cache
                    .dealloc::<B>(entry.get_remote() as usize, p as *mut FreeObject);
            }
        }
    }

    /// Post the attached cache's batched deallocations to their owners.
    ///
    /// # Safety
    /// A cache must be attached.
    pub unsafe fn post(&mut self) -> bool {
        let cache = self.attached_cache;
        debug_assert!(!cache.is_null());
        unsafe { (*cache).remote_dealloc_cache.post::<B>(self.get_trunc_id()) }
    }

    // ---- Deallocation ----

    /// Free an object owned by this allocator.
    ///
    /// # Safety
    /// `p` must be the start of a live object owned by this core.
    pub unsafe fn dealloc_local_object(&mut self, p: *mut u8) {
        let entry = B::get_metaentry(p as usize);
        unsafe { self.dealloc_local_object_with(p, entry) };
    }

    /// As `dealloc_local_object`, with the pagemap entry already looked up.
    ///
    /// # Safety
    /// As `dealloc_local_object`; `entry` must be `p`'s entry.
    #[inline]
    pub unsafe fn dealloc_local_object_with(&mut self, p: *mut u8, entry: &'static MetaEntry) {
        unsafe {
            if Self::dealloc_local_object_fast(entry, p, &mut self.entropy) {
                stat!(dealloc_local_count);
                return;
            }
            self.dealloc_local_object_slow(p, entry);
        }
    }

    /// Push `p` onto its slab's free queue and count it. True if no slow
    /// path is needed.
    ///
    /// # Safety
    /// `entry` must be frontend-owned by this allocator and `p` the start
    /// of a live object in the corresponding slab.
    #[inline]
    pub(crate) unsafe fn dealloc_local_object_fast(
        entry: &MetaEntry,
        p: *mut u8,
        entropy: &mut LocalEntropy,
    ) -> bool {
        let meta = entry.get_slab_metadata();
        debug_assert!(!unsafe { (*meta).is_unused() });

        #[cfg(feature = "check-client")]
        if !crate::sizeclass::is_start_of_object(entry.get_sizeclass(), p as usize) {
            platform::fatal("Not deallocating start of an object");
        }

        let key = *entropy.free_list_key();
        unsafe {
            (*meta)
                .free_queue
                .add(p as *mut FreeObject, &key, entropy);
            !(*meta).return_object()
        }
    }

    /// The interesting deallocations: the last object of a large
    /// allocation, a free that wakes a sleeping slab, or the free that
    /// empties a slab.
    #[cold]
    pub(crate) unsafe fn dealloc_local_object_slow(&mut self, p: *mut u8, entry: &MetaEntry) {
        let meta = entry.get_slab_metadata();

        unsafe {
            if (*meta).is_large() {
                let size = 1usize << entry.get_sizeclass().as_large();
                self.laden.remove(meta);
                B::dealloc_chunk(&mut self.backend_state, meta, p, size);
                return;
            }

            let sizeclass = entry.get_sizeclass().as_small();

            if (*meta).is_sleeping() {
                // Enough frees have come back: wake the slab and make it
                // allocatable again.
                (*meta).set_not_sleeping(sizeclass);
                self.laden.remove(meta);
                self.alloc_classes[sizeclass].available.insert(meta);
                self.alloc_classes[sizeclass].length += 1;
                stat!(slab_wake_count);
                return;
            }

            // An active slab became completely free. Leave it available for
            // reuse, but once unused slabs pile up return them in bulk.
            let cache = &mut self.alloc_classes[sizeclass];
            cache.unused += 1;
            if cache.unused > 2 && cache.unused > (cache.length >> 2) {
                self.dealloc_local_slabs(sizeclass);
            }
        }
    }

    /// Sweep the available set of `sizeclass`, returning fully-free slabs
    /// to the backend.
    pub(crate) unsafe fn dealloc_local_slabs(&mut self, sizeclass: usize) {
        // Detach the set so the closure can use `self` freely.
        let mut avail = core::mem::replace(
            &mut self.alloc_classes[sizeclass].available,
            SeqSet::new(),
        );
        unsafe {
            avail.filter(|meta| unsafe {
                if (*meta).needed() != 0 {
                    #[cfg(feature = "check-client")]
                    {
                        let key = *self.entropy.free_list_key();
                        (*meta).free_queue.validate(&key, B::domesticate);
                    }
                    return false;
                }

                self.alloc_classes[sizeclass].length -= 1;
                self.alloc_classes[sizeclass].unused -= 1;

                let start = self.clear_slab(meta, sizeclass);
                B::dealloc_chunk(
                    &mut self.backend_state,
                    meta,
                    start,
                    sizeclass_to_slab_size(sizeclass),
                );
                stat!(slab_return_count);
                true
            });
        }
        self.alloc_classes[sizeclass].available = avail;
    }

    /// Close a fully-free slab's list and recover the slab base address.
    /// In client-check mode the whole list is walked so a lying count is
    /// caught before the chunk is reused.
    unsafe fn clear_slab(&mut self, meta: *mut SlabMetadata, sizeclass: usize) -> *mut u8 {
        let key = *self.entropy.free_list_key();
        unsafe {
            let (mut fl, _more) = (*meta).free_queue.close(&key);
            let p = fl.take(&key, B::domesticate);

            #[cfg(feature = "check-client")]
            {
                let mut count = 1u16;
                while !fl.empty() {
                    fl.take(&key, B::domesticate);
                    count += 1;
                }
                if _more > 0 {
                    let (mut fl2, none) = (*meta).free_queue.close(&key);
                    debug_assert_eq!(none, 0);
                    while !fl2.empty() {
                        fl2.take(&key, B::domesticate);
                        count += 1;
                    }
                }
                if count != crate::sizeclass::sizeclass_to_slab_object_count(sizeclass) {
                    platform::fatal("Heap corruption - free list corrupted!");
                }
            }

            ((p as usize) & !(sizeclass_to_slab_size(sizeclass) - 1)) as *mut u8
        }
    }

    // ---- Allocation ----

    /// Refill a fast free list for `sizeclass`, taking an available slab or
    /// asking the backend for a fresh one. Returns the first object.
    ///
    /// # Safety
    /// A cache must be attached; `fast_free_list` must be the attached
    /// cache's list for `sizeclass`.
    pub unsafe fn small_alloc(&mut self, sizeclass: usize, fast_free_list: &mut Iter) -> *mut u8 {
        if self.alloc_classes[sizeclass].length > 0 {
            let meta = unsafe { self.alloc_classes[sizeclass].available.pop() };
            self.alloc_classes[sizeclass].length -= 1;
            if unsafe { (*meta).needed() } == 0 {
                self.alloc_classes[sizeclass].unused -= 1;
            }

            let (p, still_active) = unsafe {
                SlabMetadata::alloc_free_list(
                    meta,
                    fast_free_list,
                    &mut self.entropy,
                    sizeclass,
                    B::domesticate,
                )
            };
            unsafe { self.requeue_slab(meta, sizeclass, still_active) };
            stat!(alloc_count);
            return p as *mut u8;
        }
        unsafe { self.small_alloc_slow(sizeclass, fast_free_list) }
    }

    /// No available slab: get a chunk from the backend and carve it.
    #[cold]
    unsafe fn small_alloc_slow(&mut self, sizeclass: usize, fast_free_list: &mut Iter) -> *mut u8 {
        let rsize = sizeclass_to_size(sizeclass);
        let slab_size = sizeclass_to_slab_size(sizeclass);

        let ras = MetaEntry::encode(self.public_state(), SizeClass::from_small(sizeclass));
        let (slab, meta) = unsafe { B::alloc_chunk(&mut self.backend_state, slab_size, ras) };
        if slab.is_null() {
            return ptr::null_mut();
        }

        unsafe {
            (*meta).initialise(sizeclass);
            Self::alloc_new_list(slab, meta, rsize, slab_size, &mut self.entropy);

            let (p, still_active) = SlabMetadata::alloc_free_list(
                meta,
                fast_free_list,
                &mut self.entropy,
                sizeclass,
                B::domesticate,
            );
            self.requeue_slab(meta, sizeclass, still_active);
            stat!(alloc_count);
            p as *mut u8
        }
    }

    unsafe fn requeue_slab(&mut self, meta: *mut SlabMetadata, sizeclass: usize, still_active: bool) {
        unsafe {
            if still_active {
                self.alloc_classes[sizeclass].length += 1;
                self.alloc_classes[sizeclass].available.insert(meta);
            } else {
                self.laden.insert(meta);
            }
        }
    }

    /// Turn an entire fresh slab into a free list.
    unsafe fn alloc_new_list(
        slab: *mut u8,
        meta: *mut SlabMetadata,
        rsize: usize,
        slab_size: usize,
        entropy: &mut LocalEntropy,
    ) {
        let key = *entropy.free_list_key();
        unsafe {
            let mut p = slab;
            // Stop while a whole object still fits.
            let end = slab.add(slab_size - rsize + 1);
            while p < end {
                (*meta).free_queue.add(p as *mut FreeObject, &key, entropy);
                p = p.add(rsize);
            }
        }
    }

    /// Allocate a power-of-two chunk for a request too big for the
    /// sizeclass engine. The chunk is tracked on the laden set so teardown
    /// and audits see it.
    ///
    /// # Safety
    /// `size` must be above the largest small sizeclass.
    pub unsafe fn large_alloc(&mut self, size: usize) -> *mut u8 {
        let chunk_size = large_size_to_chunk_size(size);
        let ras = MetaEntry::encode(self.public_state(), size_to_sizeclass_full(size));

        let (chunk, meta) = unsafe { B::alloc_chunk(&mut self.backend_state, chunk_size, ras) };
        if chunk.is_null() {
            return ptr::null_mut();
        }

        unsafe {
            (*meta).initialise_large();
            self.laden.insert(meta);
        }
        stat!(large_alloc_count);
        chunk
    }

    // ---- Teardown ----

    /// Drain the queue, return the attached cache's state, and sweep empty
    /// slabs back to the backend. Returns true if messages were posted to
    /// other allocators.
    ///
    /// # Safety
    /// A cache must be attached.
    pub unsafe fn flush(&mut self) -> bool {
        debug_assert!(!self.attached_cache.is_null());

        unsafe {
            // The drain normally only takes a batch; loop it dry.
            while self.has_messages() {
                self.handle_message_queue_inner();
            }

            let this = self as *mut Self;
            let posted = (*self.attached_cache)
                .flush::<B>(|p| unsafe { (*this).dealloc_local_object(p as *mut u8) });

            for sizeclass in 0..NUM_SMALL_SIZECLASSES {
                self.dealloc_local_slabs(sizeclass);
            }

            #[cfg(feature = "check-client")]
            {
                let key = *self.entropy.free_list_key();
                self.laden.iterate(|meta| unsafe {
                    if !(*meta).is_large() {
                        (*meta).free_queue.validate(&key, B::domesticate);
                    }
                });
            }

            posted
        }
    }

    /// True if this allocator holds no outstanding allocations. Attaches a
    /// temporary cache if needed so the flush paths can run.
    ///
    /// # Safety
    /// No thread may be using this allocator or freeing to it.
    pub unsafe fn debug_is_empty(&mut self) -> bool {
        unsafe {
            if self.attached_cache.is_null() {
                let mut temp = LocalCache::new();
                self.attach(&mut temp);
                let result = self.debug_is_empty_impl();
                self.flush();
                self.attached_cache = ptr::null_mut();
                result
            } else {
                self.debug_is_empty_impl()
            }
        }
    }

    unsafe fn debug_is_empty_impl(&mut self) -> bool {
        unsafe { self.flush() };

        // After the sweep, anything still on a set has live objects.
        for sizeclass in 0..NUM_SMALL_SIZECLASSES {
            if self.alloc_classes[sizeclass].length != 0 {
                return false;
            }
        }
        self.laden.is_empty()
    }
}

impl<B: Backend> Default for CoreAllocator<B> {
    fn default() -> Self {
        Self::new()
    }
}
