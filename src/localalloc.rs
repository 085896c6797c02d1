//! The thread-facing allocator: fast paths plus lazy initialisation.
//!
//! A `LocalAllocator` owns a `LocalCache` and lazily acquires a
//! `CoreAllocator` from the pool on its first slow path. Deallocation
//! decides ownership with one pagemap lookup: objects owned by the attached
//! core go straight onto their slab's free queue, everything else is
//! batched for posting to the owner.
//!
//! Allocator calls are legal during thread teardown: the slow path
//! re-acquires a core, performs the operation, and flushes again before
//! returning, so a late destructor never strands state.

use crate::backend::Backend;
use crate::corealloc::CoreAllocator;
use crate::freelist::FreeObject;
use crate::localcache::LocalCache;
use crate::metadata::MetaEntry;
use crate::mpscq::UNUSED_REMOTE;
use crate::pool;
use crate::sizeclass::{
    NUM_SMALL_SIZECLASSES, size_to_sizeclass, sizeclass_full_to_size, sizeclass_to_size,
};
use crate::stat;
use core::ptr;

pub struct LocalAllocator<B: Backend> {
    local_cache: LocalCache,

    /// Underlying allocator for everything off the fast path; null until
    /// the first slow path runs.
    core_alloc: *mut CoreAllocator<B>,

    /// Set once teardown has begun. Any operation that acquires a core
    /// afterwards must flush before returning, since no further teardown
    /// call will come.
    post_teardown: bool,
}

impl<B: Backend> LocalAllocator<B> {
    pub const fn new() -> Self {
        Self {
            local_cache: LocalCache::new(),
            core_alloc: ptr::null_mut(),
            post_teardown: false,
        }
    }

    /// Mark that teardown has begun before any operation runs; used for
    /// ephemeral allocators serving calls from late destructors.
    pub fn begin_teardown(&mut self) {
        self.post_teardown = true;
    }

    /// Acquire and attach a core allocator.
    #[cold]
    unsafe fn lazy_init(&mut self) {
        debug_assert!(self.core_alloc.is_null());
        let core = unsafe { pool::acquire::<B>() };
        unsafe { (*core).attach(&mut self.local_cache) };
        self.core_alloc = core;
    }

    /// Re-flush if this operation ran during teardown.
    #[inline]
    unsafe fn post_teardown_epilogue(&mut self) {
        if self.post_teardown && !self.core_alloc.is_null() {
            unsafe { self.flush() };
        }
    }

    // ---- Allocation ----

    /// Allocate `size` bytes. Returns null on OOM.
    ///
    /// # Safety
    /// The allocator must not be shared between threads.
    #[inline]
    pub unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        unsafe { self.alloc_inner::<false>(size) }
    }

    /// Allocate `size` zeroed bytes. Returns null on OOM.
    ///
    /// # Safety
    /// As `alloc`.
    #[inline]
    pub unsafe fn alloc_zeroed(&mut self, size: usize) -> *mut u8 {
        unsafe { self.alloc_inner::<true>(size) }
    }

    #[inline]
    unsafe fn alloc_inner<const ZERO: bool>(&mut self, size: usize) -> *mut u8 {
        // Small allocations are the common case; the subtraction sends both
        // zero and large sizes to the other branch.
        if size.wrapping_sub(1) <= sizeclass_to_size(NUM_SMALL_SIZECLASSES - 1) - 1 {
            return unsafe { self.small_alloc::<ZERO>(size) };
        }
        unsafe { self.alloc_not_small::<ZERO>(size) }
    }

    #[inline]
    unsafe fn small_alloc<const ZERO: bool>(&mut self, size: usize) -> *mut u8 {
        let sizeclass = size_to_sizeclass(size);
        let p = unsafe { self.local_cache.alloc(sizeclass, B::domesticate) } as *mut u8;
        if !p.is_null() {
            stat!(alloc_count);
            if ZERO {
                unsafe { ptr::write_bytes(p, 0, sizeclass_to_size(sizeclass)) };
            }
            return p;
        }
        unsafe { self.small_alloc_slow::<ZERO>(sizeclass) }
    }

    /// Fast list empty: initialise if needed, apply pending messages, and
    /// refill from the core allocator.
    #[cold]
    #[inline(never)]
    unsafe fn small_alloc_slow<const ZERO: bool>(&mut self, sizeclass: usize) -> *mut u8 {
        unsafe {
            if self.core_alloc.is_null() {
                self.lazy_init();
            }
            let core = self.core_alloc;
            (*core).handle_message_queue();

            let fl = &mut self.local_cache.fast_free_lists[sizeclass];
            let p = (*core).small_alloc(sizeclass, fl);
            if ZERO && !p.is_null() {
                ptr::write_bytes(p, 0, sizeclass_to_size(sizeclass));
            }
            self.post_teardown_epilogue();
            p
        }
    }

    /// Requests beyond the sizeclass engine get a power-of-two chunk.
    #[cold]
    #[inline(never)]
    unsafe fn alloc_not_small<const ZERO: bool>(&mut self, size: usize) -> *mut u8 {
        unsafe {
            if size == 0 {
                // Zero-size requests are served from the smallest class so
                // the result is a real, freeable pointer.
                return self.small_alloc::<ZERO>(1);
            }
            if size > isize::MAX as usize / 2 {
                // More than half the address space cannot succeed.
                return ptr::null_mut();
            }

            if self.core_alloc.is_null() {
                self.lazy_init();
            }
            let core = self.core_alloc;
            (*core).handle_message_queue();

            let p = (*core).large_alloc(size);
            if ZERO && !p.is_null() {
                ptr::write_bytes(p, 0, size);
            }
            self.post_teardown_epilogue();
            p
        }
    }

    // ---- Deallocation ----

    /// Free a pointer previously returned by this allocator family.
    /// Freeing null is a no-op.
    ///
    /// # Safety
    /// `p` must be null or a live allocation start; double frees are
    /// undefined (detected with `check-client`).
    #[inline]
    pub unsafe fn dealloc(&mut self, p: *mut u8) {
        let entry = B::get_metaentry(p as usize);
        if entry.get_remote() == self.local_cache.remote_allocator {
            // Owner fast path: attached implies the core exists.
            unsafe { (*self.core_alloc).dealloc_local_object_with(p, entry) };
            return;
        }
        unsafe { self.dealloc_remote(entry, p) };
    }

    /// Free with the caller's claimed size, validated in client-check
    /// builds against the pagemap's sizeclass.
    ///
    /// # Safety
    /// As `dealloc`.
    #[inline]
    pub unsafe fn dealloc_sized(&mut self, p: *mut u8, size: usize) {
        self.check_size(p, size);
        unsafe { self.dealloc(p) };
    }

    fn check_size(&self, p: *mut u8, size: usize) {
        #[cfg(feature = "check-client")]
        {
            if p.is_null() {
                return;
            }
            let entry = B::get_metaentry(p as usize);
            if entry.get_remote().is_null() || entry.is_backend_owned() {
                return;
            }
            let size = if size == 0 { 1 } else { size };
            if crate::sizeclass::size_to_sizeclass_full(size) != entry.get_sizeclass() {
                crate::platform::fatal("Dealloc rounded size mismatch");
            }
        }
        #[cfg(not(feature = "check-client"))]
        {
            let _ = (p, size);
        }
    }

    /// The pointer is not owned by the attached allocator: a foreign
    /// object, null, or garbage.
    unsafe fn dealloc_remote(&mut self, entry: &'static MetaEntry, p: *mut u8) {
        let remote = entry.get_remote();
        if !remote.is_null() && !entry.is_backend_owned() {
            if self.local_cache.remote_dealloc_cache.reserve_space(entry, 1) {
                unsafe {
                    self.local_cache
                        .remote_dealloc_cache
                        .dealloc::<B>(remote as usize, p as *mut FreeObject);
                }
                return;
            }
            unsafe { self.dealloc_remote_slow(entry, p) };
            return;
        }

        if p.is_null() {
            return;
        }

        // Unknown pointer, or memory already returned to the backend.
        #[cfg(feature = "check-client")]
        crate::platform::fatal("Not allocated by this allocator");
    }

    /// No budget (or no allocator yet) for a remote free.
    #[cold]
    #[inline(never)]
    unsafe fn dealloc_remote_slow(&mut self, entry: &'static MetaEntry, p: *mut u8) {
        unsafe {
            if !self.core_alloc.is_null() {
                // Budget exhausted: stash this one too, then post the lot.
                self.local_cache
                    .remote_dealloc_cache
                    .dealloc::<B>(entry.get_remote() as usize, p as *mut FreeObject);
                (*self.core_alloc).post();
                self.post_teardown_epilogue();
                return;
            }

            // First free this thread has ever seen: acquire an allocator
            // and redo the dealloc. The pool may even hand back the core
            // that owns `p`.
            self.lazy_init();
            self.dealloc(p);
            self.post_teardown_epilogue();
        }
    }

    // ---- Introspection and teardown ----

    /// Usable size of an allocation; 0 for null or foreign pointers.
    pub fn alloc_size(&self, p: *const u8) -> usize {
        let entry = B::get_metaentry(p as usize);
        sizeclass_full_to_size(entry.get_sizeclass())
    }

    /// Return all cached state and give the core back to the pool. The
    /// allocator remains usable; the next operation re-initialises.
    pub unsafe fn flush(&mut self) {
        if !self.core_alloc.is_null() {
            let core = self.core_alloc;
            unsafe {
                (*core).flush();
                (*core).attached_cache = ptr::null_mut();
                pool::release(core);
            }
            self.core_alloc = ptr::null_mut();
            self.local_cache.remote_allocator = UNUSED_REMOTE;
            self.local_cache.remote_dealloc_cache.disable();
        }
    }

    /// Thread-exit hook. Operations arriving after this are still served,
    /// each re-flushing on its way out.
    pub unsafe fn teardown(&mut self) {
        self.post_teardown = true;
        if !self.core_alloc.is_null() {
            unsafe { self.flush() };
        }
    }
}

impl<B: Backend> Default for LocalAllocator<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GlobalBackend;
    use alloc::vec::Vec;

    fn with_allocator(f: impl FnOnce(&mut LocalAllocator<GlobalBackend>)) {
        let mut a = LocalAllocator::<GlobalBackend>::new();
        f(&mut a);
        unsafe { a.teardown() };
    }

    #[test]
    fn test_alloc_write_free() {
        with_allocator(|a| unsafe {
            let p = a.alloc(24);
            assert!(!p.is_null());
            assert!(a.alloc_size(p) >= 24);
            (p as *mut u64).write(0xdeadbeef);
            assert_eq!((p as *mut u64).read(), 0xdeadbeef);
            a.dealloc(p);
        });
    }

    #[test]
    fn test_zero_size_alloc_is_freeable() {
        with_allocator(|a| unsafe {
            let p = a.alloc(0);
            assert!(!p.is_null());
            assert!(a.alloc_size(p) > 0);
            a.dealloc(p);
        });
    }

    #[test]
    fn test_null_free_is_noop() {
        with_allocator(|a| unsafe {
            a.dealloc(ptr::null_mut());
            a.dealloc_sized(ptr::null_mut(), 64);
        });
    }

    #[test]
    fn test_alloc_zeroed_after_reuse() {
        with_allocator(|a| unsafe {
            // Dirty an object, free it, and ask for zeroed memory of the
            // same class; the stale bytes must be gone.
            let size = 256;
            let p = a.alloc(size);
            ptr::write_bytes(p, 0xAB, size);
            a.dealloc(p);

            let q = a.alloc_zeroed(size);
            for i in 0..size {
                assert_eq!(*q.add(i), 0, "byte {} not zeroed", i);
            }
            a.dealloc(q);
        });
    }

    #[test]
    fn test_fast_path_reuses_objects() {
        with_allocator(|a| unsafe {
            let mut seen = Vec::new();
            for _ in 0..10_000 {
                let p = a.alloc(48);
                assert!(!p.is_null());
                a.dealloc(p);
                if !seen.contains(&(p as usize)) {
                    seen.push(p as usize);
                }
            }
            // Churning one object must cycle within a bounded working set,
            // not consume fresh memory per iteration.
            let capacity =
                crate::sizeclass::sizeclass_to_slab_object_count(size_to_sizeclass(48)) as usize;
            assert!(
                seen.len() <= 2 * capacity,
                "{} distinct addresses for a churn of one object",
                seen.len()
            );
        });
    }

    #[test]
    fn test_alloc_size_of_foreign_pointer_is_zero() {
        with_allocator(|a| {
            let local = 0usize;
            assert_eq!(a.alloc_size(&local as *const usize as *const u8), 0);
            assert_eq!(a.alloc_size(ptr::null()), 0);
        });
    }

    #[test]
    fn test_oversized_request_fails_cleanly() {
        with_allocator(|a| unsafe {
            assert!(a.alloc(usize::MAX / 2).is_null());
        });
    }
}
