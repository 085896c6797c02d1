//! Thread-local allocation state: the fast free lists, the thread's
//! entropy, and the remote dealloc cache.
//!
//! A `LocalCache` is owned by one `LocalAllocator` and attached to at most
//! one core allocator at a time. It outlives attach/detach cycles during
//! thread teardown, which is why it is separate from the core allocator
//! itself.

use crate::backend::Backend;
use crate::freelist::{FreeObject, Iter, Wild};
use crate::entropy::LocalEntropy;
use crate::mpscq::{RemoteAllocator, UNUSED_REMOTE};
use crate::remotecache::RemoteDeallocCache;
use crate::sizeclass::{NUM_SMALL_SIZECLASSES, SizeClass, is_start_of_object};

/// Per-thread cache: one fast free list per small sizeclass, plus the
/// machinery for deallocations that do not belong to this thread.
pub struct LocalCache {
    /// Fast allocation path, one closed free list per small sizeclass.
    pub fast_free_lists: [Iter; NUM_SMALL_SIZECLASSES],

    /// This thread's key material and randomness. A copy of the attached
    /// core allocator's entropy, so both sides verify the same signatures.
    pub entropy: LocalEntropy,

    /// The attached allocator's message queue; the dealloc fast path
    /// compares against the pagemap entry's owner. Sentinel when detached.
    pub remote_allocator: *mut RemoteAllocator,

    /// Deallocations owned by other threads, batched until posted.
    pub remote_dealloc_cache: RemoteDeallocCache,
}

impl LocalCache {
    pub const fn new() -> Self {
        Self {
            fast_free_lists: [const { Iter::new() }; NUM_SMALL_SIZECLASSES],
            entropy: LocalEntropy::new(),
            remote_allocator: UNUSED_REMOTE,
            remote_dealloc_cache: RemoteDeallocCache::new(),
        }
    }

    /// Pop from the fast free list for `sizeclass`, or null if it is empty
    /// and the slow path must refill.
    ///
    /// # Safety
    /// The cache must be attached (lists are only non-empty when it is).
    #[inline]
    pub unsafe fn alloc(
        &mut self,
        sizeclass: usize,
        domesticate: impl Fn(Wild) -> *mut FreeObject,
    ) -> *mut FreeObject {
        let key = *self.entropy.free_list_key();
        let fl = &mut self.fast_free_lists[sizeclass];
        if !fl.empty() {
            let p = unsafe { fl.take(&key, domesticate) };
            debug_assert!(is_start_of_object(
                SizeClass::from_small(sizeclass),
                p as usize
            ));
            return p;
        }
        core::ptr::null_mut()
    }

    /// Return every cached object through `dealloc` and post the remote
    /// cache. Used during teardown. Returns true if messages were sent to
    /// other allocators.
    ///
    /// # Safety
    /// The cache must be attached; `dealloc` must accept objects owned by
    /// the attached allocator.
    pub unsafe fn flush<B: Backend>(&mut self, mut dealloc: impl FnMut(*mut FreeObject)) -> bool {
        let key = *self.entropy.free_list_key();
        for sizeclass in 0..NUM_SMALL_SIZECLASSES {
            let fl = &mut self.fast_free_lists[sizeclass];
            while !fl.empty() {
                let p = unsafe { fl.take(&key, B::domesticate) };
                debug_assert!(is_start_of_object(
                    SizeClass::from_small(sizeclass),
                    p as usize
                ));
                dealloc(p);
            }
        }

        let id = unsafe { (*self.remote_allocator).trunc_id() };
        unsafe { self.remote_dealloc_cache.post::<B>(id) }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}
