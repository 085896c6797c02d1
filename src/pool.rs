//! Pool of reusable core allocators.
//!
//! Core allocators are never destroyed: their storage comes from backend
//! metadata memory and lives for the process. The pool keeps a stack of
//! idle allocators for reuse on thread creation and a list of every
//! allocator ever created for auditing. Both are guarded by one flag lock,
//! taken only on thread attach/detach, never on an allocation path.

use crate::backend::Backend;
use crate::corealloc::CoreAllocator;
use crate::platform;
use crate::sync::FlagLock;
use core::ptr;

struct PoolInner<B: Backend> {
    /// Stack of idle allocators, linked through `pool_next`.
    idle: *mut CoreAllocator<B>,
    /// Every allocator ever created, linked through `list_next`.
    all: *mut CoreAllocator<B>,
}

unsafe impl<B: Backend> Send for PoolInner<B> {}

/// Shared pool state; the backend provides a static instance.
pub struct PoolState<B: Backend> {
    inner: FlagLock<PoolInner<B>>,
}

impl<B: Backend> PoolState<B> {
    pub const fn new() -> Self {
        Self {
            inner: FlagLock::new(PoolInner {
                idle: ptr::null_mut(),
                all: ptr::null_mut(),
            }),
        }
    }
}

impl<B: Backend> Default for PoolState<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Take an allocator from the pool, creating one if none is idle.
/// A reused allocator keeps its queue and entropy; construction only runs
/// once per allocator lifetime.
pub unsafe fn acquire<B: Backend>() -> *mut CoreAllocator<B> {
    let pool = B::core_pool();

    {
        let mut inner = pool.inner.lock();
        let p = inner.idle;
        if !p.is_null() {
            inner.idle = unsafe { (*p).pool_next };
            drop(inner);
            unsafe { (*p).set_in_use() };
            return p;
        }
    }

    // Construct a new allocator outside the pool lock; the backend has its
    // own locking.
    let raw = unsafe {
        B::alloc_meta_data(
            core::mem::size_of::<CoreAllocator<B>>(),
            core::mem::align_of::<CoreAllocator<B>>(),
        )
    };
    if raw.is_null() {
        platform::fatal("Failed to initialise thread local allocator");
    }
    let p = raw as *mut CoreAllocator<B>;
    unsafe {
        ptr::write(p, CoreAllocator::new());
        (*p).init();
    }

    {
        let mut inner = pool.inner.lock();
        unsafe { (*p).list_next = inner.all };
        inner.all = p;
    }

    unsafe { (*p).set_in_use() };
    p
}

/// Return an allocator previously taken with [`acquire`]. Its state is kept
/// as-is for the next user.
pub unsafe fn release<B: Backend>(p: *mut CoreAllocator<B>) {
    unsafe { (*p).reset_in_use() };
    let pool = B::core_pool();
    let mut inner = pool.inner.lock();
    unsafe { (*p).pool_next = inner.idle };
    inner.idle = p;
}

/// Visit every allocator ever created. Not concurrency safe with respect to
/// allocator creation; intended for audits when the process is quiescent.
pub unsafe fn iterate<B: Backend>(mut f: impl FnMut(*mut CoreAllocator<B>)) {
    let head = {
        let inner = B::core_pool().inner.lock();
        inner.all
    };
    let mut curr = head;
    while !curr.is_null() {
        let next = unsafe { (*curr).list_next };
        f(curr);
        curr = next;
    }
}

/// Audit every allocator ever created for outstanding allocations: drains
/// queues and sweeps empty slabs first. True when nothing is live.
///
/// # Safety
/// Every thread using the allocator must have torn down; nothing may
/// allocate or free concurrently.
pub unsafe fn debug_check_empty<B: Backend>() -> bool {
    let mut all_empty = true;
    unsafe {
        iterate::<B>(|core| {
            if !unsafe { (*core).debug_is_empty() } {
                all_empty = false;
            }
        });
    }
    all_empty
}
