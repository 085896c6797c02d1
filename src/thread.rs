//! The std front end: one `LocalAllocator` per thread behind
//! `thread_local!`, and the `RxMalloc` type implementing `GlobalAlloc`.
//!
//! The thread-local slot carries a drop guard that tears the allocator
//! down at thread exit. Allocator calls arriving after that (late
//! destructors) are served by an ephemeral allocator that acquires a core,
//! performs the operation, and releases the core again before returning.

use crate::backend::GlobalBackend;
use crate::config::MIN_ALLOC_SIZE;
use crate::localalloc::LocalAllocator;
use crate::sizeclass::{aligned_size, round_size};
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr;

struct ThreadLocalAlloc(UnsafeCell<LocalAllocator<GlobalBackend>>);

impl Drop for ThreadLocalAlloc {
    fn drop(&mut self) {
        unsafe { (*self.0.get()).teardown() };
    }
}

std::thread_local! {
    static ALLOC: ThreadLocalAlloc =
        const { ThreadLocalAlloc(UnsafeCell::new(LocalAllocator::new())) };
}

#[inline]
fn with_alloc<R>(f: impl FnOnce(&mut LocalAllocator<GlobalBackend>) -> R) -> R {
    // The closure only runs if the slot is alive, so `f` survives for the
    // teardown path when it is not.
    let mut f = Some(f);
    match ALLOC.try_with(|a| (f.take().unwrap())(unsafe { &mut *a.0.get() })) {
        Ok(r) => r,
        Err(_) => teardown_op(f.take().unwrap()),
    }
}

/// The thread-local slot is gone (its destructor already ran): serve the
/// call with an ephemeral allocator that flushes before returning.
#[cold]
#[inline(never)]
fn teardown_op<R>(f: impl FnOnce(&mut LocalAllocator<GlobalBackend>) -> R) -> R {
    let mut temp = LocalAllocator::<GlobalBackend>::new();
    temp.begin_teardown();
    let r = f(&mut temp);
    unsafe { temp.teardown() };
    r
}

/// Message-passing allocator for Rust.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: rxmalloc::RxMalloc = rxmalloc::RxMalloc;
/// ```
pub struct RxMalloc;

/// Sizeclass sizes naturally align to their largest power-of-two factor,
/// and large chunks to their own size, so any alignment request collapses
/// to a size adjustment.
#[inline]
fn size_for_layout(layout: Layout) -> usize {
    if layout.align() <= MIN_ALLOC_SIZE {
        layout.size()
    } else {
        aligned_size(layout.align(), layout.size())
    }
}

unsafe impl GlobalAlloc for RxMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        with_alloc(|a| unsafe { a.alloc(size_for_layout(layout)) })
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        with_alloc(|a| unsafe { a.dealloc_sized(ptr, size_for_layout(layout)) })
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        with_alloc(|a| unsafe { a.alloc_zeroed(size_for_layout(layout)) })
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }

        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        // The pagemap knows the real usable size; the caller's layout may
        // be stale after an in-place shrink.
        let old_usable = with_alloc(|a| a.alloc_size(ptr));

        let new_request = if layout.align() <= MIN_ALLOC_SIZE {
            new_size
        } else {
            aligned_size(layout.align(), new_size)
        };

        // Same sizeclass: the allocation already fits, stay in place.
        if round_size(new_request) == old_usable {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            with_alloc(|a| unsafe { a.dealloc(ptr) });
        }
        new_ptr
    }
}
