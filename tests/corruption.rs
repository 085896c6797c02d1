//! Client-check mode detects heap abuse before it propagates. These tests
//! need `check-client` (the mitigations) and `testing` (aborts become
//! panics so they can be asserted on).
//!
//! A dedicated `LocalAllocator` per test keeps the panicked allocator's
//! state out of the shared thread-local path.

#![cfg(all(feature = "check-client", feature = "testing"))]

use rxmalloc::{GlobalBackend, LocalAllocator};

#[test]
#[should_panic(expected = "free list corrupted")]
fn overwritten_free_object_is_detected() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    let capacity = rxmalloc::sizeclass::sizeclass_to_slab_object_count(
        rxmalloc::sizeclass::size_to_sizeclass(64),
    ) as usize;

    unsafe {
        // Fill roughly one slab, then free everything so its free queue
        // holds all the objects again.
        let ptrs: Vec<*mut u8> = (0..capacity).map(|_| a.alloc(64)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        for &p in &ptrs {
            a.dealloc(p);
        }

        // A use-after-free scribble over one freed object's header.
        let victim = ptrs[capacity / 2];
        core::ptr::write_bytes(victim, 0xAA, 16);

        // Allocate until the corrupted object would be handed back out;
        // the checks trip before it is re-issued.
        for _ in 0..capacity * 2 {
            a.alloc(64);
        }
        unreachable!("corrupted object was re-issued");
    }
}

#[test]
#[should_panic(expected = "start of an object")]
fn interior_pointer_free_is_detected() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        let p = a.alloc(64);
        assert!(!p.is_null());
        a.dealloc(p.add(8));
    }
}

#[test]
#[should_panic(expected = "size mismatch")]
fn sized_free_mismatch_is_detected() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        let p = a.alloc(64);
        assert!(!p.is_null());
        a.dealloc_sized(p, 4096);
    }
}

#[test]
#[should_panic(expected = "Not allocated by this allocator")]
fn foreign_pointer_free_is_detected() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    let local = 0u64;
    unsafe {
        // Initialise the allocator first so the free cannot be served by
        // lazy-init re-dispatch.
        let p = a.alloc(32);
        a.dealloc(p);
        a.dealloc(&local as *const u64 as *mut u8);
    }
}
