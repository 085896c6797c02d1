//! End-to-end behavior of the allocation surface: small round trips, large
//! rounding, zeroing, and usable sizes.

use rxmalloc::{GlobalBackend, LocalAllocator};

#[test]
fn small_alloc_round_trip() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        let p = a.alloc(24);
        assert!(!p.is_null());
        assert!(a.alloc_size(p) >= 24);

        // The allocation is writable and holds its value.
        (p as *mut u64).write(0xdeadbeef);
        assert_eq!((p as *mut u64).read(), 0xdeadbeef);

        a.dealloc(p);
        a.teardown();
    }
}

#[test]
fn every_small_size_works() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        let mut live = Vec::new();
        for size in (1..4096).step_by(37) {
            let p = a.alloc(size);
            assert!(!p.is_null(), "alloc({}) failed", size);
            assert!(a.alloc_size(p) >= size);
            // Touch both ends.
            *p = 0xA5;
            *p.add(size - 1) = 0x5A;
            live.push(p);
        }
        for p in live {
            a.dealloc(p);
        }
        a.teardown();
    }
}

#[test]
fn large_alloc_rounds_to_power_of_two() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        let size = 9 * 1024 * 1024;
        let p = a.alloc(size);
        assert!(!p.is_null());
        assert_eq!(a.alloc_size(p), 16 * 1024 * 1024);
        assert_eq!(p as usize % (16 * 1024 * 1024), 0);

        *p = 1;
        *p.add(size - 1) = 2;

        a.dealloc(p);

        // The freed chunk is cached and comes straight back.
        let q = a.alloc(size);
        assert_eq!(q, p);
        a.dealloc(q);
        a.teardown();
    }
}

#[test]
fn alloc_zeroed_scrubs_reused_memory() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        for size in [64usize, 1024, 70_000] {
            let p = a.alloc(size);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0xCD, size);
            a.dealloc(p);

            let q = a.alloc_zeroed(size);
            assert!(!q.is_null());
            for i in (0..size).step_by(7) {
                assert_eq!(*q.add(i), 0, "size {} byte {} dirty", size, i);
            }
            a.dealloc(q);
        }
        a.teardown();
    }
}

#[test]
fn distinct_live_allocations_are_disjoint() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        let sizes = [16usize, 48, 96, 200, 1024, 5000, 20_000];
        let mut live: Vec<(usize, usize)> = Vec::new();
        for round in 0..50 {
            let size = sizes[round % sizes.len()];
            let p = a.alloc(size) as usize;
            assert!(p != 0);
            let len = a.alloc_size(p as *const u8);
            for &(q, qlen) in &live {
                assert!(
                    p + len <= q || q + qlen <= p,
                    "ranges overlap: {:#x}+{} and {:#x}+{}",
                    p,
                    len,
                    q,
                    qlen
                );
            }
            live.push((p, len));
        }
        for (p, _) in live {
            a.dealloc(p as *mut u8);
        }
        a.teardown();
    }
}

#[test]
fn null_and_zero_size_edges() {
    let mut a = LocalAllocator::<GlobalBackend>::new();
    unsafe {
        // Zero-size requests still return real pointers.
        let p = a.alloc(0);
        assert!(!p.is_null());
        a.dealloc(p);

        // Null frees are no-ops.
        a.dealloc(core::ptr::null_mut());

        // alloc_size of null is zero.
        assert_eq!(a.alloc_size(core::ptr::null()), 0);
        a.teardown();
    }
}
