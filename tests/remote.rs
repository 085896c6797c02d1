//! Cross-thread deallocation: objects freed by a foreign thread travel
//! back to their owner as messages and become allocatable again.

#![cfg(feature = "std")]

use rxmalloc::RxMalloc;
use std::alloc::{GlobalAlloc, Layout};
use std::collections::HashSet;

static GLOBAL: RxMalloc = RxMalloc;

#[test]
fn cross_thread_free_returns_memory_to_owner() {
    const COUNT: usize = 10_000;
    const SIZE: usize = 96;
    let layout = Layout::from_size_align(SIZE, 8).unwrap();

    // This thread owns a batch of objects...
    let first: Vec<usize> = (0..COUNT)
        .map(|_| {
            let p = unsafe { GLOBAL.alloc(layout) };
            assert!(!p.is_null());
            p as usize
        })
        .collect();
    let first_set: HashSet<usize> = first.iter().copied().collect();

    // ...which another thread frees. Its exit flushes the remote cache, so
    // after the join every free has been posted to our queue.
    let to_free = first.clone();
    std::thread::spawn(move || {
        for addr in to_free {
            unsafe { GLOBAL.dealloc(addr as *mut u8, layout) };
        }
    })
    .join()
    .unwrap();

    // Allocating again drains the queue and reuses the same slabs.
    let mut reused = 0;
    let mut second = Vec::with_capacity(COUNT);
    for _ in 0..COUNT {
        let p = unsafe { GLOBAL.alloc(layout) };
        assert!(!p.is_null());
        if first_set.contains(&(p as usize)) {
            reused += 1;
        }
        second.push(p);
    }

    assert!(
        reused * 2 >= COUNT,
        "only {}/{} allocations reused remotely-freed memory",
        reused,
        COUNT
    );

    for p in second {
        unsafe { GLOBAL.dealloc(p, layout) };
    }
}

#[test]
fn ping_pong_many_rounds() {
    // Repeatedly hand small batches to a peer for freeing; the byte budget
    // of the remote cache forces posts well before thread exit.
    const ROUNDS: usize = 20;
    const BATCH: usize = 500;
    let layout = Layout::from_size_align(128, 8).unwrap();

    for _ in 0..ROUNDS {
        let batch: Vec<usize> = (0..BATCH)
            .map(|_| {
                let p = unsafe { GLOBAL.alloc(layout) };
                assert!(!p.is_null());
                // Freed-object headers land in these bytes later; make sure
                // client data is visibly distinct now.
                unsafe { core::ptr::write_bytes(p, 0x7E, 128) };
                p as usize
            })
            .collect();

        std::thread::spawn(move || {
            for addr in batch {
                let p = addr as *mut u8;
                // The object must still hold our pattern when the foreign
                // thread receives it.
                for i in 0..128 {
                    assert_eq!(unsafe { *p.add(i) }, 0x7E);
                }
                unsafe { GLOBAL.dealloc(p, layout) };
            }
        })
        .join()
        .unwrap();
    }
}

#[test]
fn many_owners_many_freers() {
    // Every thread allocates and hands its objects to the next thread in a
    // ring, so every allocator both posts and drains.
    use std::sync::mpsc;

    const THREADS: usize = 4;
    const PER_THREAD: usize = 2_000;
    let layout = Layout::from_size_align(64, 8).unwrap();

    let mut senders = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..THREADS {
        let (tx, rx) = mpsc::channel::<usize>();
        senders.push(tx);
        receivers.push(Some(rx));
    }

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let tx = senders[(tid + 1) % THREADS].clone();
        let rx = receivers[tid].take().unwrap();
        handles.push(std::thread::spawn(move || {
            for i in 0..PER_THREAD {
                let p = unsafe { GLOBAL.alloc(layout) };
                assert!(!p.is_null());
                unsafe { *(p as *mut usize) = tid * PER_THREAD + i };
                tx.send(p as usize).unwrap();
            }
            drop(tx);

            let mut freed = 0;
            for addr in rx {
                unsafe { GLOBAL.dealloc(addr as *mut u8, layout) };
                freed += 1;
            }
            freed
        }));
    }
    drop(senders);

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, THREADS * PER_THREAD);
}
