//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The MPSC queue and the backend locks
//! provide the ordering guarantees for correctness; these counters are purely
//! for monitoring.
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Entry points ----
    /// Total small allocations served.
    pub alloc_count: AtomicU64,
    /// Total large (chunk-granularity) allocations served.
    pub large_alloc_count: AtomicU64,
    /// Total deallocations handled by the owning thread.
    pub dealloc_local_count: AtomicU64,
    /// Total deallocations stashed for another thread's allocator.
    pub dealloc_remote_count: AtomicU64,

    // ---- Message pipeline ----
    /// Batches posted to other allocators' queues.
    pub remote_post_count: AtomicU64,
    /// Messages drained from this allocator's own queue.
    pub message_drain_count: AtomicU64,

    // ---- Slab engine ----
    /// Slabs woken from the laden set back onto an available set.
    pub slab_wake_count: AtomicU64,
    /// Fully-free slabs returned to the backend.
    pub slab_return_count: AtomicU64,

    // ---- Backend / OS ----
    /// Chunks handed out by the backend.
    pub chunk_alloc_count: AtomicU64,
    /// Chunks returned to the backend.
    pub chunk_dealloc_count: AtomicU64,
    /// Calls to `platform::reserve_aligned`.
    pub os_reserve_count: AtomicU64,
    /// Bytes requested from the OS.
    pub os_reserve_bytes: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            large_alloc_count: AtomicU64::new(0),
            dealloc_local_count: AtomicU64::new(0),
            dealloc_remote_count: AtomicU64::new(0),
            remote_post_count: AtomicU64::new(0),
            message_drain_count: AtomicU64::new(0),
            slab_wake_count: AtomicU64::new(0),
            slab_return_count: AtomicU64::new(0),
            chunk_alloc_count: AtomicU64::new(0),
            chunk_dealloc_count: AtomicU64::new(0),
            os_reserve_count: AtomicU64::new(0),
            os_reserve_bytes: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub large_alloc_count: u64,
    pub dealloc_local_count: u64,
    pub dealloc_remote_count: u64,
    pub remote_post_count: u64,
    pub message_drain_count: u64,
    pub slab_wake_count: u64,
    pub slab_return_count: u64,
    pub chunk_alloc_count: u64,
    pub chunk_dealloc_count: u64,
    pub os_reserve_count: u64,
    pub os_reserve_bytes: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        large_alloc_count: s.large_alloc_count.load(Ordering::Relaxed),
        dealloc_local_count: s.dealloc_local_count.load(Ordering::Relaxed),
        dealloc_remote_count: s.dealloc_remote_count.load(Ordering::Relaxed),
        remote_post_count: s.remote_post_count.load(Ordering::Relaxed),
        message_drain_count: s.message_drain_count.load(Ordering::Relaxed),
        slab_wake_count: s.slab_wake_count.load(Ordering::Relaxed),
        slab_return_count: s.slab_return_count.load(Ordering::Relaxed),
        chunk_alloc_count: s.chunk_alloc_count.load(Ordering::Relaxed),
        chunk_dealloc_count: s.chunk_dealloc_count.load(Ordering::Relaxed),
        os_reserve_count: s.os_reserve_count.load(Ordering::Relaxed),
        os_reserve_bytes: s.os_reserve_bytes.load(Ordering::Relaxed),
    }
}
