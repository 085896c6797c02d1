//! The backend contract the core is written against, and the default
//! global backend.
//!
//! The core only ever asks a backend for power-of-two, naturally-aligned
//! chunks, per-chunk metadata storage, and address-to-metadata lookups. The
//! default backend implements that with a three-level radix pagemap of
//! `MetaEntry`s (lock-free reads, writes under the chunk lock), per-size
//! pools of reusable chunks carved from large OS reservations, and a bump
//! arena for metadata.

use crate::config::{BITS, HEAP_GROWTH_BYTES, MIN_CHUNK_BITS, MIN_CHUNK_SIZE};
use crate::freelist::{FreeObject, Wild};
use crate::metadata::{MetaEntry, SlabMetadata};
use crate::platform;
use crate::pool::PoolState;
use crate::sync::FlagLock;
use crate::stat;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Everything the core consumes from a backend. Implementations must hand
/// out `size`-aligned chunks of exactly `size` bytes and keep the pagemap
/// entries for the range answering until the chunk is returned.
pub trait Backend: Sized + 'static {
    /// Per-core-allocator backend scratch state.
    type LocalState: Default;

    /// Whether pointers read from a queue's head position can skip
    /// domestication (the heads live in allocator-owned memory).
    const QUEUE_HEADS_ARE_TAME: bool;

    /// Return a `size`-byte, `size`-aligned chunk and its metadata object,
    /// with the pagemap entries for the whole range set to (`meta`, `ras`).
    /// `(null, null)` under OOM.
    ///
    /// # Safety
    /// `size` must be a power of two, at least `MIN_CHUNK_SIZE`.
    unsafe fn alloc_chunk(
        local: &mut Self::LocalState,
        size: usize,
        ras: usize,
    ) -> (*mut u8, *mut SlabMetadata);

    /// Release a chunk; the metadata object is consumed.
    ///
    /// # Safety
    /// `chunk`/`size`/`meta` must come from a matching `alloc_chunk`, with
    /// no live objects inside.
    unsafe fn dealloc_chunk(
        local: &mut Self::LocalState,
        meta: *mut SlabMetadata,
        chunk: *mut u8,
        size: usize,
    );

    /// Allocator-internal metadata memory; never returned. Null under OOM.
    ///
    /// # Safety
    /// `align` must be a power of two.
    unsafe fn alloc_meta_data(size: usize, align: usize) -> *mut u8;

    /// The pagemap entry for the chunk containing `addr`. Safe on any
    /// address; unmapped regions read as an unowned entry.
    fn get_metaentry(addr: usize) -> &'static MetaEntry;

    /// Validate a pointer read from client-reachable memory, or trap.
    fn domesticate(p: Wild) -> *mut FreeObject;

    /// The pool of core allocators for this backend instantiation.
    fn core_pool() -> &'static PoolState<Self>;
}

// ---- Pagemap ----

const LEAF_BITS: usize = 11;
const MID_BITS: usize = 11;
const CHUNK_ID_BITS: usize = crate::config::ADDRESS_BITS - MIN_CHUNK_BITS;
const ROOT_BITS: usize = CHUNK_ID_BITS - MID_BITS - LEAF_BITS;

const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

const LEAF_MASK: usize = LEAF_LEN - 1;
const MID_MASK: usize = MID_LEN - 1;

#[repr(C)]
struct PagemapLeaf {
    entries: [MetaEntry; LEAF_LEN],
}

#[repr(C)]
struct PagemapMid {
    leaves: [AtomicPtr<PagemapLeaf>; MID_LEN],
}

/// Entry read on every deallocation for any address in the process, so
/// lookups must be cheap and total. Nodes are lazily reserved and never
/// freed; absent levels read as the unowned entry.
struct Pagemap {
    root: [AtomicPtr<PagemapMid>; ROOT_LEN],
}

unsafe impl Sync for Pagemap {}

static NULL_ENTRY: MetaEntry = MetaEntry::zeroed();

impl Pagemap {
    const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; ROOT_LEN],
        }
    }

    /// Lock-free lookup, total over the address space.
    #[inline]
    fn get(&self, addr: usize) -> &MetaEntry {
        let id = addr >> MIN_CHUNK_BITS;
        let root_idx = id >> (MID_BITS + LEAF_BITS);
        if root_idx >= ROOT_LEN {
            return &NULL_ENTRY;
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return &NULL_ENTRY;
        }

        let leaf =
            unsafe { (*mid).leaves[(id >> LEAF_BITS) & MID_MASK].load(Ordering::Acquire) };
        if leaf.is_null() {
            return &NULL_ENTRY;
        }

        unsafe { &(*leaf).entries[id & LEAF_MASK] }
    }

    /// Entry for `addr`, materialising missing levels. Fresh nodes come
    /// zeroed from the OS, which is a valid unowned state for every entry.
    ///
    /// # Safety
    /// Writers must be serialised (the chunk lock).
    unsafe fn ensure(&self, addr: usize) -> &MetaEntry {
        let id = addr >> MIN_CHUNK_BITS;
        let root_idx = id >> (MID_BITS + LEAF_BITS);
        if root_idx >= ROOT_LEN {
            platform::fatal("Address out of range for pagemap");
        }

        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            mid = unsafe { Self::reserve_node::<PagemapMid>() };
            self.root[root_idx].store(mid, Ordering::Release);
        }

        let mid_slot = unsafe { &(*mid).leaves[(id >> LEAF_BITS) & MID_MASK] };
        let mut leaf = mid_slot.load(Ordering::Acquire);
        if leaf.is_null() {
            leaf = unsafe { Self::reserve_node::<PagemapLeaf>() };
            mid_slot.store(leaf, Ordering::Release);
        }

        unsafe { &(*leaf).entries[id & LEAF_MASK] }
    }

    unsafe fn reserve_node<T>() -> *mut T {
        let size = (core::mem::size_of::<T>() + 4095) & !4095;
        let p = unsafe { platform::reserve_aligned(size, 4096) };
        if p.is_null() {
            platform::fatal("Failed to reserve pagemap node");
        }
        p as *mut T
    }
}

// ---- Chunk pools ----

/// Node threaded through the first word of an idle chunk.
struct ChunkRecord {
    next: *mut ChunkRecord,
}

const NUM_CHUNK_CLASSES: usize = BITS - MIN_CHUNK_BITS;

/// Idle chunks per power-of-two class, plus the bump region new chunks are
/// carved from. Chunks stay committed while pooled; pool hits are the
/// common case for slab-sized chunks.
struct ChunkPools {
    free: [*mut ChunkRecord; NUM_CHUNK_CLASSES],
    bump: usize,
    remaining: usize,
}

unsafe impl Send for ChunkPools {}

#[inline]
fn chunk_class(size: usize) -> usize {
    debug_assert!(size.is_power_of_two() && size >= MIN_CHUNK_SIZE);
    size.trailing_zeros() as usize - MIN_CHUNK_BITS
}

#[inline]
fn prev_pow2(x: usize) -> usize {
    1 << (BITS - 1 - x.leading_zeros() as usize)
}

impl ChunkPools {
    const fn new() -> Self {
        Self {
            free: [ptr::null_mut(); NUM_CHUNK_CLASSES],
            bump: 0,
            remaining: 0,
        }
    }

    unsafe fn push(&mut self, addr: usize, size: usize) {
        let rec = addr as *mut ChunkRecord;
        unsafe { (*rec).next = self.free[chunk_class(size)] };
        self.free[chunk_class(size)] = rec;
    }

    /// Break an address range into naturally-aligned power-of-two chunks
    /// and pool them. `start` and `end` are multiples of the chunk granule.
    unsafe fn retire_range(&mut self, mut start: usize, end: usize) {
        while start < end {
            let align = 1usize << start.trailing_zeros();
            let piece = align.min(prev_pow2(end - start));
            unsafe { self.push(start, piece) };
            start += piece;
        }
    }

    unsafe fn alloc(&mut self, pagemap: &Pagemap, size: usize) -> *mut u8 {
        let cls = chunk_class(size);
        let rec = self.free[cls];
        if !rec.is_null() {
            self.free[cls] = unsafe { (*rec).next };
            return rec as *mut u8;
        }

        loop {
            if self.remaining > 0 {
                let target = (self.bump + size - 1) & !(size - 1);
                if target + size <= self.bump + self.remaining {
                    // Pool the alignment gap rather than leaking it.
                    unsafe { self.retire_range(self.bump, target) };
                    self.remaining -= (target + size) - self.bump;
                    self.bump = target + size;
                    return target as *mut u8;
                }
                // Region too small for this request: retire the tail.
                unsafe { self.retire_range(self.bump, self.bump + self.remaining) };
                self.remaining = 0;
            }

            let region = HEAP_GROWTH_BYTES.max(size);
            let p = unsafe { platform::reserve_aligned(region, size) };
            if p.is_null() {
                return ptr::null_mut();
            }
            stat!(os_reserve_count);
            stat!(os_reserve_bytes, region as u64);

            // The reservation cannot be merged with whatever precedes it.
            unsafe { pagemap.ensure(p as usize).set_boundary() };

            self.bump = p as usize;
            self.remaining = region;
        }
    }
}

// ---- Metadata arena ----

/// Bump arena for allocator-internal metadata, with a free list for the
/// one size that churns (slab metadata). Never returned to the OS.
struct MetaArena {
    bump: usize,
    remaining: usize,
    free_meta: *mut SlabMetadata,
}

unsafe impl Send for MetaArena {}

const META_REGION_BYTES: usize = 1 << 18;

impl MetaArena {
    const fn new() -> Self {
        Self {
            bump: 0,
            remaining: 0,
            free_meta: ptr::null_mut(),
        }
    }

    unsafe fn alloc(&mut self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());
        let mut aligned = (self.bump + align - 1) & !(align - 1);
        if aligned + size > self.bump + self.remaining {
            let region = META_REGION_BYTES.max((size + align).next_power_of_two());
            let p = unsafe { platform::reserve_aligned(region, 4096) };
            if p.is_null() {
                return ptr::null_mut();
            }
            stat!(os_reserve_count);
            stat!(os_reserve_bytes, region as u64);
            self.bump = p as usize;
            self.remaining = region;
            aligned = (self.bump + align - 1) & !(align - 1);
        }
        self.remaining -= (aligned + size) - self.bump;
        self.bump = aligned + size;
        aligned as *mut u8
    }

    unsafe fn alloc_slab_meta(&mut self) -> *mut SlabMetadata {
        let m = self.free_meta;
        if !m.is_null() {
            self.free_meta = unsafe { (*m).arena_next() };
            return m;
        }
        unsafe {
            self.alloc(
                core::mem::size_of::<SlabMetadata>(),
                core::mem::align_of::<SlabMetadata>(),
            ) as *mut SlabMetadata
        }
    }

    unsafe fn free_slab_meta(&mut self, m: *mut SlabMetadata) {
        unsafe { (*m).set_arena_next(self.free_meta) };
        self.free_meta = m;
    }
}

// ---- The default backend ----

/// Process-global backend over the OS virtual memory interface.
pub struct GlobalBackend;

static PAGEMAP: Pagemap = Pagemap::new();
static CHUNK_POOLS: FlagLock<ChunkPools> = FlagLock::new(ChunkPools::new());
static META_ARENA: FlagLock<MetaArena> = FlagLock::new(MetaArena::new());
static CORE_POOL: PoolState<GlobalBackend> = PoolState::new();

impl Backend for GlobalBackend {
    type LocalState = ();

    const QUEUE_HEADS_ARE_TAME: bool = true;

    unsafe fn alloc_chunk(
        _local: &mut (),
        size: usize,
        ras: usize,
    ) -> (*mut u8, *mut SlabMetadata) {
        debug_assert!(size.is_power_of_two() && size >= MIN_CHUNK_SIZE);

        let meta = unsafe { META_ARENA.lock().alloc_slab_meta() };
        if meta.is_null() {
            return (ptr::null_mut(), ptr::null_mut());
        }
        unsafe { ptr::write(meta, SlabMetadata::new()) };

        let mut pools = CHUNK_POOLS.lock();
        let chunk = unsafe { pools.alloc(&PAGEMAP, size) };
        if chunk.is_null() {
            drop(pools);
            unsafe { META_ARENA.lock().free_slab_meta(meta) };
            return (ptr::null_mut(), ptr::null_mut());
        }

        // Install ownership for every chunk granule in the range before the
        // chunk can escape to other threads.
        let mut addr = chunk as usize;
        let end = addr + size;
        while addr < end {
            unsafe { PAGEMAP.ensure(addr).set(meta, ras) };
            addr += MIN_CHUNK_SIZE;
        }
        drop(pools);

        stat!(chunk_alloc_count);
        (chunk, meta)
    }

    unsafe fn dealloc_chunk(
        _local: &mut (),
        meta: *mut SlabMetadata,
        chunk: *mut u8,
        size: usize,
    ) {
        debug_assert!((chunk as usize) % size == 0);

        {
            let mut pools = CHUNK_POOLS.lock();
            // A stale free into this range must now read as backend-owned.
            let mut addr = chunk as usize;
            let end = addr + size;
            while addr < end {
                unsafe { PAGEMAP.ensure(addr).claim_for_backend() };
                addr += MIN_CHUNK_SIZE;
            }
            unsafe { pools.push(chunk as usize, size) };
        }

        unsafe { META_ARENA.lock().free_slab_meta(meta) };
        stat!(chunk_dealloc_count);
    }

    unsafe fn alloc_meta_data(size: usize, align: usize) -> *mut u8 {
        unsafe { META_ARENA.lock().alloc(size, align) }
    }

    #[inline]
    fn get_metaentry(addr: usize) -> &'static MetaEntry {
        PAGEMAP.get(addr)
    }

    #[inline]
    fn domesticate(p: Wild) -> *mut FreeObject {
        #[cfg(feature = "check-client")]
        {
            if p.is_null() {
                return ptr::null_mut();
            }
            let entry = Self::get_metaentry(p.addr());
            if entry.is_backend_owned() || entry.get_remote().is_null() {
                platform::fatal("Heap corruption - free list corrupted!");
            }
            p.unsafe_ptr()
        }
        #[cfg(not(feature = "check-client"))]
        {
            p.unsafe_ptr()
        }
    }

    fn core_pool() -> &'static PoolState<GlobalBackend> {
        &CORE_POOL
    }
}
