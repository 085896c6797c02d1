//! Per-thread cache batching deallocations bound for other allocators.
//!
//! Foreign frees are fanned out across `REMOTE_SLOTS` builders indexed by a
//! bit group of the destination allocator's id, and counted against a byte
//! budget. When the budget is exhausted the cache posts: every non-self
//! slot is detached as one segment and enqueued on the destination named by
//! its first object's pagemap entry. Slot collisions are tolerated — a
//! mis-delivered message is recognised by the receiver's drain and
//! forwarded onward from there.
//!
//! The thread's own slot cannot be posted to "itself", so its contents are
//! redistributed using the next bit group of each destination id and the
//! loop runs again. Rounds are explicitly capped; past the cap the leftover
//! objects are sent one at a time straight to their destinations
//! (self-enqueue is legal), so termination does not depend on how allocator
//! ids are distributed.

use crate::backend::Backend;
use crate::config::{MAX_POST_ROUNDS, REMOTE_CACHE_BYTES, REMOTE_MASK, REMOTE_SLOT_BITS, REMOTE_SLOTS};
use crate::entropy::GLOBAL_KEY;
use crate::freelist::{Builder, FreeObject};
use crate::metadata::MetaEntry;
use crate::sizeclass::{next_pow2_bits, sizeclass_full_to_size};
use crate::stat;

/// Batches remote deallocations until the byte budget runs out.
pub struct RemoteDeallocCache {
    list: [Builder<false>; REMOTE_SLOTS],

    /// Bytes of budget remaining before a post is forced. Zero also means
    /// "not initialised": the first remote free then takes the slow path,
    /// which lazily sets the owning allocator up.
    capacity: i64,

    #[cfg(debug_assertions)]
    initialised: bool,
}

/// Slot for an allocator id in the given posting round: successive rounds
/// consume successive bit groups above the allocator's alignment.
#[inline]
fn slot_for<B: Backend>(id: usize, round: usize) -> usize {
    let initial_shift = next_pow2_bits(core::mem::size_of::<crate::corealloc::CoreAllocator<B>>());
    let shift = initial_shift + round * REMOTE_SLOT_BITS;
    if shift >= usize::BITS as usize {
        return 0;
    }
    (id >> shift) & REMOTE_MASK
}

impl RemoteDeallocCache {
    pub const fn new() -> Self {
        Self {
            list: [const { Builder::new() }; REMOTE_SLOTS],
            capacity: 0,
            #[cfg(debug_assertions)]
            initialised: false,
        }
    }

    /// Reset the builders and the byte budget. Must run at the cache's
    /// final address, on every attach.
    pub fn init(&mut self) {
        for l in &mut self.list {
            l.init();
        }
        self.capacity = REMOTE_CACHE_BYTES as i64;
        #[cfg(debug_assertions)]
        {
            self.initialised = true;
        }
    }

    /// Drop the budget to zero so the next remote free falls into the slow
    /// path. Used when the owning allocator detaches.
    pub fn disable(&mut self) {
        self.capacity = 0;
    }

    /// Charge the budget for `n` objects of the entry's sizeclass. True if
    /// the cache can absorb them without posting. Safe to call on a cache
    /// that was never initialised (the budget is simply zero).
    #[inline]
    pub fn reserve_space(&mut self, entry: &MetaEntry, n: u16) -> bool {
        let size = n as i64 * sizeclass_full_to_size(entry.get_sizeclass()) as i64;
        let fits = self.capacity > size;
        if fits {
            self.capacity -= size;
        }
        fits
    }

    /// Stash one object headed for the allocator identified by `target_id`.
    ///
    /// # Safety
    /// The cache must be initialised, and `p` must be an object owned by
    /// that allocator, not on any other list.
    #[inline]
    pub unsafe fn dealloc<B: Backend>(&mut self, target_id: usize, p: *mut FreeObject) {
        #[cfg(debug_assertions)]
        debug_assert!(self.initialised);

        let slot = slot_for::<B>(target_id, 0);
        unsafe { self.list[slot].add_unrandomised(p, &GLOBAL_KEY) };
        stat!(dealloc_remote_count);
    }

    /// Send every batched message to its destination queue and reset the
    /// budget. `id` is the posting allocator's own id. Returns true if
    /// anything was sent.
    ///
    /// # Safety
    /// The cache must be initialised and the caller must own it.
    pub unsafe fn post<B: Backend>(&mut self, id: usize) -> bool {
        #[cfg(debug_assertions)]
        debug_assert!(self.initialised);

        let mut sent_something = false;
        let mut round = 0;

        loop {
            let my_slot = slot_for::<B>(id, round);

            for i in 0..REMOTE_SLOTS {
                if i == my_slot {
                    continue;
                }
                if !self.list[i].empty() {
                    let (first, last) = unsafe { self.list[i].extract_segment(&GLOBAL_KEY) };
                    let entry = B::get_metaentry(first as usize);
                    #[cfg(feature = "check-client")]
                    if entry.is_backend_owned() {
                        crate::platform::fatal(
                            "Delayed detection of attempt to free internal structure",
                        );
                    }
                    unsafe { (*entry.get_remote()).enqueue(first, last) };
                    sent_something = true;
                    stat!(remote_post_count);
                }
            }

            if self.list[my_slot].empty() {
                break;
            }

            // The own slot's entries could hash straight back into it, so
            // close the list and re-spread by the next bit group.
            let (mut resend, _) = unsafe { self.list[my_slot].close(&GLOBAL_KEY) };
            round += 1;

            if round >= MAX_POST_ROUNDS {
                // Round cap: deliver the stragglers one by one.
                while !resend.empty() {
                    let r = unsafe { resend.take(&GLOBAL_KEY, B::domesticate) };
                    let entry = B::get_metaentry(r as usize);
                    unsafe { (*entry.get_remote()).enqueue(r, r) };
                    sent_something = true;
                    stat!(remote_post_count);
                }
                break;
            }

            while !resend.empty() {
                let r = unsafe { resend.take(&GLOBAL_KEY, B::domesticate) };
                let entry = B::get_metaentry(r as usize);
                let target = entry.get_remote() as usize;
                let slot = slot_for::<B>(target, round);
                unsafe { self.list[slot].add_unrandomised(r, &GLOBAL_KEY) };
            }
        }

        self.capacity = REMOTE_CACHE_BYTES as i64;
        sent_something
    }
}

impl Default for RemoteDeallocCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GlobalBackend;
    use crate::metadata::{MetaEntry, SlabMetadata};
    use crate::mpscq::RemoteAllocator;
    use crate::sizeclass::{SizeClass, size_to_sizeclass};
    use alloc::boxed::Box;

    #[test]
    fn test_budget_countdown() {
        let remote = Box::leak(Box::new(RemoteAllocator::new()));
        let meta = Box::leak(Box::new(SlabMetadata::new()));
        let sc = SizeClass::from_small(size_to_sizeclass(1024));
        let entry = MetaEntry::zeroed();
        entry.set(meta, MetaEntry::encode(remote, sc));

        let mut cache = RemoteDeallocCache::new();
        // Uninitialised: no budget at all.
        assert!(!cache.reserve_space(&entry, 1));

        cache.init();
        let mut reserved = 0usize;
        while cache.reserve_space(&entry, 1) {
            reserved += 1024;
            assert!(reserved <= REMOTE_CACHE_BYTES);
        }
        // The budget bounds the batched bytes by the configured cache size.
        assert!(reserved > 0);
        assert!(reserved <= REMOTE_CACHE_BYTES);
    }

    #[test]
    fn test_slot_spread() {
        let id = 0x5555_5400usize;
        let s0 = slot_for::<GlobalBackend>(id, 0);
        assert!(s0 < REMOTE_SLOTS);
        assert!(slot_for::<GlobalBackend>(id, 1) < REMOTE_SLOTS);

        // Flipping the lowest bit round 0 consumes flips the round-0 slot.
        let initial =
            next_pow2_bits(core::mem::size_of::<crate::corealloc::CoreAllocator<GlobalBackend>>());
        let id2 = id ^ (1 << initial);
        assert_eq!(slot_for::<GlobalBackend>(id2, 0), s0 ^ 1);
        // Round 1 does not look at round 0's bits.
        assert_eq!(slot_for::<GlobalBackend>(id2, 1), slot_for::<GlobalBackend>(id, 1));

        // A shift past the word width parks everything in slot 0 so the
        // round cap is the only termination the loop needs.
        assert_eq!(slot_for::<GlobalBackend>(id, 64), 0);
    }
}
