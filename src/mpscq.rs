//! The message queue of freed objects owned by each core allocator.
//!
//! Multi-producer single-consumer: any thread may enqueue a batch of freed
//! objects; only the owning thread dequeues. The queue is a linked list
//! through the objects' own next fields, primed with a stub node embedded
//! in the queue itself so enqueue never has to handle the empty case.
//!
//! Ordering: a producer terminates the batch, swaps `back` with release,
//! and publishes the link to the old tail with release. The consumer's
//! acquire read of a next pointer therefore sees every write the producer
//! made to the batch before posting it.
//!
//! Queues may be the target of client tampering: everything read out of a
//! next field is `Wild` until domesticated (the configuration may declare
//! queue heads tame and skip that for the front pointer).

use crate::entropy::GLOBAL_KEY;
use crate::freelist::{FreeObject, Wild};
use crate::sizeclass::REMOTE_MIN_ALIGN;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Pads a value out to its own cache line; the two ends of the queue are
/// touched by different threads.
#[repr(align(64))]
struct CacheAligned<T>(T);

/// Sentinel stored in a detached `LocalCache`: never a valid queue address,
/// never equal to a pagemap entry's owner, so the owner test on the dealloc
/// fast path fails cleanly before the cache is attached.
pub const UNUSED_REMOTE: *mut RemoteAllocator =
    (usize::MAX & !(REMOTE_MIN_ALIGN - 1)) as *mut RemoteAllocator;

/// MPSC queue of freed objects. Its address identifies the owning allocator
/// in every chunk's pagemap entry, which is why the alignment must leave
/// the low bits free for the sizeclass packing.
#[repr(C, align(256))]
pub struct RemoteAllocator {
    /// Permanent stub node; the queue is never without an element.
    stub: UnsafeCell<FreeObject>,
    /// Enqueue side, exchanged by producers.
    back: CacheAligned<AtomicPtr<FreeObject>>,
    /// Dequeue side, owner only.
    front: CacheAligned<UnsafeCell<*mut FreeObject>>,
}

unsafe impl Send for RemoteAllocator {}
unsafe impl Sync for RemoteAllocator {}

const _: () = assert!(core::mem::align_of::<RemoteAllocator>() >= REMOTE_MIN_ALIGN);

impl RemoteAllocator {
    pub const fn new() -> Self {
        Self {
            stub: UnsafeCell::new(FreeObject::new()),
            back: CacheAligned(AtomicPtr::new(ptr::null_mut())),
            front: CacheAligned(UnsafeCell::new(ptr::null_mut())),
        }
    }

    #[inline]
    fn stub_ptr(&self) -> *mut FreeObject {
        self.stub.get()
    }

    /// True if `p` is this queue's stub rather than a client object.
    #[inline]
    pub fn is_stub(&self, p: *mut FreeObject) -> bool {
        p == self.stub_ptr()
    }

    /// An integer identifying this allocator; bit groups of it index the
    /// remote dealloc cache's slots.
    #[inline]
    pub fn trunc_id(&self) -> usize {
        self as *const _ as usize
    }

    fn invariant(&self) {
        // Only `back` can be inspected from arbitrary threads; `front` is
        // owner-private state.
        debug_assert!(!self.back.0.load(Ordering::Relaxed).is_null());
    }

    /// Prime the queue with the stub. Must run at the queue's final address
    /// before any enqueue, and only from the owning thread.
    ///
    /// # Safety
    /// No other thread may be using the queue.
    pub unsafe fn init(&self) {
        unsafe {
            FreeObject::atomic_store_null(self.stub_ptr(), &GLOBAL_KEY);
            *self.front.0.get() = self.stub_ptr();
        }
        self.back.0.store(self.stub_ptr(), Ordering::Relaxed);
        self.invariant();
    }

    /// Push the linked batch `[first, last]` (already linked through next
    /// fields with the global key) onto the queue. Callable from any
    /// thread; self-enqueue by the owner is legal.
    ///
    /// # Safety
    /// The batch must be exclusively owned by the caller and correctly
    /// linked from `first` to `last`.
    pub unsafe fn enqueue(&self, first: *mut FreeObject, last: *mut FreeObject) {
        self.invariant();
        unsafe {
            FreeObject::atomic_store_null(last, &GLOBAL_KEY);
            // The release exchange makes the terminator visible to whoever
            // swaps after us; the release store publishes the whole batch
            // to the consumer.
            let prev = self.back.0.swap(last, Ordering::Release);
            FreeObject::atomic_store_next(prev, first, &GLOBAL_KEY);
        }
    }

    /// True if a dequeue could deliver a message.
    ///
    /// # Safety
    /// Owner only.
    pub unsafe fn can_dequeue(&self) -> bool {
        let front = unsafe { *self.front.0.get() };
        !(front == self.stub_ptr()
            && unsafe { FreeObject::atomic_read_next(front, &GLOBAL_KEY) }.is_null())
    }

    /// Remove and return the oldest message, or None if the queue is empty
    /// or a producer is mid-publish. The stub is skipped and re-linked
    /// internally, so the caller only ever sees real messages and every
    /// message is delivered exactly once.
    ///
    /// # Safety
    /// Owner only; `domesticate` must validate pointers read from object
    /// memory.
    pub unsafe fn dequeue_one(
        &self,
        domesticate: impl Fn(Wild) -> *mut FreeObject,
    ) -> Option<*mut FreeObject> {
        let stub = self.stub_ptr();
        // The stub lives in allocator metadata, not in any tracked chunk,
        // so it must be recognised by address rather than domesticated.
        let dom = |w: Wild| {
            if w.unsafe_ptr() == stub {
                stub
            } else {
                domesticate(w)
            }
        };

        loop {
            let front = unsafe { *self.front.0.get() };
            debug_assert!(!front.is_null());
            let next_wild = unsafe { FreeObject::atomic_read_next(front, &GLOBAL_KEY) };

            if front == stub {
                if next_wild.is_null() {
                    return None;
                }
                let next = dom(next_wild);
                unsafe {
                    FreeObject::check_prev(
                        next,
                        crate::freelist::signed_prev(front as usize, next as usize, &GLOBAL_KEY),
                    );
                    *self.front.0.get() = next;
                }
                continue;
            }

            if !next_wild.is_null() {
                let next = dom(next_wild);
                unsafe {
                    FreeObject::check_prev(
                        next,
                        crate::freelist::signed_prev(front as usize, next as usize, &GLOBAL_KEY),
                    );
                    *self.front.0.get() = next;
                }
                return Some(front);
            }

            // `front` is the last element. If a producer already swapped
            // back but has not linked yet, leave the message for later.
            if self.back.0.load(Ordering::Acquire) != front {
                return None;
            }

            // Re-home the stub behind the tail so the last real message
            // becomes deliverable.
            unsafe { self.enqueue(stub, stub) };
            let next_wild = unsafe { FreeObject::atomic_read_next(front, &GLOBAL_KEY) };
            if next_wild.is_null() {
                // A producer slipped in between the check and our enqueue;
                // its link will appear shortly.
                return None;
            }
            let next = dom(next_wild);
            unsafe {
                FreeObject::check_prev(
                    next,
                    crate::freelist::signed_prev(front as usize, next as usize, &GLOBAL_KEY),
                );
                *self.front.0.get() = next;
            }
            return Some(front);
        }
    }

    /// Tear the queue down, returning the remaining chain (which may
    /// contain the stub). Used by the shutdown audit.
    ///
    /// # Safety
    /// Owner only; no concurrent producers.
    pub unsafe fn destroy(&self) -> *mut FreeObject {
        let fnt = unsafe { *self.front.0.get() };
        self.back.0.store(ptr::null_mut(), Ordering::Relaxed);
        unsafe { *self.front.0.get() = ptr::null_mut() };
        fnt
    }
}

impl Default for RemoteAllocator {
    fn default() -> Self {
        Self::new()
    }
}
