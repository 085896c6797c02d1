//! Flag locks for the allocator's cold paths.
//!
//! `std::sync::Mutex` is off limits here: it allocates, and this crate is
//! the allocator. A one-word test-and-set flag is sufficient instead,
//! because the only lock-guarded state is cold — the backend's chunk pools
//! and metadata arena, and the pool of core allocators. None of it is
//! touched on the allocation or local-deallocation fast paths; the message
//! queues carry all hot cross-thread traffic without locks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A one-word test-and-set flag.
pub struct Flag {
    held: AtomicBool,
}

impl Flag {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Take the flag, spinning until it is free. Waiters spin on plain
    /// loads between swap attempts so the holder's cache line is not
    /// bounced by a convoy of failed writes.
    #[inline]
    pub fn acquire(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Take the flag only if it is free right now.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Release a flag taken by `acquire` or a successful `try_acquire`.
    #[inline]
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Flag {}
unsafe impl Sync for Flag {}

/// Data guarded by a [`Flag`], reachable only through an RAII guard.
/// Const-constructible so the backend state can live in statics.
pub struct FlagLock<T> {
    flag: Flag,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for FlagLock<T> {}
unsafe impl<T: Send> Sync for FlagLock<T> {}

impl<T> FlagLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            flag: Flag::new(),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> FlagGuard<'_, T> {
        self.flag.acquire();
        FlagGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<FlagGuard<'_, T>> {
        if self.flag.try_acquire() {
            Some(FlagGuard { lock: self })
        } else {
            None
        }
    }
}

/// Holds the flag for as long as it lives; access the data through it.
pub struct FlagGuard<'a, T> {
    lock: &'a FlagLock<T>,
}

impl<T> Deref for FlagGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for FlagGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for FlagGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.flag.release();
    }
}
