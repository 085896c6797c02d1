#![no_std]

//! rxmalloc: a message-passing memory allocator for Rust.
//!
//! Every live allocation is owned by exactly one core allocator (normally
//! per-thread). Frees issued by the owning thread go straight onto the
//! slab's free list; frees issued by any other thread are batched in a
//! per-thread cache and posted as messages to the owner's MPSC queue, so
//! the owner-side fast paths never take a lock.
//!
//! Tiers, fastest to slowest:
//! - Per-thread fast free lists (one per small sizeclass, no synchronization)
//! - Core allocator slow path (slab state machine, message drain)
//! - Backend chunk allocator (pagemap, OS interface)
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: rxmalloc::RxMalloc = rxmalloc::RxMalloc;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod backend;
pub mod config;
pub mod corealloc;
pub mod entropy;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod freelist;
pub mod localalloc;
pub mod localcache;
pub mod macros;
pub mod metadata;
pub mod mpscq;
pub mod platform;
pub mod pool;
pub mod remotecache;
pub mod sizeclass;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;

pub use backend::GlobalBackend;
pub use localalloc::LocalAllocator;

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        mod thread;
        pub use thread::RxMalloc;
    }
}

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
