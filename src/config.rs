//! Allocator configuration constants.
//!
//! The tunable half comes from `rxmalloc.toml` via build.rs (see
//! `config_gen.rs` in OUT_DIR); the rest is derived here.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Used to isolate values on cache lines to prevent false sharing.
pub const CACHELINE_SIZE: usize = 64;

/// Minimum allocation size is space for two pointers.
pub const MIN_ALLOC_SIZE: usize = 2 * core::mem::size_of::<usize>();
pub const MIN_ALLOC_BITS: usize = MIN_ALLOC_SIZE.trailing_zeros() as usize;

/// Bits of a virtual address the allocator considers meaningful.
pub const ADDRESS_BITS: usize = 48;

/// Word size in bits.
pub const BITS: usize = usize::BITS as usize;

const _: () = assert!(INTERMEDIATE_BITS < MIN_ALLOC_BITS);
const _: () = assert!(MIN_ALLOC_SIZE >= 2 * core::mem::size_of::<usize>());
const _: () = assert!(MAX_SMALL_SIZECLASS_BITS >= MIN_CHUNK_BITS);
