//! OS platform abstraction for virtual memory and entropy.
//!
//! Provides zeroed, aligned memory reservation (`reserve_aligned`), release,
//! decommit, an entropy source for the free-list keys, and `fatal` for
//! unrecoverable heap corruption. Wraps VirtualAlloc on Windows and mmap on
//! Unix via raw externs.

#[cfg(windows)]
mod windows;

#[cfg(unix)]
mod unix;

/// Reserve `size` bytes of zeroed virtual memory aligned to `align`.
/// Returns null on failure. `align` must be a power of two; sub-page
/// alignments are rounded up to the OS page granularity internally.
///
/// # Safety
/// Caller must eventually call `release` with the returned pointer and the
/// same `size`.
#[inline]
pub unsafe fn reserve_aligned(size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    #[cfg(windows)]
    {
        unsafe { windows::reserve_aligned(size, align) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::reserve_aligned(size, align) }
    }
}

/// Free virtual memory previously obtained from `reserve_aligned`.
///
/// # Safety
/// `ptr` must have been returned by `reserve_aligned` with the same `size`.
#[inline]
pub unsafe fn release(ptr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::release(ptr, size) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::release(ptr, size) };
    }
}

/// Decommit pages (return physical memory to the OS but keep the virtual
/// address range). MEM_DECOMMIT on Windows, madvise(MADV_DONTNEED) on Unix.
///
/// # Safety
/// `ptr` and `size` must refer to a range within a live reservation.
#[inline]
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::decommit(ptr, size) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::decommit(ptr, size) };
    }
}

/// Recommit previously decommitted pages.
///
/// # Safety
/// `ptr` and `size` must refer to a previously decommitted range.
#[inline]
pub unsafe fn recommit(ptr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::recommit(ptr, size) };
    }
    #[cfg(unix)]
    {
        // madvise(MADV_DONTNEED) does not unmap; touching the pages again
        // recommits them. Nothing to do.
        let _ = (ptr, size);
    }
}

/// 64 bits of OS entropy for the per-thread free-list keys.
pub fn entropy64() -> u64 {
    #[cfg(windows)]
    {
        windows::entropy64()
    }
    #[cfg(unix)]
    {
        unix::entropy64()
    }
}

/// Report an unrecoverable error and abort the process.
///
/// With the `testing` feature the abort becomes a panic so corruption
/// detection can be exercised from tests.
#[cold]
#[inline(never)]
pub fn fatal(msg: &str) -> ! {
    #[cfg(feature = "testing")]
    {
        panic!("{}", msg);
    }
    #[cfg(not(feature = "testing"))]
    {
        #[cfg(windows)]
        {
            windows::fatal(msg)
        }
        #[cfg(unix)]
        {
            unix::fatal(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_CHUNK_SIZE;

    #[test]
    fn test_reserve_and_release() {
        unsafe {
            let ptr = reserve_aligned(MIN_CHUNK_SIZE, MIN_CHUNK_SIZE);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % MIN_CHUNK_SIZE, 0);
            // Memory should be zero-initialized
            for i in 0..MIN_CHUNK_SIZE {
                assert_eq!(*ptr.add(i), 0);
            }
            // Write a pattern and read it back
            for i in 0..MIN_CHUNK_SIZE {
                *ptr.add(i) = (i & 0xFF) as u8;
            }
            for i in 0..MIN_CHUNK_SIZE {
                assert_eq!(*ptr.add(i), (i & 0xFF) as u8);
            }
            release(ptr, MIN_CHUNK_SIZE);
        }
    }

    #[test]
    fn test_reserve_large_alignment() {
        unsafe {
            let size = 1024 * 1024;
            let ptr = reserve_aligned(size, size);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % size, 0);
            release(ptr, size);
        }
    }

    #[test]
    fn test_entropy_nonconstant() {
        let a = entropy64();
        let b = entropy64();
        let c = entropy64();
        // Three identical draws from a 64-bit source means the source is broken.
        assert!(!(a == b && b == c));
    }
}
