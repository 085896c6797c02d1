//! C-ABI exports for external linking.
//!
//! Gated behind `features = ["ffi"]` (which implies `std` for the
//! thread-local front end). With the `testing` feature the export names
//! are prefixed so multiple build variants can link into one harness.

use crate::RxMalloc;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: RxMalloc = RxMalloc;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "rxmalloc_testing_alloc"))]
pub unsafe extern "C" fn rxmalloc_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "rxmalloc_testing_dealloc"))]
pub unsafe extern "C" fn rxmalloc_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "rxmalloc_testing_realloc"))]
pub unsafe extern "C" fn rxmalloc_realloc(
    ptr: *mut u8,
    size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "rxmalloc_testing_usable_size"))]
pub unsafe extern "C" fn rxmalloc_usable_size(ptr: *const u8) -> usize {
    use crate::backend::Backend;
    let entry = crate::GlobalBackend::get_metaentry(ptr as usize);
    crate::sizeclass::sizeclass_full_to_size(entry.get_sizeclass())
}
