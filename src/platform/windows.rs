//! Windows virtual memory and entropy via VirtualAlloc/RtlGenRandom.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_DECOMMIT: u32 = 0x4000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

#[link(name = "kernel32")]
unsafe extern "system" {
    fn VirtualAlloc(addr: *mut c_void, size: usize, alloc_type: u32, protect: u32)
    -> *mut c_void;
    fn VirtualFree(addr: *mut c_void, size: usize, free_type: u32) -> i32;
    fn RaiseFailFastException(rec: *mut c_void, ctx: *mut c_void, flags: u32) -> !;
    fn GetStdHandle(which: u32) -> *mut c_void;
    fn WriteFile(
        handle: *mut c_void,
        buf: *const u8,
        len: u32,
        written: *mut u32,
        overlapped: *mut c_void,
    ) -> i32;
}

#[link(name = "advapi32")]
unsafe extern "system" {
    #[link_name = "SystemFunction036"]
    fn RtlGenRandom(buf: *mut c_void, len: u32) -> u8;
}

pub unsafe fn reserve_aligned(size: usize, align: usize) -> *mut u8 {
    // VirtualAlloc aligns to 64 KiB granularity; for larger alignments,
    // reserve oversized, find the aligned slice, release, and re-reserve at
    // the aligned address. The re-reserve can race with other mappings, so
    // retry a few times.
    for _ in 0..8 {
        let raw = unsafe {
            VirtualAlloc(
                core::ptr::null_mut(),
                size + align,
                MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if raw.is_null() {
            return core::ptr::null_mut();
        }
        let aligned = ((raw as usize) + align - 1) & !(align - 1);
        unsafe { VirtualFree(raw, 0, MEM_RELEASE) };
        let committed = unsafe {
            VirtualAlloc(
                aligned as *mut c_void,
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if !committed.is_null() {
            return committed as *mut u8;
        }
    }
    core::ptr::null_mut()
}

pub unsafe fn release(ptr: *mut u8, _size: usize) {
    unsafe { VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE) };
}

pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    unsafe { VirtualFree(ptr as *mut c_void, size, MEM_DECOMMIT) };
}

pub unsafe fn recommit(ptr: *mut u8, size: usize) {
    unsafe { VirtualAlloc(ptr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE) };
}

pub fn entropy64() -> u64 {
    let mut buf = [0u8; 8];
    unsafe { RtlGenRandom(buf.as_mut_ptr() as *mut c_void, 8) };
    u64::from_ne_bytes(buf)
}

pub fn fatal(msg: &str) -> ! {
    const STD_ERROR_HANDLE: u32 = -12i32 as u32;
    unsafe {
        let handle = GetStdHandle(STD_ERROR_HANDLE);
        let mut written = 0u32;
        WriteFile(
            handle,
            msg.as_ptr(),
            msg.len() as u32,
            &mut written,
            core::ptr::null_mut(),
        );
        WriteFile(handle, b"\n".as_ptr(), 1, &mut written, core::ptr::null_mut());
        RaiseFailFastException(core::ptr::null_mut(), core::ptr::null_mut(), 0)
    }
}
