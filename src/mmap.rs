//! Anonymous-mapping parent allocator, for embedders that want clumps to come
//! straight from the OS rather than from libc malloc.

#[cfg(unix)]
pub mod _unix {
    use crate::raw::RawMemory;
    use std::ptr::null_mut;

    pub struct MmapRaw;

    impl RawMemory for MmapRaw {
        unsafe fn alloc(&mut self, size: usize, _cname: &'static str) -> *mut u8 {
            let map = libc::mmap(
                null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return null_mut();
            }
            libc::madvise(map, size as _, libc::MADV_SEQUENTIAL);
            map as *mut u8
        }

        unsafe fn free(&mut self, ptr: *mut u8, size: usize, _cname: &'static str) {
            libc::munmap(ptr as *mut _, size as _);
        }
    }
}

#[cfg(windows)]
pub mod _win {
    use crate::raw::RawMemory;
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct MmapRaw;

    impl RawMemory for MmapRaw {
        unsafe fn alloc(&mut self, size: usize, _cname: &'static str) -> *mut u8 {
            VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) as *mut u8
        }

        unsafe fn free(&mut self, ptr: *mut u8, _size: usize, _cname: &'static str) {
            VirtualFree(ptr.cast(), 0, MEM_RELEASE);
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
