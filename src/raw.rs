//! The parent byte allocator that backs every clump.
//!
//! The arena never touches the operating system directly: clump structs and
//! clump backing buffers are acquired from a [`RawMemory`] implementation and
//! handed back to it when the clump dies. The client name threaded through the
//! calls exists purely for diagnostics.

/// Untyped byte source the arena acquires its clumps from.
///
/// Implementations must hand out blocks aligned to at least
/// [`crate::OBJ_ALIGN`] and must be reentrant for the owning thread: clump
/// acquisition can allocate the clump struct and its backing buffer in one
/// call chain.
pub trait RawMemory {
    unsafe fn alloc(&mut self, size: usize, cname: &'static str) -> *mut u8;
    unsafe fn free(&mut self, ptr: *mut u8, size: usize, cname: &'static str);
}

/// `malloc`/`free` backed parent allocator. This is the default choice; clump
/// granularity is large enough that the libc allocator overhead is noise.
pub struct LibcRaw;

impl RawMemory for LibcRaw {
    unsafe fn alloc(&mut self, size: usize, _cname: &'static str) -> *mut u8 {
        libc::malloc(size as _) as *mut u8
    }

    unsafe fn free(&mut self, ptr: *mut u8, _size: usize, _cname: &'static str) {
        libc::free(ptr as *mut libc::c_void);
    }
}

/// Allocate one `T`-sized block from `parent`, uninitialized.
pub(crate) unsafe fn alloc_struct_raw<T>(
    parent: &mut dyn RawMemory,
    cname: &'static str,
) -> *mut T {
    parent.alloc(core::mem::size_of::<T>(), cname) as *mut T
}
