use modular_bitfield::prelude::*;
use std::mem::size_of;
use std::ptr;

// ObjHeader carries per-object metadata and is prepended to every allocation.
// The pointer handed to the client is `header + 1`.
//
// +-------+------+----------------------------------------------+
// | name  | bits |                                              |
// +-------+------+----------------------------------------------+
// | size  |   32 | Declared payload size, not the rounded size. |
// +-------+------+----------------------------------------------+
// | alone |    1 | Object occupies an entire clump by itself.   |
// | pad   |    7 | Reserved, zero on allocation.                |
// +-------+------+----------------------------------------------+
// | type  |  ptr | Struct type descriptor; `ST_FREE` for freed  |
// |       |      | headers so the GC skips them.                |
// +-------+------+----------------------------------------------+
//
// Headers are aligned to the object alignment quantum and the payload follows
// immediately, so `size <= rounded(size) <= next_header - payload` holds for
// every live object. The first payload word of a freed header is reused as
// the next-in-freelist link.
#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
struct HeaderFlags {
    alone: bool,
    pad: B7,
}

#[repr(C, align(8))]
pub struct ObjHeader {
    size: u32,
    flags: HeaderFlags,
    tp: *const StructType,
}

impl ObjHeader {
    #[inline(always)]
    pub fn new(size: usize, tp: &'static StructType) -> Self {
        Self {
            size: size as u32,
            flags: HeaderFlags::new(),
            tp,
        }
    }

    /// Recover the header from a client payload pointer.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer previously handed out by an arena.
    #[inline(always)]
    pub unsafe fn from_payload(ptr: *const u8) -> *mut ObjHeader {
        (ptr as *mut ObjHeader).offset(-1)
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + size_of::<Self>()) as _
    }

    #[inline(always)]
    pub fn contents_size(&self) -> usize {
        self.size as usize
    }

    #[inline(always)]
    pub fn set_contents_size(&mut self, size: usize) {
        self.size = size as u32;
    }

    #[inline(always)]
    pub fn type_(&self) -> *const StructType {
        self.tp
    }

    #[inline(always)]
    pub fn set_type(&mut self, tp: &'static StructType) {
        self.tp = tp;
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        ptr::eq(self.tp, &ST_FREE)
    }

    #[inline(always)]
    pub fn alone(&self) -> bool {
        self.flags.alone()
    }

    #[inline(always)]
    pub fn set_alone(&mut self, alone: bool) {
        self.flags.set_alone(alone);
    }

    /// Clear the reserved bits; every allocation path resets them.
    #[inline(always)]
    pub fn clear_flags(&mut self) {
        self.flags = HeaderFlags::new();
    }
}

/// Called on an object right before its memory is reclaimed. Must not re-enter
/// the arena on the same object.
pub type FinalizeProc = unsafe fn(obj: *mut u8);

/// Reports every interior pointer of an object to the collector.
pub type EnumPtrsProc = unsafe fn(obj: *mut u8, size: usize, visit: &mut dyn FnMut(*mut u8));

/// Static descriptor of an allocatable structure type. The arena only reads
/// these fields; marking and relocation live with the collector.
pub struct StructType {
    /// Declared size of one element in bytes.
    pub ssize: u32,
    /// Diagnostic name.
    pub sname: &'static str,
    pub finalize: Option<FinalizeProc>,
    pub enum_ptrs: Option<EnumPtrsProc>,
}

/// Sentinel type for headers sitting on a freelist.
pub static ST_FREE: StructType = StructType {
    ssize: 0,
    sname: "(free)",
    finalize: None,
    enum_ptrs: None,
};

/// Untyped byte blocks; the GC never traces into them.
pub static ST_BYTES: StructType = StructType {
    ssize: 1,
    sname: "bytes",
    finalize: None,
    enum_ptrs: None,
};

/// Read the declared size back out of an allocation.
///
/// # Safety
/// `ptr` must be a live payload pointer.
pub unsafe fn object_size(ptr: *const u8) -> usize {
    (*ObjHeader::from_payload(ptr)).contents_size()
}

/// Read the type descriptor back out of an allocation.
///
/// # Safety
/// `ptr` must be a live payload pointer.
pub unsafe fn object_type(ptr: *const u8) -> *const StructType {
    (*ObjHeader::from_payload(ptr)).type_()
}

/// Retype an allocation in place; used when a generic block is given its real
/// type after construction. A null pointer is ignored.
///
/// # Safety
/// `ptr` must be null or a live payload pointer.
pub unsafe fn set_object_type(ptr: *mut u8, tp: &'static StructType) {
    if ptr.is_null() {
        return;
    }
    (*ObjHeader::from_payload(ptr)).set_type(tp);
}
