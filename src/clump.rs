use crate::header::ObjHeader;
use crate::obj_size_round;
use std::mem::size_of;
use std::ptr::null_mut;

/// Bytes of string data covered by one quantum of the GC side tables.
pub const STRING_DATA_QUANTUM: usize = 16;
/// One mark byte per quantum.
pub const STRING_MARK_BYTES_PER_QUANTUM: usize = 1;
/// One relocation entry per quantum.
pub const STRING_RELOC_ENTRY_SIZE: usize = size_of::<u16>();
/// Footprint of one quantum: its data plus its share of the side tables.
pub const STRING_SPACE_QUANTUM: usize =
    STRING_DATA_QUANTUM + STRING_MARK_BYTES_PER_QUANTUM + STRING_RELOC_ENTRY_SIZE;

/// Number of whole string quanta (data + tables) that fit in `nbytes`.
#[inline(always)]
pub const fn string_space_quanta(nbytes: usize) -> usize {
    nbytes / STRING_SPACE_QUANTUM
}

#[inline(always)]
pub const fn string_quanta_mark_size(nquanta: usize) -> usize {
    nquanta * STRING_MARK_BYTES_PER_QUANTUM
}

/// Clump space needed to hold an `nbytes` string together with its share of
/// the side tables.
#[inline(always)]
pub const fn string_clump_space(nbytes: usize) -> usize {
    ((nbytes + STRING_DATA_QUANTUM - 1) / STRING_DATA_QUANTUM) * STRING_SPACE_QUANTUM
}

pub const CLUMP_MAGIC: u32 = 0xfeed_c1a5;

/// Admin struct at the base of every clump backing buffer. The magic word lets
/// the debug surface check that a buffer really is clump storage; the back
/// pointer identifies the owning clump across inner/outer sharing.
#[repr(C)]
pub struct ClumpHead {
    pub cp: *mut Clump,
    pub magic: u32,
}

// One contiguous backing buffer. The object area grows upward from `cbase`,
// the string area grows downward from `climit`; they meet in the middle. When
// strings are permitted, `[climit, cend)` holds the string mark and relocation
// tables the collector uses.
//
//   chead   cbase     cbot          ctop      climit     cend
//   | head  | objects |      free   | strings | GC tables |
//
// Invariants: cbase <= cbot <= ctop <= climit <= cend; no two clumps overlap;
// the tree links are BST-ordered on cbase with symmetric parent pointers.
#[repr(C)]
pub struct Clump {
    pub chead: *mut ClumpHead,
    pub cbase: *mut u8,
    pub cbot: *mut u8,
    pub ctop: *mut u8,
    pub climit: *mut u8,
    pub cend: *mut u8,
    /// Byte after the highest freed object below `cbot`; when nothing free
    /// sits above this mark, per-clump consolidation can be skipped.
    pub int_freed_top: *mut u8,
    pub sbase: *mut u8,
    pub smark: *mut u8,
    pub smark_size: usize,
    pub sreloc: *mut u16,
    pub sfree1: *mut u32,
    pub sfree: u16,
    /// The clump holds a single oversized object; no further allocation here.
    pub alone: bool,
    pub has_refs: bool,
    /// Non-null when this clump borrows its bytes from an enclosing clump.
    pub outer: *mut Clump,
    pub inner_count: u32,
    pub left: *mut Clump,
    pub right: *mut Clump,
    pub parent: *mut Clump,
}

impl Clump {
    /// Lay out a clump over `[bot, top)`. `bot` must be aligned; `top` need
    /// not be. Tree links are cleared; linking is the caller's business.
    ///
    /// # Safety
    /// `cp` must point to clump-struct storage and `[bot, top)` must be a live
    /// buffer owned by the caller (or by `outer`).
    pub unsafe fn init(
        cp: *mut Clump,
        bot: *mut u8,
        top: *mut u8,
        has_strings: bool,
        outer: *mut Clump,
    ) {
        if !outer.is_null() {
            (*outer).inner_count += 1;
        }
        let head = bot as *mut ClumpHead;
        head.write(ClumpHead {
            cp,
            magic: CLUMP_MAGIC,
        });
        let cdata = bot.add(size_of::<ClumpHead>());

        let climit;
        let mut smark = null_mut();
        let mut smark_size = 0;
        let mut sreloc: *mut u16 = null_mut();
        let mut sfree1: *mut u32 = null_mut();
        if has_strings
            && top as usize - cdata as usize >= STRING_SPACE_QUANTUM + size_of::<usize>() - 1
        {
            // Size the mark and reloc tables to cover the whole clump.
            let nquanta = string_space_quanta(top as usize - cdata as usize);
            climit = cdata.add(nquanta * STRING_DATA_QUANTUM);
            smark = climit;
            smark_size = string_quanta_mark_size(nquanta);
            sreloc = climit.add(smark_size) as *mut u16;
            sfree1 = sreloc as *mut u32;
        } else {
            climit = top;
        }

        cp.write(Clump {
            chead: head,
            cbase: cdata,
            cbot: cdata,
            ctop: climit,
            climit,
            cend: top,
            int_freed_top: cdata,
            sbase: cdata,
            smark,
            smark_size,
            sreloc,
            sfree1,
            sfree: 0,
            alone: false,
            has_refs: false,
            outer,
            inner_count: 0,
            left: null_mut(),
            right: null_mut(),
            parent: null_mut(),
        });
        Clump::init_free_strings(cp);
    }

    /// Reset the string freelist tables of a clump.
    ///
    /// # Safety
    /// `cp` must be an initialized clump.
    pub unsafe fn init_free_strings(cp: *mut Clump) {
        if !(*cp).sfree1.is_null() {
            std::ptr::write_bytes(
                (*cp).sfree1 as *mut u8,
                0,
                (*cp).smark_size * STRING_RELOC_ENTRY_SIZE,
            );
        }
        (*cp).sfree = 0;
    }

    #[inline(always)]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.cbase as *const u8 <= ptr && ptr < self.cend as *const u8
    }

    /// Free space between the two bump pointers.
    #[inline(always)]
    pub fn free_space(&self) -> usize {
        self.ctop as usize - self.cbot as usize
    }

    /// Iterate the object headers in `[cbase, cbot)`.
    pub(crate) fn objects(&self) -> ObjScan {
        ObjScan {
            cur: self.cbase,
            top: self.cbot,
        }
    }
}

pub(crate) struct ObjScan {
    cur: *mut u8,
    top: *mut u8,
}

impl Iterator for ObjScan {
    type Item = *mut ObjHeader;

    fn next(&mut self) -> Option<*mut ObjHeader> {
        if self.cur >= self.top {
            return None;
        }
        let pre = self.cur as *mut ObjHeader;
        unsafe {
            self.cur = self.cur.add(obj_size_round((*pre).contents_size()));
        }
        Some(pre)
    }
}
