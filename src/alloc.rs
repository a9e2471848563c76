//! The allocation engine: fast paths, the slow path, resize, trim, free,
//! strings, consolidation and scavenging.
//!
//! Movable object allocation tries, in order: the exact-size freelist, the
//! large-block freelist, a LIFO bump in the current clump, and finally the
//! slow path, which walks the clump tree forward from the current clump and
//! ends by acquiring a fresh clump (uncontrolled arenas) or scavenging a run
//! of adjacent free objects (controlled arenas).
use crate::arena::Arena;
use crate::clump::{string_clump_space, string_space_quanta, Clump, ClumpHead, STRING_DATA_QUANTUM};
use crate::freelist::{
    fl_next, fl_set_next, free_list_index, LARGE_FREELIST_INDEX, MAX_FREELIST_SIZE,
};
use crate::header::{ObjHeader, StructType, ST_BYTES, ST_FREE};
use crate::splay::{splay_app, SplayAppResult, SplayWalker};
use crate::{obj_align_round, obj_size_round, OBJ_ALIGN};
use std::mem::size_of;
use std::ptr::{self, null_mut, NonNull};

/// Debug sanity window for struct descriptor sizes.
#[cfg(debug_assertions)]
const MAX_SANE_STRUCT_SIZE: u32 = 0x20_0000;

#[derive(Clone, Copy)]
pub(crate) struct AllocFlags {
    /// Entry point skipped the fast path, so the slow path still has to try
    /// the large freelist.
    pub direct: bool,
    pub immovable: bool,
}

enum FastPath {
    SmallFreelist,
    LargeFreelist,
    Lifo,
}

#[cfg(debug_assertions)]
fn check_struct_size(tp: &'static StructType) -> bool {
    if tp.ssize == 0 || tp.ssize >= MAX_SANE_STRUCT_SIZE {
        tracing::error!(
            target: "clump_arena",
            "struct type {} has insane size {}",
            tp.sname,
            tp.ssize
        );
        return false;
    }
    true
}

#[cfg(not(debug_assertions))]
fn check_struct_size(_tp: &'static StructType) -> bool {
    true
}

#[inline(always)]
unsafe fn can_alloc_at_end(cp: *mut Clump, asize: usize) -> bool {
    !cp.is_null() && !(*cp).alone && (*cp).free_space() > asize + size_of::<ObjHeader>()
}

impl Arena {
    #[inline]
    pub(crate) fn trace(
        &self,
        tag: &str,
        cname: &str,
        tp: Option<&StructType>,
        size: usize,
        ptr: *const u8,
    ) {
        if let Some(t) = self.tracer.as_ref() {
            match tp {
                Some(tp) => t.line(&format!(
                    "[a{}] {} {}({}) {:p}",
                    tag, cname, tp.sname, size, ptr
                )),
                None => t.line(&format!("[a{}] {}({}) {:p}", tag, cname, size, ptr)),
            }
        }
    }

    /// The four-attempt fast path shared by the movable entry points.
    #[inline]
    unsafe fn try_fast(
        &mut self,
        size: usize,
        tp: &'static StructType,
    ) -> Option<(NonNull<u8>, FastPath)> {
        if size <= MAX_FREELIST_SIZE {
            let i = free_list_index(size);
            let head = self.freelists[i];
            if !head.is_null() {
                self.freelists[i] = fl_next(head);
                let pre = ObjHeader::from_payload(head);
                (*pre).set_contents_size(size);
                (*pre).set_type(tp);
                return Some((NonNull::new_unchecked(head), FastPath::SmallFreelist));
            }
        } else {
            let ptr = self.large_freelist_alloc(size);
            if !ptr.is_null() {
                (*ObjHeader::from_payload(ptr)).set_type(tp);
                return Some((NonNull::new_unchecked(ptr), FastPath::LargeFreelist));
            }
        }
        let cc = self.cc;
        if !cc.is_null()
            && !(*cc).alone
            && (*cc).free_space() >= size + (OBJ_ALIGN + size_of::<ObjHeader>() * 2)
            && size < self.large_size
        {
            let pre = (*cc).cbot as *mut ObjHeader;
            (*cc).cbot = (*cc).cbot.add(obj_size_round(size));
            pre.write(ObjHeader::new(size, tp));
            return Some((NonNull::new_unchecked((*pre).payload()), FastPath::Lifo));
        }
        None
    }

    /// Untyped byte block, movable.
    pub fn alloc_bytes(&mut self, size: usize, cname: &'static str) -> Option<NonNull<u8>> {
        unsafe {
            if size != size as u32 as usize {
                return None;
            }
            if let Some((ptr, path)) = self.try_fast(size, &ST_BYTES) {
                let tag = match path {
                    FastPath::SmallFreelist => ":+bf",
                    FastPath::LargeFreelist => ":+bF",
                    FastPath::Lifo => ":+b ",
                };
                self.trace(tag, cname, None, size, ptr.as_ptr());
                return Some(ptr);
            }
            let ptr = self.alloc_obj(
                size,
                &ST_BYTES,
                AllocFlags {
                    direct: false,
                    immovable: false,
                },
                cname,
            )?;
            self.trace(":+b.", cname, None, size, ptr.as_ptr());
            Some(ptr)
        }
    }

    /// Untyped byte block in a clump of its own, never moved by the GC.
    pub fn alloc_bytes_immovable(
        &mut self,
        size: usize,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        if self.is_controlled {
            // Controlled arenas never compact, so movable is immovable.
            return self.alloc_bytes(size, cname);
        }
        unsafe {
            if size != size as u32 as usize {
                return None;
            }
            let ptr = self.alloc_obj(
                size,
                &ST_BYTES,
                AllocFlags {
                    direct: true,
                    immovable: true,
                },
                cname,
            )?;
            self.trace("|+b.", cname, None, size, ptr.as_ptr());
            Some(ptr)
        }
    }

    /// Typed object of size `tp.ssize`, movable.
    pub fn alloc_struct(
        &mut self,
        tp: &'static StructType,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        if !check_struct_size(tp) {
            return None;
        }
        let size = tp.ssize as usize;
        unsafe {
            if let Some((ptr, path)) = self.try_fast(size, tp) {
                let tag = match path {
                    FastPath::SmallFreelist => ":+<f",
                    FastPath::LargeFreelist => ":+<F",
                    FastPath::Lifo => ":+< ",
                };
                self.trace(tag, cname, Some(tp), size, ptr.as_ptr());
                return Some(ptr);
            }
            let ptr = self.alloc_obj(
                size,
                tp,
                AllocFlags {
                    direct: false,
                    immovable: false,
                },
                cname,
            )?;
            self.trace(":+<.", cname, Some(tp), size, ptr.as_ptr());
            Some(ptr)
        }
    }

    /// Typed object in a clump of its own.
    pub fn alloc_struct_immovable(
        &mut self,
        tp: &'static StructType,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        if self.is_controlled {
            return self.alloc_struct(tp, cname);
        }
        if !check_struct_size(tp) {
            return None;
        }
        unsafe {
            let ptr = self.alloc_obj(
                tp.ssize as usize,
                tp,
                AllocFlags {
                    direct: true,
                    immovable: true,
                },
                cname,
            )?;
            self.trace("|+<.", cname, Some(tp), tp.ssize as usize, ptr.as_ptr());
            Some(ptr)
        }
    }

    /// `num * elt` untyped bytes with an overflow check.
    pub fn alloc_byte_array(
        &mut self,
        num_elements: usize,
        elt_size: usize,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        self.alloc_array(num_elements, elt_size, &ST_BYTES, false, cname)
    }

    pub fn alloc_byte_array_immovable(
        &mut self,
        num_elements: usize,
        elt_size: usize,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        self.alloc_array(num_elements, elt_size, &ST_BYTES, true, cname)
    }

    /// `num` typed elements with an overflow check.
    pub fn alloc_struct_array(
        &mut self,
        num_elements: usize,
        tp: &'static StructType,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        if !check_struct_size(tp) {
            return None;
        }
        self.alloc_array(num_elements, tp.ssize as usize, tp, false, cname)
    }

    pub fn alloc_struct_array_immovable(
        &mut self,
        num_elements: usize,
        tp: &'static StructType,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        if !check_struct_size(tp) {
            return None;
        }
        self.alloc_array(num_elements, tp.ssize as usize, tp, true, cname)
    }

    fn alloc_array(
        &mut self,
        num_elements: usize,
        elt_size: usize,
        tp: &'static StructType,
        immovable: bool,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        let size = num_elements.checked_mul(elt_size)?;
        if size != size as u32 as usize {
            return None;
        }
        let immovable = immovable && !self.is_controlled;
        unsafe {
            let ptr = self.alloc_obj(
                size,
                tp,
                AllocFlags {
                    direct: true,
                    immovable,
                },
                cname,
            )?;
            self.trace(
                if immovable { "|+a." } else { ":+a." },
                cname,
                Some(tp),
                size,
                ptr.as_ptr(),
            );
            Some(ptr)
        }
    }

    /// Everything but the fastest, simplest case.
    #[cold]
    pub(crate) unsafe fn alloc_obj(
        &mut self,
        lsize: usize,
        tp: &'static StructType,
        flags: AllocFlags,
        _cname: &'static str,
    ) -> Option<NonNull<u8>> {
        let pre;

        if lsize >= self.large_size || flags.immovable {
            // Give the object a clump all its own. A controlled arena never
            // takes this path.
            let asize = obj_align_round(lsize) + size_of::<ObjHeader>();
            if asize < lsize {
                return None;
            }
            let cp = self.acquire_clump(
                asize + size_of::<ClumpHead>(),
                false,
                "large object clump",
            );
            if cp.is_null() {
                return None;
            }
            (*cp).alone = true;
            pre = (*cp).cbot as *mut ObjHeader;
            (*cp).cbot = (*cp).cbot.add(asize);
            pre.write(ObjHeader::new(lsize, tp));
            (*pre).set_alone(true);
        } else {
            let asize = obj_size_round(lsize);

            if lsize > MAX_FREELIST_SIZE && flags.direct {
                // This entry point hasn't checked the large freelist yet.
                let ptr = self.large_freelist_alloc(lsize);
                if !ptr.is_null() {
                    (*ObjHeader::from_payload(ptr)).set_type(tp);
                    return Some(NonNull::new_unchecked(ptr));
                }
            }

            // Cycle through the clumps, starting with the currently open one.
            let mut sw = SplayWalker::init_mid(self.cc);
            if sw.first().is_null() {
                // Open an arbitrary clump.
                sw = SplayWalker::init(self.root);
                self.cc = sw.first();
                self.open_clump();
            }

            let mut found: *mut ObjHeader = null_mut();
            loop {
                if can_alloc_at_end(self.cc, asize) {
                    found = (*self.cc).cbot as *mut ObjHeader;
                    break;
                }
                if self.is_controlled {
                    // Try consolidating free space before moving on.
                    self.consolidate();
                    if can_alloc_at_end(self.cc, asize) {
                        found = (*self.cc).cbot as *mut ObjHeader;
                        break;
                    }
                }
                let cp = sw.fwd();
                if cp.is_null() {
                    break;
                }
                self.close_clump();
                self.cc = cp;
                self.open_clump();
            }

            if found.is_null() && !self.is_controlled {
                // Add another clump.
                let cp = self.add_clump_internal(self.clump_size, "clump");
                if !cp.is_null() {
                    found = (*cp).cbot as *mut ObjHeader;
                }
            }

            if !found.is_null() {
                (*self.cc).cbot = (found as *mut u8).add(asize);
            } else {
                // Controlled arenas get one last chance: glue adjacent free
                // objects back together from low memory.
                if !self.is_controlled {
                    return None;
                }
                found = self.scavenge_low_free(lsize);
                if found.is_null() {
                    return None;
                }
            }
            pre = found;
            pre.write(ObjHeader::new(lsize, tp));
        }
        Some(NonNull::new_unchecked((*pre).payload()))
    }

    /// Shrink `obj` to `size` bytes. Equal rounded sizes only rewrite the
    /// declared size; an alone object just lowers its clump's bump pointer;
    /// otherwise the excess tail becomes a free object, pushed onto a
    /// freelist when it is at least one alignment quantum, written off as
    /// lost when it is smaller.
    pub(crate) unsafe fn trim_obj(&mut self, obj: *mut u8, size: usize, cp: *mut Clump) {
        let rounded_size = obj_align_round(size);
        let pre = ObjHeader::from_payload(obj);
        let excess_pre = obj.add(rounded_size) as *mut ObjHeader;
        let old_rounded_size = obj_align_round((*pre).contents_size());
        let excess_size = old_rounded_size - rounded_size - size_of::<ObjHeader>();

        (*pre).set_contents_size(size);
        if old_rounded_size == rounded_size {
            return; // nothing more to do here
        }
        if (*pre).alone() {
            // Alone object: the clump's bump pointer tracks the object end.
            let mut cp = cp;
            if cp.is_null() {
                cp = self.locate(obj);
            }
            if !cp.is_null() {
                debug_assert!(
                    (*cp).cbot == obj.add(old_rounded_size),
                    "trimming alone object {:p}: cbot out of step",
                    obj
                );
                (*cp).cbot = excess_pre as *mut u8;
                return;
            }
            (*pre).clear_flags();
        }
        excess_pre.write(ObjHeader::new(excess_size, &ST_FREE));
        if excess_size >= OBJ_ALIGN {
            let excess_payload = (*excess_pre).payload();
            if !self.cc.is_null() && (excess_pre as *mut u8) >= (*self.cc).int_freed_top {
                (*self.cc).int_freed_top = (excess_pre as *mut u8).add(excess_size);
            }
            let i = if excess_size <= MAX_FREELIST_SIZE {
                free_list_index(excess_size)
            } else {
                let rounded = obj_align_round(excess_size);
                if rounded > self.largest_free_size {
                    self.largest_free_size = rounded;
                }
                LARGE_FREELIST_INDEX
            };
            fl_set_next(excess_payload, self.freelists[i]);
            self.freelists[i] = excess_payload;
        } else {
            // Too small to link anywhere.
            self.lost.objects += excess_size + size_of::<ObjHeader>();
        }
    }

    /// Free an object: run the finalizer, then give the bytes back to the
    /// bump pointer, the owning clump, or a freelist, in that order of
    /// preference. Bytes the arena cannot reuse are accounted as lost.
    ///
    /// # Safety
    /// `ptr` must be null or a payload pointer allocated from this arena (or
    /// an outer save level of it) that is freed at most once.
    pub unsafe fn free_object(&mut self, ptr: *mut u8, cname: &'static str) {
        if !self.free_enabled || ptr.is_null() {
            return;
        }
        let pre = ObjHeader::from_payload(ptr);
        let tp = (*pre).type_();

        #[cfg(debug_assertions)]
        {
            if (*pre).is_free() {
                tracing::error!(
                    target: "clump_arena",
                    "{}: object {:p} already free",
                    cname,
                    ptr
                );
                return;
            }
            if self.locate(ptr).is_null() && self.saved.is_null() {
                tracing::error!(
                    target: "clump_arena",
                    "{}: freeing {:p}, not owned by this arena",
                    cname,
                    ptr
                );
                return;
            }
        }

        let size = (*pre).contents_size();
        let rounded_size = obj_align_round(size);
        if let Some(finalize) = (*tp).finalize {
            finalize(ptr);
        }

        if !self.cc.is_null() && ptr.add(rounded_size) == (*self.cc).cbot {
            // The object sits right below the bump pointer.
            self.trace(":-o ", cname, Some(&*tp), size, ptr);
            (*self.cc).cbot = pre as *mut u8;
            // If it touches the byte after the highest freed object, the
            // whole top of the clump may now be consolidatable.
            if (pre as *mut u8) <= (*self.cc).int_freed_top {
                let cc = self.cc;
                self.consolidate_clump_free(cc);
            }
            return;
        }
        if (*pre).alone() {
            // We gave this object its own clump. Free the entire clump,
            // unless it belongs to an older save level, in which case we
            // mustn't overwrite it.
            let cp = self.locate(ptr);
            if !cp.is_null() {
                self.trace(":-oL", cname, Some(&*tp), size, ptr);
                if !self.is_controlled {
                    self.free_clump(cp);
                }
                return;
            }
        }
        if rounded_size >= size_of::<*mut u8>() {
            // Put the object on a freelist, unless it belongs to an older
            // save level.
            let cp = self.locate(ptr);
            if !cp.is_null() {
                self.cfreed = cp;
                let i = if size > MAX_FREELIST_SIZE {
                    let rounded = rounded_size;
                    if rounded > self.largest_free_size {
                        self.largest_free_size = rounded;
                    }
                    LARGE_FREELIST_INDEX
                } else {
                    free_list_index(size)
                };
                // Keep track of the highest object on a freelist, in the
                // currently open clump if that is where the object lives.
                let track = if !self.cc.is_null() && (*cp).chead == (*self.cc).chead {
                    self.cc
                } else {
                    cp
                };
                if (pre as *mut u8) >= (*track).int_freed_top {
                    (*track).int_freed_top = ptr.add(rounded_size);
                }
                (*pre).set_type(&ST_FREE); // don't confuse the GC
                fl_set_next(ptr, self.freelists[i]);
                self.freelists[i] = ptr;
                self.trace(
                    if size > MAX_FREELIST_SIZE { ":-oF" } else { ":-of" },
                    cname,
                    Some(&*tp),
                    size,
                    ptr,
                );
                return;
            }
        } else {
            (*pre).set_type(&ST_FREE); // don't confuse the GC
        }
        self.trace(":-o#", cname, Some(&*tp), size, ptr);
        self.lost.objects += obj_size_round(size);
    }

    /// Grow or shrink an object in place where possible; reallocate, copy and
    /// free otherwise. `new_num_elements` is scaled by the object's type size.
    ///
    /// # Safety
    /// `ptr` must be a live payload pointer allocated from this arena.
    pub unsafe fn resize_object(
        &mut self,
        ptr: *mut u8,
        new_num_elements: usize,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        let pre = ObjHeader::from_payload(ptr);
        let tp: &'static StructType = &*(*pre).type_();
        let old_size = (*pre).contents_size();
        let new_size = (tp.ssize as usize).checked_mul(new_num_elements)?;
        let old_size_rounded = obj_align_round(old_size);
        let new_size_rounded = obj_align_round(new_size);

        if new_size_rounded != new_size_rounded as u32 as usize {
            return None;
        }

        if old_size_rounded == new_size_rounded {
            (*pre).set_contents_size(new_size);
            return Some(NonNull::new_unchecked(ptr));
        }
        if !self.cc.is_null()
            && ptr.add(old_size_rounded) == (*self.cc).cbot
            && (*self.cc).ctop as usize - ptr as usize >= new_size_rounded
        {
            // Topmost object: move the bump pointer and be done.
            (*self.cc).cbot = ptr.add(new_size_rounded);
            (*pre).set_contents_size(new_size);
            self.trace(":<> ", cname, Some(tp), new_size, ptr);
            return Some(NonNull::new_unchecked(ptr));
        }
        if new_size_rounded + size_of::<ObjHeader>() <= old_size_rounded {
            // Shrinking with room for the tail's dummy header.
            self.trim_obj(ptr, new_size, null_mut());
            self.trace(":<> ", cname, Some(tp), new_size, ptr);
            return Some(NonNull::new_unchecked(ptr));
        }
        // Punt.
        let new_obj = self.alloc_struct_array(new_num_elements, tp, cname)?;
        ptr::copy_nonoverlapping(ptr, new_obj.as_ptr(), old_size.min(new_size));
        self.free_object(ptr, cname);
        Some(new_obj)
    }

    /// Raw bytes from the string area. Cycles through the clumps starting at
    /// the current one, then acquires a string clump (or a solo clump for a
    /// string at least `large_size` long).
    pub fn alloc_string(&mut self, nbytes: usize, cname: &'static str) -> Option<NonNull<u8>> {
        unsafe {
            let mut sw = SplayWalker::init_mid(self.cc);
            if sw.first().is_null() {
                // Open an arbitrary clump.
                sw = SplayWalker::init(self.root);
                self.cc = sw.first();
                self.open_clump();
            }
            loop {
                let cc = self.cc;
                if !cc.is_null() && !(*cc).alone && (*cc).free_space() > nbytes {
                    (*cc).ctop = (*cc).ctop.sub(nbytes);
                    self.trace(":+> ", cname, None, nbytes, (*cc).ctop);
                    return Some(NonNull::new_unchecked((*cc).ctop));
                }
                let cp = sw.fwd();
                if !cp.is_null() {
                    self.close_clump();
                    self.cc = cp;
                    self.open_clump();
                    continue;
                }
                if nbytes
                    > string_space_quanta(usize::MAX - size_of::<ClumpHead>())
                        * STRING_DATA_QUANTUM
                {
                    // Can't even represent the needed clump space.
                    return None;
                }
                if nbytes >= self.large_size {
                    return self.alloc_string_immovable(nbytes, cname);
                }
                // Add another clump and try again.
                let cp = self.acquire_clump(self.clump_size, true, "clump");
                if cp.is_null() {
                    return None;
                }
                self.close_clump();
                sw = SplayWalker::init_mid(cp);
                self.cc = cp;
                self.open_clump();
            }
        }
    }

    /// Raw bytes in a string clump of their own.
    pub fn alloc_string_immovable(
        &mut self,
        nbytes: usize,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        unsafe {
            let asize = string_clump_space(nbytes) + size_of::<ClumpHead>();
            let cp = self.acquire_clump(asize, true, "large string clump");
            if cp.is_null() {
                return None;
            }
            (*cp).alone = true;
            (*cp).ctop = (*cp).climit.sub(nbytes);
            self.trace("|+>L", cname, None, nbytes, (*cp).ctop);
            Some(NonNull::new_unchecked((*cp).ctop))
        }
    }

    /// Resize a string. In place only for the bottom-most string of the
    /// current clump; shrinking elsewhere keeps the data pointer and writes
    /// the tail off as lost.
    ///
    /// # Safety
    /// `data` must be a live string of length `old_num` from this arena.
    pub unsafe fn resize_string(
        &mut self,
        data: *mut u8,
        old_num: usize,
        new_num: usize,
        cname: &'static str,
    ) -> Option<NonNull<u8>> {
        if old_num == new_num {
            return Some(NonNull::new_unchecked(data));
        }
        if !self.cc.is_null()
            && data == (*self.cc).ctop
            && (new_num < old_num || (*self.cc).free_space() > new_num - old_num)
        {
            // Bottom-most string: resize in place.
            let ptr = data.offset(old_num as isize - new_num as isize);
            (*self.cc).ctop = ptr;
            ptr::copy(data, ptr, old_num.min(new_num));
            self.trace(":<> ", cname, None, new_num, ptr);
            return Some(NonNull::new_unchecked(ptr));
        }
        if new_num < old_num {
            // Trim in place and leave a hole.
            self.lost.strings += old_num - new_num;
            self.trace(":<>#", cname, None, new_num, data);
            return Some(NonNull::new_unchecked(data));
        }
        // Punt.
        let ptr = self.alloc_string(new_num, cname)?;
        ptr::copy_nonoverlapping(data, ptr.as_ptr(), old_num.min(new_num));
        self.free_string(data, old_num, cname);
        Some(ptr)
    }

    /// Free a string: raise the bump pointer when it is the bottom-most
    /// string of the current clump, otherwise account the bytes as lost.
    ///
    /// # Safety
    /// `data` must be null or a live string of length `nbytes` from this
    /// arena, freed at most once.
    pub unsafe fn free_string(&mut self, data: *mut u8, nbytes: usize, cname: &'static str) {
        if !self.free_enabled || data.is_null() {
            return;
        }
        if !self.cc.is_null() && data == (*self.cc).ctop {
            self.trace(":-> ", cname, None, nbytes, data);
            (*self.cc).ctop = (*self.cc).ctop.add(nbytes);
        } else {
            self.trace(":->#", cname, None, nbytes, data);
            self.lost.strings += nbytes;
        }
    }

    /// Consolidate free objects contiguous to the free space at `cbot` onto
    /// the cbot area, and recompute the end of the highest internal free run.
    pub(crate) unsafe fn consolidate_clump_free(&mut self, cp: *mut Clump) {
        let mut begin_free: *mut ObjHeader = null_mut();

        (*cp).int_freed_top = (*cp).cbase; // below all objects in the clump
        for pre in (*cp).objects() {
            if (*pre).is_free() {
                if begin_free.is_null() {
                    begin_free = pre;
                }
            } else {
                if !begin_free.is_null() {
                    // First byte following an internal free run.
                    (*cp).int_freed_top = pre as *mut u8;
                }
                begin_free = null_mut();
            }
        }
        if !begin_free.is_null() {
            // Free objects run all the way up to cbot: unhook them from the
            // freelists and hand the run back to the bump area.
            self.remove_range_from_freelist(begin_free as *mut u8, (*cp).cbot);
            tracing::debug!(
                target: "clump_arena",
                clump = ?cp,
                old_cbot = ?(*cp).cbot,
                new_cbot = ?begin_free,
                "consolidated clump top"
            );
            (*cp).cbot = begin_free as *mut u8;
        }
    }

    /// Consolidate every clump; wholly empty clumps go back to the parent
    /// (uncontrolled arenas only).
    pub fn consolidate(&mut self) {
        unsafe {
            self.close_clump();
            let root = self.root;
            splay_app(root, &mut |cp| {
                unsafe {
                    self.consolidate_clump_free(cp);
                    if (*cp).cbot == (*cp).cbase
                        && (*cp).ctop == (*cp).climit
                        && !self.is_controlled
                    {
                        // The entire clump is free.
                        self.free_clump(cp);
                    }
                }
                SplayAppResult::Continue
            });
            // If the walk freed the current clump, fall back to the root.
            if self.cc.is_null() {
                self.cc = self.root;
            }
            self.open_clump();
        }
    }

    /// Depth-first hunt for a contiguous run of freed objects big enough for
    /// `request_size`. The first hit is unhooked from the freelists, merged
    /// under one header, and trimmed down to the request; the tail goes back
    /// to a freelist.
    pub(crate) unsafe fn scavenge_low_free(&mut self, request_size: usize) -> *mut ObjHeader {
        let need_free = obj_size_round(request_size); // room for the GC's dummy header
        let mut found_pre: *mut ObjHeader = null_mut();
        let root = self.root;
        splay_app(root, &mut |cp| unsafe {
            let mut begin_free: *mut ObjHeader = null_mut();
            let mut found_free = 0;
            for pre in (*cp).objects() {
                if (*pre).is_free() {
                    if begin_free.is_null() {
                        found_free = 0;
                        begin_free = pre;
                    }
                    found_free += obj_size_round((*pre).contents_size());
                    if found_free >= need_free {
                        break;
                    }
                } else {
                    begin_free = null_mut();
                }
            }
            if !begin_free.is_null() && found_free >= need_free {
                // Fish the pieces out of their freelists and glue them back
                // together under a single header.
                self.remove_range_from_freelist(
                    begin_free as *mut u8,
                    (begin_free as *mut u8).add(found_free),
                );
                (*begin_free).set_type(&ST_FREE); // don't confuse the GC if it gets lost
                (*begin_free).set_contents_size(found_free - size_of::<ObjHeader>());
                (*begin_free).clear_flags();
                found_pre = begin_free;
                // Chop off the excess tail and toss it back into the pool.
                self.trim_obj((*begin_free).payload(), request_size, cp);
                SplayAppResult::Stop
            } else {
                SplayAppResult::Continue
            }
        });
        found_pre
    }
}
