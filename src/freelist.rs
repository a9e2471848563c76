//! Size-bucketed freelists plus the large-block best-fit list.
//!
//! Buckets `1..=MAX_FREELIST_SIZE/OBJ_ALIGN` are strict LIFO stacks of
//! same-sized free objects; the distinguished large slot holds variable-sized
//! entries in arbitrary order and is scanned best-fit. The next-in-list link
//! lives in the first payload word of each freed object, which is why objects
//! smaller than a pointer never reach a freelist and are accounted as lost
//! instead.
use crate::arena::Arena;
use crate::header::ObjHeader;
use crate::{obj_align_round, OBJ_ALIGN};
use std::mem::size_of;
use std::ptr::null_mut;

/// Largest payload size served from the exact-size buckets.
pub const MAX_FREELIST_SIZE: usize = 376;
/// Index of the variable-sized large-block list.
pub const LARGE_FREELIST_INDEX: usize = MAX_FREELIST_SIZE / OBJ_ALIGN + 1;
pub const NUM_FREELISTS: usize = LARGE_FREELIST_INDEX + 1;

/// Bucket index for a declared payload size.
#[inline(always)]
pub fn free_list_index(size: usize) -> usize {
    if size > MAX_FREELIST_SIZE {
        LARGE_FREELIST_INDEX
    } else {
        (size + OBJ_ALIGN - 1) / OBJ_ALIGN
    }
}

/// Next-in-list link stored in the first payload word of a freed object.
#[inline(always)]
pub(crate) unsafe fn fl_next(payload: *mut u8) -> *mut u8 {
    (payload as *mut *mut u8).read()
}

#[inline(always)]
pub(crate) unsafe fn fl_set_next(payload: *mut u8, next: *mut u8) {
    (payload as *mut *mut u8).write(next);
}

impl Arena {
    /// Number of entries currently sitting on a freelist bucket.
    pub fn free_list_len(&self, index: usize) -> usize {
        let mut n = 0;
        let mut p = self.freelists[index];
        while !p.is_null() {
            n += 1;
            p = unsafe { fl_next(p) };
        }
        n
    }

    /// Allocate from the large-block freelist: best fit over the whole list,
    /// accepting early any block within 1/8 above the needed footprint. A
    /// completed scan that finds nothing refreshes `largest_free_size`, so the
    /// next miss short-circuits.
    pub(crate) unsafe fn large_freelist_alloc(&mut self, size: usize) -> *mut u8 {
        let aligned_size = obj_align_round(size);
        let aligned_min_size = aligned_size + size_of::<ObjHeader>();
        let aligned_max_size = aligned_min_size + obj_align_round(aligned_min_size / 8);
        let mut best_fit: *mut u8 = null_mut();
        let mut best_fit_prev: *mut *mut u8 = null_mut();
        let mut best_fit_size = usize::MAX;
        let mut largest_size = 0;

        if aligned_size > self.largest_free_size {
            return null_mut(); // definitely no block large enough
        }
        let mut ppfprev: *mut *mut u8 = &mut self.freelists[LARGE_FREELIST_INDEX];
        loop {
            let pfree = *ppfprev;
            if pfree.is_null() {
                break;
            }
            let declared = (*ObjHeader::from_payload(pfree)).contents_size();
            let free_size = obj_align_round(declared);
            if free_size == aligned_size || (free_size >= aligned_min_size && free_size < best_fit_size)
            {
                best_fit = pfree;
                best_fit_prev = ppfprev;
                best_fit_size = declared;
                if best_fit_size <= aligned_max_size {
                    break; // good enough fit to spare a scan of the whole list
                }
            }
            ppfprev = pfree as *mut *mut u8;
            if free_size > largest_size {
                largest_size = free_size;
            }
        }
        if best_fit.is_null() {
            // Nothing fits, but the completed scan gave us an accurate
            // largest_free_size for next time.
            self.largest_free_size = largest_size;
            return null_mut();
        }

        // Unlink, give the excess back to the free pool, set the real size.
        *best_fit_prev = fl_next(best_fit);
        self.trim_obj(best_fit, aligned_size, null_mut());
        (*ObjHeader::from_payload(best_fit)).set_contents_size(size);
        best_fit
    }

    /// Unlink every freed object inside `[bottom, top)` from its freelist.
    /// The range must contain only free objects. Works by bucket-counting the
    /// headers first and then unlinking exactly that many from each list,
    /// since the small buckets are ordered by age, not address.
    pub(crate) unsafe fn remove_range_from_freelist(&mut self, bottom: *mut u8, top: *mut u8) {
        let mut num_free = [0u32; NUM_FREELISTS];
        let mut smallest = NUM_FREELISTS;
        let mut largest = 0;
        let mut removed = 0;

        let mut cur = bottom;
        while cur < top {
            let size = (*(cur as *mut ObjHeader)).contents_size();
            cur = cur.add(crate::obj_size_round(size));
            let i = free_list_index(size);
            if i == 0 {
                // 0-length free blocks aren't kept on any list, because they
                // don't have room for a pointer.
                continue;
            }
            num_free[i] += 1;
            if i < smallest {
                smallest = i;
            }
            if i > largest {
                largest = i;
            }
        }

        for i in smallest..=largest.min(NUM_FREELISTS - 1) {
            let mut count = num_free[i];
            if count == 0 {
                continue;
            }
            let mut ppfprev: *mut *mut u8 = &mut self.freelists[i];
            loop {
                let pfree = *ppfprev;
                if pfree >= bottom && pfree < top {
                    *ppfprev = fl_next(pfree);
                    removed += obj_align_round((*ObjHeader::from_payload(pfree)).contents_size());
                    count -= 1;
                    if count == 0 {
                        break;
                    }
                } else {
                    ppfprev = pfree as *mut *mut u8;
                }
            }
        }
        // The range is being reclaimed wholesale, so whatever part of it had
        // been written off as lost is no longer lost.
        let range = top as usize - bottom as usize;
        self.lost.objects = self.lost.objects.saturating_sub(range - removed);
    }

    /// Total reclaimable object space: every freelist entry plus the bytes
    /// already written off as lost.
    pub(crate) unsafe fn compute_free_objects(&self) -> usize {
        let mut unused = self.lost.objects;
        for i in 0..NUM_FREELISTS {
            let mut pfree = self.freelists[i];
            while !pfree.is_null() {
                unused += obj_align_round((*ObjHeader::from_payload(pfree)).contents_size());
                pfree = fl_next(pfree);
            }
        }
        unused
    }
}
