//! Intrusive singly-linked list of GC roots.
use crate::arena::Arena;
use crate::raw::alloc_struct_raw;
use crate::VmError;
use std::mem::size_of;

/// What kind of pointer a root slot holds, for the collector's benefit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PtrKind {
    Struct,
    String,
    RefArray,
}

#[repr(C)]
pub struct GcRoot {
    pub next: *mut GcRoot,
    pub ptype: PtrKind,
    /// Address of the rooted pointer slot.
    pub p: *mut *mut u8,
    pub free_on_unregister: bool,
}

impl Arena {
    /// Register a GC root. When `rpp` carries a caller-owned record it is
    /// reused and stays the caller's to free; otherwise a record is allocated
    /// from the parent, published through `rpp` if one was passed, and freed
    /// again on unregistration.
    pub fn register_root(
        &mut self,
        rpp: Option<&mut *mut GcRoot>,
        ptype: PtrKind,
        up: *mut *mut u8,
        cname: &'static str,
    ) -> Result<(), VmError> {
        unsafe {
            let rp = match rpp {
                Some(slot) if !slot.is_null() => {
                    let rp = *slot;
                    (*rp).free_on_unregister = false;
                    rp
                }
                slot => {
                    let rp = alloc_struct_raw::<GcRoot>(&mut *self.parent, cname);
                    if rp.is_null() {
                        return Err(VmError::OutOfMemory);
                    }
                    (*rp).free_on_unregister = true;
                    if let Some(slot) = slot {
                        *slot = rp;
                    }
                    rp
                }
            };
            tracing::debug!(
                target: "clump_arena",
                client = cname,
                root = ?rp,
                slot = ?up,
                "register root"
            );
            (*rp).ptype = ptype;
            (*rp).p = up;
            (*rp).next = self.roots;
            self.roots = rp;
        }
        Ok(())
    }

    /// Unlink a root from the list, freeing the record if this arena
    /// allocated it.
    ///
    /// # Safety
    /// `rp` must be a root currently registered with this arena.
    pub unsafe fn unregister_root(&mut self, rp: *mut GcRoot, cname: &'static str) {
        tracing::debug!(target: "clump_arena", client = cname, root = ?rp, "unregister root");
        let mut rpp: *mut *mut GcRoot = &mut self.roots;
        while *rpp != rp {
            rpp = &mut (**rpp).next;
        }
        *rpp = (*rp).next;
        if (*rp).free_on_unregister {
            self.parent.free(rp as *mut u8, size_of::<GcRoot>(), cname);
        }
    }

    /// Walk the registered roots, most recent first.
    pub fn for_each_root(&self, mut callback: impl FnMut(&GcRoot)) {
        unsafe {
            let mut rp = self.roots;
            while !rp.is_null() {
                callback(&*rp);
                rp = (*rp).next;
            }
        }
    }
}
