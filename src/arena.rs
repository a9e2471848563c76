use crate::clump::{Clump, ClumpHead};
use crate::freelist::NUM_FREELISTS;
use crate::header::{ObjHeader, StructType};
use crate::raw::{alloc_struct_raw, RawMemory};
use crate::splay::{splay_app, splay_insert, splay_move_to_root, splay_remove, SplayAppResult};
use crate::trace::AllocTracer;
use crate::{round_up, VmError, OBJ_ALIGN};
use atomic::{Atomic, Ordering};
use std::mem::size_of;
use std::ptr::{self, null_mut};
use std::sync::Arc;

/// Largest value `max_vm` can take. Kept below `usize::MAX` so the limit
/// arithmetic never overflows.
pub const MAX_MAX_VM: usize = usize::MAX / 2;
/// Clamp window for `set_vm_threshold`.
pub const MIN_VM_THRESHOLD: i64 = 10_000;
pub const MAX_VM_THRESHOLD: i64 = MAX_MAX_VM as i64;
/// Cap on unchecked growth while GC is disabled, so that collections still
/// happen every few megabytes once it is enabled again.
pub const FORCE_GC_LIMIT: usize = 8_000_000;

/// GC policy knobs and bookkeeping the collector reads back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcStatus {
    pub vm_threshold: usize,
    pub max_vm: usize,
    /// Armed when non-zero: the value stored into the shared signal cell when
    /// allocation crosses the limit. Only the embedding interpreter sets it.
    pub signal_value: u64,
    pub enabled: bool,
    /// Bytes requested while over the limit, for the collector to observe.
    pub requested: usize,
}

/// Bytes surrendered without being reclaimable: objects freed at older save
/// levels, trimmed string tails, fragments too small to link into a freelist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Lost {
    pub objects: usize,
    pub refs: usize,
    pub strings: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreviousStatus {
    pub allocated: usize,
    pub used: usize,
}

/// Snapshot returned by [`Arena::status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaStatus {
    pub allocated: usize,
    pub used: usize,
    pub max_used: usize,
    pub is_thread_safe: bool,
}

/// Shared cell the arena stores its `signal_value` into when allocation
/// crosses the limit. The interpreter polls it at safe points and decides
/// when to actually collect; the arena never forces a collection itself.
pub struct GcSignal(Atomic<u64>);

impl GcSignal {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    pub(crate) fn raise(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// Intrusive list node for the stream library; the arena only ever unlinks
/// these wholesale in [`Arena::prepare_gc`].
#[repr(C)]
pub struct StreamNode {
    pub next: *mut StreamNode,
    pub prev: *mut StreamNode,
}

/// Type descriptor for the arena struct itself, which lives inside its own
/// solo clump and so participates in the ownership discipline it manages.
pub static ST_ARENA: StructType = StructType {
    ssize: size_of::<Arena>() as u32,
    sname: "arena",
    finalize: None,
    enum_ptrs: None,
};

/// The allocator instance. Owns every clump in its tree; each clump owns its
/// backing buffer unless it has an `outer`, in which case it only holds a
/// window into the outer's bytes.
#[allow(dead_code)]
pub struct Arena {
    pub(crate) parent: Box<dyn RawMemory>,
    pub(crate) tracer: Option<Arc<dyn AllocTracer>>,
    pub(crate) gc_signal: Arc<GcSignal>,
    /// Stable-memory twin; the arena itself unless rewired by the embedder.
    pub(crate) stable: *mut Arena,

    pub(crate) root: *mut Clump,
    /// Current clump, tried first for new allocations.
    pub(crate) cc: *mut Clump,
    /// Clump most recently freed into; cleared when that clump dies.
    pub(crate) cfreed: *mut Clump,

    pub(crate) freelists: [*mut u8; NUM_FREELISTS],
    /// Upper bound on the largest entry of the large freelist; corrected
    /// lazily by completed best-fit scans.
    pub(crate) largest_free_size: usize,

    pub(crate) clump_size: usize,
    /// Objects at least this big get a clump of their own.
    pub(crate) large_size: usize,
    /// A controlled arena may not acquire clumps; allocations must succeed
    /// within the preattached set.
    pub(crate) is_controlled: bool,
    pub(crate) free_enabled: bool,

    pub(crate) limit: usize,
    pub(crate) gc_allocated: usize,
    pub(crate) gc_status: GcStatus,
    pub(crate) allocated: usize,
    pub(crate) previous_status: PreviousStatus,
    pub(crate) lost: Lost,

    pub(crate) save_level: u32,
    pub(crate) streams: *mut StreamNode,
    pub(crate) names_array: *mut u8,
    pub(crate) saved: *mut u8,
    pub(crate) changes: *mut u8,
    pub(crate) scan_limit: *mut u8,

    pub(crate) roots: *mut crate::roots::GcRoot,
}

impl Arena {
    /// Build an arena on top of `parent`. The arena struct itself is placed
    /// inside a solo clump carved from `parent`, so teardown can release it
    /// through the same path as any other clump.
    pub fn create(parent: Box<dyn RawMemory>, clump_size: usize) -> Option<ptr::NonNull<Arena>> {
        unsafe {
            let mut parent = parent;
            let cp = alloc_struct_raw::<Clump>(&mut *parent, "arena(clump struct)");
            let csize = round_up(
                size_of::<ClumpHead>() + size_of::<ObjHeader>() + size_of::<Arena>(),
                OBJ_ALIGN,
            );
            let cdata = parent.alloc(csize, "arena(solo clump)");
            if cp.is_null() || cdata.is_null() {
                if !cdata.is_null() {
                    parent.free(cdata, csize, "arena(solo clump)");
                }
                if !cp.is_null() {
                    parent.free(cp as *mut u8, size_of::<Clump>(), "arena(clump struct)");
                }
                return None;
            }
            Clump::init(cp, cdata, cdata.add(csize), false, null_mut());
            // The solo clump is completely occupied by the arena object.
            (*cp).cbot = (*cp).ctop;
            (*cp).alone = true;

            let hdr = cdata.add(size_of::<ClumpHead>()) as *mut ObjHeader;
            hdr.write(ObjHeader::new(size_of::<Arena>(), &ST_ARENA));
            (*hdr).set_alone(true);

            let arena = (*hdr).payload() as *mut Arena;
            arena.write(Arena {
                parent,
                tracer: None,
                gc_signal: Arc::new(GcSignal(Atomic::new(0))),
                stable: null_mut(),
                root: null_mut(),
                cc: null_mut(),
                cfreed: null_mut(),
                freelists: [null_mut(); NUM_FREELISTS],
                largest_free_size: 0,
                clump_size,
                large_size: ((clump_size / 4) & !(OBJ_ALIGN - 1)) + 1,
                is_controlled: false,
                free_enabled: true,
                limit: 0,
                gc_allocated: 0,
                gc_status: GcStatus {
                    vm_threshold: clump_size * 3,
                    max_vm: MAX_MAX_VM,
                    signal_value: 0,
                    enabled: false,
                    requested: 0,
                },
                allocated: 0,
                previous_status: PreviousStatus::default(),
                lost: Lost::default(),
                save_level: 0,
                streams: null_mut(),
                names_array: null_mut(),
                saved: null_mut(),
                changes: null_mut(),
                scan_limit: null_mut(),
                roots: null_mut(),
            });
            (*arena).stable = arena;
            (*arena).root = cp;
            (*arena).set_limit();
            Some(ptr::NonNull::new_unchecked(arena))
        }
    }

    /// Tear an arena down: free every clump it owns, then the clump holding
    /// the arena itself, then release the arena's droppable state.
    ///
    /// # Safety
    /// `arena` must have come from [`Arena::create`] and must not be used
    /// afterwards.
    pub unsafe fn destroy(arena: *mut Arena) {
        if arena.is_null() {
            return;
        }
        let mut a = ptr::read(arena);
        a.free_all(arena as *mut u8);
        let cp = a.root;
        if !cp.is_null() {
            let cdata = (*cp).chead as *mut u8;
            let csize = (*cp).cend as usize - cdata as usize;
            a.parent.free(cdata, csize, "free_arena(data)");
            a.parent.free(cp as *mut u8, size_of::<Clump>(), "free_arena(clump struct)");
        }
    }

    /// Free every clump except the one whose object area starts with `keep`.
    /// That clump is reinstated as the sole (unlinked) tree node.
    ///
    /// # Safety
    /// No payload pointer into the freed clumps may be used afterwards.
    pub unsafe fn free_all(&mut self, keep: *mut u8) {
        let root = self.root;
        let mut keeper: *mut Clump = null_mut();
        splay_app(root, &mut |cp| {
            unsafe {
                if (*cp).cbase.add(size_of::<ObjHeader>()) == keep {
                    keeper = cp;
                } else {
                    self.free_clump(cp);
                }
            }
            SplayAppResult::Continue
        });
        self.root = keeper;
        if !keeper.is_null() {
            (*keeper).parent = null_mut();
            (*keeper).left = null_mut();
            (*keeper).right = null_mut();
        }
    }

    /// Initialize after a save: forget every clump and counter.
    pub fn reset(&mut self) {
        self.root = null_mut();
        self.cc = null_mut();
        self.allocated = 0;
        self.changes = null_mut();
        self.scan_limit = null_mut();
        self.reset_free();
    }

    /// Initialize the free pools after a save or a GC.
    pub fn reset_free(&mut self) {
        self.lost = Lost::default();
        self.cfreed = null_mut();
        self.freelists = [null_mut(); NUM_FREELISTS];
        self.largest_free_size = 0;
    }

    /// Recompute the allocation ceiling after a change to the GC status or a
    /// collection. We stop allocating when `allocated + previous.allocated`
    /// would exceed the lesser of `max_vm` and (with GC enabled)
    /// `gc_allocated + vm_threshold`; with GC disabled a fixed slack forces
    /// periodic collection anyway.
    pub fn set_limit(&mut self) {
        let max_allocated = if self.gc_status.max_vm > self.previous_status.allocated {
            self.gc_status.max_vm - self.previous_status.allocated
        } else {
            0
        };
        if self.gc_status.enabled {
            let limit = self.gc_allocated + self.gc_status.vm_threshold;
            if limit < self.previous_status.allocated {
                self.limit = 0;
            } else {
                self.limit = (limit - self.previous_status.allocated).min(max_allocated);
            }
        } else {
            self.limit = max_allocated.min(self.gc_allocated + FORCE_GC_LIMIT);
        }
        tracing::debug!(
            target: "clump_arena",
            max_vm = self.gc_status.max_vm,
            prev_allocated = self.previous_status.allocated,
            enabled = self.gc_status.enabled,
            gc_allocated = self.gc_allocated,
            threshold = self.gc_status.vm_threshold,
            limit = self.limit,
            "set_limit"
        );
    }

    pub fn gc_status(&self) -> GcStatus {
        self.gc_status
    }

    pub fn set_gc_status(&mut self, status: GcStatus) {
        self.gc_status = status;
        self.set_limit();
    }

    /// Clamp and apply a new VM threshold to this arena and its stable twin.
    pub fn set_vm_threshold(&mut self, value: i64) {
        let value = value.clamp(MIN_VM_THRESHOLD, MAX_VM_THRESHOLD) as usize;
        let mut status = self.gc_status;
        status.vm_threshold = value;
        self.set_gc_status(status);
        unsafe {
            let stable = self.stable;
            if !stable.is_null() && stable != self as *mut Arena {
                let mut status = (*stable).gc_status;
                status.vm_threshold = value;
                (*stable).set_gc_status(status);
            }
        }
    }

    /// Enable or disable reclamation on this arena and its stable twin.
    pub fn set_vm_reclaim(&mut self, enabled: bool) {
        let mut status = self.gc_status;
        status.enabled = enabled;
        self.set_gc_status(status);
        unsafe {
            let stable = self.stable;
            if !stable.is_null() && stable != self as *mut Arena {
                let mut status = (*stable).gc_status;
                status.enabled = enabled;
                (*stable).set_gc_status(status);
            }
        }
    }

    /// Rewire the stable-memory twin.
    ///
    /// # Safety
    /// `stable` must outlive this arena or be rewired before it dies.
    pub unsafe fn set_stable_twin(&mut self, stable: *mut Arena) {
        self.stable = stable;
    }

    /// When disabled, `free_object` and `free_string` become no-ops.
    pub fn enable_free(&mut self, enable: bool) {
        self.free_enabled = enable;
    }

    /// Reserved hook; deferral is not implemented.
    pub fn defer_frees(&mut self, _defer: i32) {}

    /// Unlink every stream node so referenced streams don't keep the whole
    /// list alive across a collection.
    pub fn prepare_gc(&mut self) {
        unsafe {
            while !self.streams.is_null() {
                let s = self.streams;
                self.streams = (*s).next;
                (*s).next = null_mut();
                (*s).prev = null_mut();
            }
        }
    }

    /// Handle to the shared GC signal cell.
    pub fn gc_signal(&self) -> Arc<GcSignal> {
        self.gc_signal.clone()
    }

    /// Install (or remove) the allocation trace sink.
    pub fn set_tracer(&mut self, tracer: Option<Arc<dyn AllocTracer>>) {
        self.tracer = tracer;
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn lost(&self) -> Lost {
        self.lost
    }

    pub fn is_controlled(&self) -> bool {
        self.is_controlled
    }

    /// Attach a clump to an externally controlled arena. Such arenas treat
    /// every allocation as immovable, are not collected, and never acquire
    /// memory on their own once this returns.
    pub fn add_clump(&mut self, space: usize, cname: &'static str) -> Result<(), VmError> {
        // Allow acquisition of this one clump.
        self.is_controlled = false;
        self.large_size = self.clump_size;
        self.limit = MAX_MAX_VM;
        self.gc_status.max_vm = MAX_MAX_VM;

        let cp = unsafe { self.add_clump_internal(space, cname) };

        // From here on the movable paths serve the immovable entry points as
        // well (a controlled arena never compacts), and no further clumps may
        // be acquired.
        self.is_controlled = true;
        self.limit = 0;

        if cp.is_null() {
            Err(VmError::OutOfMemory)
        } else {
            Ok(())
        }
    }

    /// Acquire a clump and open it as the current one.
    pub(crate) unsafe fn add_clump_internal(
        &mut self,
        csize: usize,
        cname: &'static str,
    ) -> *mut Clump {
        let cp = self.acquire_clump(csize, true, cname);
        if !cp.is_null() {
            self.close_clump();
            self.cc = cp;
            self.open_clump();
        }
        cp
    }

    /// Acquire a clump from the parent. If the GC is armed and we are at the
    /// limit: refuse outright when the limit has reached `max_vm`, otherwise
    /// record the request, raise the signal, and carry on.
    pub(crate) unsafe fn acquire_clump(
        &mut self,
        csize: usize,
        has_strings: bool,
        cname: &'static str,
    ) -> *mut Clump {
        let cp = alloc_struct_raw::<Clump>(&mut *self.parent, cname);

        // signal_value stays zero until the embedding interpreter (which is
        // what actually implements collection) arms it.
        if self.gc_status.signal_value != 0 && self.allocated >= self.limit {
            self.gc_status.requested += csize;
            if self.limit >= self.gc_status.max_vm {
                if !cp.is_null() {
                    self.parent.free(cp as *mut u8, size_of::<Clump>(), cname);
                }
                return null_mut();
            }
            tracing::debug!(
                target: "clump_arena",
                allocated = self.allocated,
                limit = self.limit,
                requested = self.gc_status.requested,
                "raising gc signal"
            );
            self.gc_signal.raise(self.gc_status.signal_value);
        }
        let cdata = self.parent.alloc(csize, cname);
        if cp.is_null() || cdata.is_null() {
            if !cdata.is_null() {
                self.parent.free(cdata, csize, cname);
            }
            if !cp.is_null() {
                self.parent.free(cp as *mut u8, size_of::<Clump>(), cname);
            }
            self.gc_status.requested = csize;
            return null_mut();
        }
        Clump::init(cp, cdata, cdata.add(csize), has_strings, null_mut());
        self.link_clump(cp);
        self.allocated += size_of::<Clump>() + csize;
        cp
    }

    /// Insert a clump into the tree. Exported for the GC and save/restore.
    ///
    /// # Safety
    /// `cp` must be an initialized, unlinked clump whose range does not
    /// overlap any clump already in the tree.
    pub unsafe fn link_clump(&mut self, cp: *mut Clump) {
        splay_insert(cp, &mut self.root);
    }

    /// Remove a clump from the tree without freeing it. Exported for the GC.
    ///
    /// # Safety
    /// `cp` must be linked in this arena's tree.
    pub unsafe fn unlink_clump(&mut self, cp: *mut Clump) {
        splay_remove(cp, &mut self.root);
        if self.cc == cp {
            self.cc = null_mut();
        }
    }

    /// Unlink a clump and release its storage. The backing buffer goes back
    /// to the parent unless an outer clump owns the bytes.
    ///
    /// # Safety
    /// `cp` must be linked in this arena's tree; nothing may point into it
    /// afterwards.
    pub unsafe fn free_clump(&mut self, cp: *mut Clump) {
        let cdata = (*cp).chead as *mut u8;
        let csize = (*cp).cend as usize - cdata as usize;

        self.unlink_clump(cp);
        self.allocated -= size_of::<Clump>();
        if self.cfreed == cp {
            self.cfreed = null_mut();
        }
        if (*cp).outer.is_null() {
            self.allocated -= csize;
            self.parent.free(cdata, csize, "free_clump(data)");
        } else {
            (*(*cp).outer).inner_count -= 1;
        }
        self.parent
            .free(cp as *mut u8, size_of::<Clump>(), "free_clump(clump struct)");
    }

    /// Trace hook; closing a clump has no observable effect on arena state.
    pub fn close_clump(&mut self) {
        if let Some(t) = self.tracer.as_ref() {
            t.line(&format!("[a] closing clump {:p}", self.cc));
        }
    }

    /// Trace hook, paired with [`Arena::close_clump`].
    pub fn open_clump(&mut self) {
        if let Some(t) = self.tracer.as_ref() {
            t.line(&format!("[a] opening clump {:p}", self.cc));
        }
    }

    /// Find the clump containing `ptr` and splay it to the root. Only this
    /// arena's tree is searched; clumps of other save levels live in their
    /// own arenas.
    pub fn locate(&mut self, ptr: *const u8) -> *mut Clump {
        unsafe {
            let mut cp = self.root;
            while !cp.is_null() {
                if (ptr as *mut u8) < (*cp).cbase {
                    cp = (*cp).left;
                    continue;
                }
                if (ptr as *mut u8) >= (*cp).cend {
                    cp = (*cp).right;
                    continue;
                }
                splay_move_to_root(cp, &mut self.root);
                return cp;
            }
            null_mut()
        }
    }

    pub fn is_within_clumps(&mut self, ptr: *const u8) -> bool {
        !self.locate(ptr).is_null()
    }

    /// Depth-first visit of every clump. The traversal captures its next
    /// step before each visit, so the visitor may free or unlink the clump
    /// it is handed (the GC's teardown passes rely on this). Returns the
    /// clump that stopped the walk, if any.
    ///
    /// # Safety
    /// The visitor may only mutate the visited clump, its children, and the
    /// child pointer that leads to it.
    pub unsafe fn apply_to_clumps(
        &mut self,
        f: &mut dyn FnMut(*mut Clump) -> SplayAppResult,
    ) -> *mut Clump {
        splay_app(self.root, f)
    }

    /// Sum up the arena's footprint: allocated bytes, inner-clump bytes
    /// (already counted against their outers), minus everything reclaimable.
    pub fn status(&mut self) -> ArenaStatus {
        unsafe {
            let mut unused = self.lost.refs + self.lost.strings;
            let mut inner = 0;

            self.close_clump();
            let mut sw = crate::splay::SplayWalker::init(self.root);
            let mut cp = sw.first();
            while !cp.is_null() {
                unused += (*cp).free_space();
                if !(*cp).outer.is_null() {
                    inner += (*cp).cend as usize - (*cp).chead as usize;
                }
                cp = sw.fwd();
            }
            unused += self.compute_free_objects();
            ArenaStatus {
                used: self.allocated + inner - unused + self.previous_status.used,
                allocated: self.allocated + self.previous_status.allocated,
                max_used: 0, // unknown for this allocator
                is_thread_safe: false,
            }
        }
    }
}
