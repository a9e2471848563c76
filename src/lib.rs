//! # clump-arena
//!
//! A garbage-collection-aware arena allocator for VMs implemented in Rust. The
//! arena serves typed objects and raw byte strings out of large contiguous
//! regions ("clumps") that it owns. Clumps are kept in an address-ordered splay
//! tree so that any pointer can be mapped back to its clump in amortized
//! logarithmic time, with recently touched clumps floating towards the root.
//!
//! The allocator itself does not collect garbage; it maintains the object
//! headers, freelists and side tables that an external collector walks, and it
//! raises a shared signal when allocation crosses the configured threshold so
//! the embedding interpreter can schedule a collection at its next safe point.
//!
//! Each arena is owned by exactly one executor. There is no internal locking;
//! multiple arenas may coexist in one process, each with its own owner.
use std::mem::size_of;

pub mod alloc;
pub mod arena;
pub mod clump;
pub mod freelist;
pub mod header;
pub mod mmap;
pub mod raw;
pub mod roots;
pub mod splay;
pub mod trace;
#[cfg(test)]
mod tests;

pub use arena::{Arena, ArenaStatus, GcSignal, GcStatus, Lost};
pub use header::{ObjHeader, StructType, ST_BYTES, ST_FREE};
pub use raw::{LibcRaw, RawMemory};

const fn max_usize(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Alignment quantum for object headers and payloads.
pub const OBJ_ALIGN: usize = max_usize(8, size_of::<usize>());

#[inline(always)]
pub const fn round_up(x: usize, y: usize) -> usize {
    (x + (y - 1)) & !(y - 1)
}

/// Round a payload size up to the alignment quantum.
#[inline(always)]
pub const fn obj_align_round(size: usize) -> usize {
    round_up(size, OBJ_ALIGN)
}

/// Full footprint of an object of the given payload size, header included.
#[inline(always)]
pub const fn obj_size_round(size: usize) -> usize {
    obj_align_round(size) + size_of::<header::ObjHeader>()
}

/// Errors reported by the status-returning entry points. Plain allocation
/// failure is reported as `None` from the allocating calls instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("virtual memory exhausted")]
    OutOfMemory,
}
