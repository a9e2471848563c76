//! Allocation tracing and the debug dump.
//!
//! Tracing goes through a sink injected per arena, so two arenas owned by
//! different executors never interleave through an ambient global. The
//! default production sink forwards to the `tracing` ecosystem; the
//! collecting sink buffers lines for tests and postmortem inspection.
use crate::arena::Arena;
use crate::clump::CLUMP_MAGIC;
use crate::header::ObjHeader;
use crate::splay::SplayWalker;
use parking_lot::Mutex;
use std::fmt::{self, Write};
use std::sync::Arc;

/// Receives one formatted line per traced allocator event.
pub trait AllocTracer {
    fn line(&self, line: &str);
}

/// Forwards each trace line to `tracing::trace!`.
pub struct TracingSink;

impl AllocTracer for TracingSink {
    fn line(&self, line: &str) {
        tracing::trace!(target: "clump_arena", "{}", line);
    }
}

/// Buffers trace lines in memory.
pub struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Arc<CollectingSink> {
        Arc::new(CollectingSink {
            lines: Mutex::new(Vec::new()),
        })
    }

    /// Drain the buffered lines.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl AllocTracer for CollectingSink {
    fn line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// What the debug dump should include.
#[derive(Clone, Copy, Default)]
pub struct DumpControl {
    /// Also walk the objects of each clump.
    pub objects: bool,
}

/// Tabulate every clump (bounds, tree links, string side tables) and
/// optionally its objects. Diagnostic output with no stability guarantee.
pub fn dump_arena(arena: &Arena, w: &mut dyn Write, ctl: DumpControl) -> fmt::Result {
    unsafe {
        let mut sw = SplayWalker::init(arena.root);
        let mut cp = sw.first();
        while !cp.is_null() {
            let c = &*cp;
            let magic_ok = !c.chead.is_null() && (*c.chead).magic == CLUMP_MAGIC;
            writeln!(
                w,
                "clump {:p}: [{:p}..{:p}) cbot={:p} ctop={:p} climit={:p}{}{}",
                cp,
                c.cbase,
                c.cend,
                c.cbot,
                c.ctop,
                c.climit,
                if c.alone { " alone" } else { "" },
                if magic_ok { "" } else { " BAD MAGIC" },
            )?;
            writeln!(
                w,
                "  links: parent={:p} left={:p} right={:p} outer={:p} inner_count={}",
                c.parent, c.left, c.right, c.outer, c.inner_count
            )?;
            if !c.smark.is_null() {
                writeln!(
                    w,
                    "  strings: smark={:p} smark_size={} sreloc={:p}",
                    c.smark, c.smark_size, c.sreloc
                )?;
            }
            if ctl.objects {
                for pre in c.objects() {
                    dump_object(pre, w)?;
                }
            }
            cp = sw.fwd();
        }
        Ok(())
    }
}

unsafe fn dump_object(pre: *mut ObjHeader, w: &mut dyn Write) -> fmt::Result {
    let tp = (*pre).type_();
    writeln!(
        w,
        "  obj {:p}: size={} type={}{}",
        (*pre).payload(),
        (*pre).contents_size(),
        if tp.is_null() { "?" } else { (*tp).sname },
        if !tp.is_null() && (*tp).enum_ptrs.is_some() {
            " has_ptrs"
        } else {
            ""
        },
    )
}
