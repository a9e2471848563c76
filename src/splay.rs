//! Address-ordered splay tree of clumps.
//!
//! Binary tree ordered on the `cbase` pointer. Whenever a node is reached by
//! an externally visible lookup we perform a move-to-root, which both tends
//! towards balance and keeps recently touched clumps near the root. The
//! iterative walkers keep their whole state in a small struct so traversal is
//! allocation-free, and the depth-first apply captures its next step before
//! invoking the visitor so the visitor may free the visited node.
use crate::clump::Clump;
use std::ptr::null_mut;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SplayDir {
    FromAbove,
    FromLeft,
    FromRight,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SplayAppResult {
    Continue,
    Stop,
}

/// Iterative in-order walker. Tracks the direction it last arrived from so a
/// step never needs more than the tree links themselves.
pub struct SplayWalker {
    cp: *mut Clump,
    from: SplayDir,
    end: *mut Clump,
}

impl SplayWalker {
    /// Start an in-order walk at the tree minimum.
    ///
    /// # Safety
    /// `root` must be null or the root of a well-formed tree.
    pub unsafe fn init(root: *mut Clump) -> SplayWalker {
        let mut cp = root;
        if !cp.is_null() {
            while !(*cp).left.is_null() {
                cp = (*cp).left;
            }
        }
        SplayWalker {
            cp,
            from: SplayDir::FromLeft,
            end: null_mut(),
        }
    }

    /// Start a reverse in-order walk at the tree maximum.
    ///
    /// # Safety
    /// `root` must be null or the root of a well-formed tree.
    pub unsafe fn init_bwd(root: *mut Clump) -> SplayWalker {
        let mut cp = root;
        if !cp.is_null() {
            while !(*cp).right.is_null() {
                cp = (*cp).right;
            }
        }
        SplayWalker {
            cp,
            from: SplayDir::FromRight,
            end: null_mut(),
        }
    }

    /// Start an in-order walk at an arbitrary node. The node is emitted first
    /// and doubles as the stop sentinel, so one full round terminates.
    pub fn init_mid(cp: *mut Clump) -> SplayWalker {
        SplayWalker {
            cp,
            from: SplayDir::FromLeft,
            end: cp,
        }
    }

    /// The node the walker currently stands on (the first node to emit).
    #[inline(always)]
    pub fn first(&self) -> *mut Clump {
        self.cp
    }

    /// Advance to the next node in order, or null at the stopping point.
    ///
    /// # Safety
    /// The tree the walker was initialized on must still be intact.
    pub unsafe fn fwd(&mut self) -> *mut Clump {
        let mut cp = self.cp;
        let mut from = self.from;

        if cp.is_null() {
            return cp;
        }
        loop {
            if from == SplayDir::FromAbove {
                // Arrived from above: step left.
                if !(*cp).left.is_null() {
                    cp = (*cp).left;
                    from = SplayDir::FromAbove;
                    continue;
                }
                // No left to step to, so pretend we just came from there.
                from = SplayDir::FromLeft;
                if cp == self.end {
                    cp = null_mut();
                }
                break;
            }
            if from == SplayDir::FromLeft {
                // Arrived from the left: step right.
                if !(*cp).right.is_null() {
                    cp = (*cp).right;
                    from = SplayDir::FromAbove;
                    continue;
                }
                from = SplayDir::FromRight;
            }
            if from == SplayDir::FromRight {
                // Arrived from the right: step up.
                let old = cp;
                cp = (*cp).parent;
                if cp.is_null() {
                    // Reached the root. Stop here, unless this is a mid walk
                    // that still has to wrap around to the tree minimum.
                    if self.end.is_null() {
                        break;
                    }
                    cp = old;
                    from = SplayDir::FromAbove;
                } else {
                    from = if (*cp).left == old {
                        SplayDir::FromLeft
                    } else {
                        SplayDir::FromRight
                    };
                    if from == SplayDir::FromLeft {
                        if cp == self.end {
                            cp = null_mut();
                        }
                        break;
                    }
                }
            }
        }
        self.cp = cp;
        self.from = from;
        cp
    }

    /// Advance to the previous node in order, or null at the stopping point.
    ///
    /// # Safety
    /// The tree the walker was initialized on must still be intact.
    pub unsafe fn bwd(&mut self) -> *mut Clump {
        let mut cp = self.cp;
        let mut from = self.from;

        if cp.is_null() {
            return cp;
        }
        loop {
            if from == SplayDir::FromAbove {
                // Arrived from above: step right.
                if !(*cp).right.is_null() {
                    cp = (*cp).right;
                    from = SplayDir::FromAbove;
                    continue;
                }
                from = SplayDir::FromRight;
                if cp == self.end {
                    cp = null_mut();
                }
                break;
            }
            if from == SplayDir::FromRight {
                // Arrived from the right: step left.
                if !(*cp).left.is_null() {
                    cp = (*cp).left;
                    from = SplayDir::FromAbove;
                    continue;
                }
                from = SplayDir::FromLeft;
            }
            if from == SplayDir::FromLeft {
                // Arrived from the left: step up.
                let old = cp;
                cp = (*cp).parent;
                from = if cp.is_null() || (*cp).left != old {
                    SplayDir::FromRight
                } else {
                    SplayDir::FromLeft
                };
                if from == SplayDir::FromRight {
                    if cp == self.end {
                        cp = null_mut();
                    }
                    break;
                }
            }
        }
        self.cp = cp;
        self.from = from;
        cp
    }
}

// Move the given node to the root of the tree through the usual zig-zig and
// zig-zag double rotations, plus the single rotation when the parent is the
// root. All of them preserve the in-order sequence while x gets higher.
//
// Case 1:   z          x           Case 1b:   z                   x
//          # #        # #                    # #                 # #
//         y   D      A   y                  A   y               y   D
//        # #     =>     # #                    # #     =>      # #
//       x   C          B   z                  B   x           z   C
//      # #                # #                    # #         # #
//     A   B              C   D                  C   D       A   B
//
// Case 2:   z             x        Case 2b:   z                  x
//          # #          ## ##                # #               ## ##
//         y   D        y     z              A   y             z     y
//        # #     =>   # #   # #                # #     =>    # #   # #
//       A   x        A   B C   D              x   D         A   B C   D
//          # #                               # #
//         B   C                             B   C
//
// Case 3:   y          x           Case 3b:  y                  x
//          # #        # #                   # #                # #
//         x   C  =>  A   y                 A   x       =>     y   C
//        # #            # #                   # #            # #
//       A   B          B   C                 B   C          A   B
pub(crate) unsafe fn splay_move_to_root(x: *mut Clump, root: &mut *mut Clump) {
    if x.is_null() {
        return;
    }
    loop {
        let y = (*x).parent;
        if y.is_null() {
            break;
        }
        let z = (*y).parent;
        if !z.is_null() {
            (*x).parent = (*z).parent;
            if !(*x).parent.is_null() {
                if (*(*x).parent).left == z {
                    (*(*x).parent).left = x;
                } else {
                    (*(*x).parent).right = x;
                }
            }
            (*y).parent = x;
            // Case 1, 1b, 2 or 2b
            if (*y).left == x {
                // Case 1 or 2b
                if (*z).left == y {
                    // Case 1
                    (*y).left = (*x).right;
                    if !(*y).left.is_null() {
                        (*(*y).left).parent = y;
                    }
                    (*z).left = (*y).right;
                    if !(*z).left.is_null() {
                        (*(*z).left).parent = z;
                    }
                    (*y).right = z;
                    (*z).parent = y;
                } else {
                    // Case 2b
                    (*z).right = (*x).left;
                    if !(*z).right.is_null() {
                        (*(*z).right).parent = z;
                    }
                    (*y).left = (*x).right;
                    if !(*y).left.is_null() {
                        (*(*y).left).parent = y;
                    }
                    (*x).left = z;
                    (*z).parent = x;
                }
                (*x).right = y;
            } else {
                // Case 2 or 1b
                if (*z).left == y {
                    // Case 2
                    (*y).right = (*x).left;
                    if !(*y).right.is_null() {
                        (*(*y).right).parent = y;
                    }
                    (*z).left = (*x).right;
                    if !(*z).left.is_null() {
                        (*(*z).left).parent = z;
                    }
                    (*x).right = z;
                    (*z).parent = x;
                } else {
                    // Case 1b
                    (*z).right = (*y).left;
                    if !(*z).right.is_null() {
                        (*(*z).right).parent = z;
                    }
                    (*y).right = (*x).left;
                    if !(*y).right.is_null() {
                        (*(*y).right).parent = y;
                    }
                    (*y).left = z;
                    (*z).parent = y;
                }
                (*x).left = y;
            }
        } else {
            // Case 3 or 3b
            (*x).parent = null_mut();
            (*y).parent = x;
            if (*y).left == x {
                // Case 3
                (*y).left = (*x).right;
                if !(*y).left.is_null() {
                    (*(*y).left).parent = y;
                }
                (*x).right = y;
            } else {
                // Case 3b
                (*y).right = (*x).left;
                if !(*y).right.is_null() {
                    (*(*y).right).parent = y;
                }
                (*x).left = y;
            }
        }
    }
    *root = x;
}

/// BST-insert an unlinked clump, then splay it to the root. The clump's base
/// address must not lie within any clump already in the tree.
pub(crate) unsafe fn splay_insert(cp: *mut Clump, root: &mut *mut Clump) {
    let mut node: *mut Clump = null_mut();
    let mut slot: *mut *mut Clump = root as *mut *mut Clump;

    while !(*slot).is_null() {
        node = *slot;
        slot = if (*cp).cbase < (*node).cbase {
            &mut (*node).left
        } else {
            &mut (*node).right
        };
    }
    *slot = cp;
    (*cp).left = null_mut();
    (*cp).right = null_mut();
    (*cp).parent = node;
    splay_move_to_root(cp, root);
}

/// Remove a clump in place. A node with two children is replaced by its
/// in-order predecessor (the rightmost node of the left subtree) rather than
/// being rotated to the root first. Returns the replacement node.
pub(crate) unsafe fn splay_remove(cp: *mut Clump, root: &mut *mut Clump) -> *mut Clump {
    let replacement;

    if (*cp).left.is_null() {
        // At most one child - easy.
        replacement = (*cp).right;
    } else if (*cp).right.is_null() {
        replacement = (*cp).left;
    } else {
        // Two children. Find the in-order predecessor, detach it (it has at
        // most one child), and put it where cp was.
        let mut pred = (*cp).left;
        while !(*pred).right.is_null() {
            pred = (*pred).right;
        }
        splay_remove(pred, root);
        if !(*cp).left.is_null() {
            (*(*cp).left).parent = pred;
        }
        (*(*cp).right).parent = pred;
        (*pred).left = (*cp).left;
        (*pred).right = (*cp).right;
        replacement = pred;
    }
    if !(*cp).parent.is_null() {
        if (*(*cp).parent).left == cp {
            (*(*cp).parent).left = replacement;
        } else {
            (*(*cp).parent).right = replacement;
        }
    } else {
        *root = replacement;
    }
    if !replacement.is_null() {
        (*replacement).parent = (*cp).parent;
    }
    replacement
}

/// Apply `f` to every node in depth-first order. The next step is captured
/// before the visit, so `f` may free or unlink the node it is handed. Returns
/// the node that stopped the walk, if any.
pub(crate) unsafe fn splay_app(
    root: *mut Clump,
    f: &mut dyn FnMut(*mut Clump) -> SplayAppResult,
) -> *mut Clump {
    let mut cp = root;
    let mut from = SplayDir::FromAbove;

    while !cp.is_null() {
        if from == SplayDir::FromAbove {
            let step_to = (*cp).left;
            if !step_to.is_null() {
                from = SplayDir::FromAbove;
                cp = step_to;
            } else {
                from = SplayDir::FromLeft;
            }
        }
        if from == SplayDir::FromLeft {
            let step_to = (*cp).right;
            if !step_to.is_null() {
                from = SplayDir::FromAbove;
                cp = step_to;
            } else {
                from = SplayDir::FromRight;
            }
        }
        if from == SplayDir::FromRight {
            let step_to = (*cp).parent;
            if !step_to.is_null() {
                from = if (*step_to).left == cp {
                    SplayDir::FromLeft
                } else {
                    SplayDir::FromRight
                };
            }
            if f(cp) == SplayAppResult::Stop {
                return cp;
            }
            cp = step_to;
        }
    }
    cp
}
