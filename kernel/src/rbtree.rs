/*
 * Intrusive Red-Black Tree
 *
 * Generic balanced ordered container shared by the frame allocator, the
 * physical-to-linear table map and the process table. The tree stores no
 * keys and owns no memory: consumers embed an `RbNode` as the first field of
 * their `#[repr(C)]` node type, search for the insertion point themselves,
 * link the node into place and then call `balance_insert`. `delete` detaches
 * and rebalances without freeing anything.
 *
 * Properties maintained:
 * 1. A node is either red or black.
 * 2. The root is black.
 * 3. All leaves (null) are black.
 * 4. Every red node has two black children.
 * 5. Every path from a node to any of its descendant leaves contains the
 *    same number of black nodes.
 *
 * All operations are O(log n).
 */

use core::ptr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

/// Link head embedded in consumer node types. Must be the first field of a
/// `#[repr(C)]` struct so that node pointers can be cast both ways.
#[repr(C)]
#[derive(Debug)]
pub struct RbNode {
    pub parent: *mut RbNode,
    pub left: *mut RbNode,
    pub right: *mut RbNode,
    pub color: Color,
}

impl RbNode {
    pub const fn new() -> Self {
        RbNode {
            parent: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            color: Color::Red,
        }
    }

    /// Clear all links, e.g. before re-inserting a detached node.
    pub fn reset(&mut self) {
        *self = RbNode::new();
    }
}

pub struct RbTree {
    pub root: *mut RbNode,
}

// The tree is only ever touched with interrupts disabled or behind a lock;
// the raw pointers do not escape the owning structure.
unsafe impl Send for RbTree {}

impl RbTree {
    pub const fn new() -> Self {
        RbTree {
            root: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Leftmost node, i.e. the smallest key in the consumer's order.
    pub fn first(&self) -> *mut RbNode {
        let mut node = self.root;

        if node.is_null() {
            return ptr::null_mut();
        }

        unsafe {
            while !(*node).left.is_null() {
                node = (*node).left;
            }
        }

        node
    }
}

unsafe fn grandparent(node: *mut RbNode) -> *mut RbNode {
    unsafe {
        if !node.is_null() && !(*node).parent.is_null() {
            (*(*node).parent).parent
        } else {
            ptr::null_mut()
        }
    }
}

unsafe fn uncle(node: *mut RbNode) -> *mut RbNode {
    unsafe {
        let g = grandparent(node);

        if g.is_null() {
            return ptr::null_mut();
        }

        if (*node).parent == (*g).left {
            (*g).right
        } else {
            (*g).left
        }
    }
}

unsafe fn sibling(node: *mut RbNode) -> *mut RbNode {
    unsafe {
        let p = (*node).parent;

        if p.is_null() {
            return ptr::null_mut();
        }

        if (*p).left == node { (*p).right } else { (*p).left }
    }
}

fn is_black(node: *mut RbNode) -> bool {
    // Null leaves are black.
    node.is_null() || unsafe { (*node).color } == Color::Black
}

fn is_red(node: *mut RbNode) -> bool {
    !is_black(node)
}

/// Replace `old` with `new` in `old`'s position. Intended as preparation for
/// deletion; does not write to `old` at all.
unsafe fn replace_node(tree: &mut RbTree, new: *mut RbNode, old: *mut RbNode) {
    unsafe {
        if !new.is_null() {
            // Detach new from its old parent first.
            let new_parent = (*new).parent;
            if !new_parent.is_null() {
                if (*new_parent).left == new {
                    (*new_parent).left = ptr::null_mut();
                } else {
                    (*new_parent).right = ptr::null_mut();
                }
            }

            (*new).parent = (*old).parent;
        }

        let old_parent = (*old).parent;

        if old_parent.is_null() {
            tree.root = new;
        } else if (*old_parent).left == old {
            (*old_parent).left = new;
        } else {
            (*old_parent).right = new;
        }
    }
}

unsafe fn rotate_left(tree: &mut RbTree, node: *mut RbNode) {
    unsafe {
        let right = (*node).right;
        assert!(!right.is_null());

        let saved_right_left = (*right).left;

        (*right).left = node;
        (*right).parent = (*node).parent;

        let parent = (*node).parent;
        if parent.is_null() {
            tree.root = right;
        } else if node == (*parent).left {
            (*parent).left = right;
        } else {
            (*parent).right = right;
        }

        (*node).parent = right;
        (*node).right = saved_right_left;

        if !saved_right_left.is_null() {
            (*saved_right_left).parent = node;
        }
    }
}

unsafe fn rotate_right(tree: &mut RbTree, node: *mut RbNode) {
    unsafe {
        let left = (*node).left;
        assert!(!left.is_null());

        let saved_left_right = (*left).right;

        (*left).right = node;
        (*left).parent = (*node).parent;

        let parent = (*node).parent;
        if parent.is_null() {
            tree.root = left;
        } else if node == (*parent).left {
            (*parent).left = left;
        } else {
            (*parent).right = left;
        }

        (*node).parent = left;
        (*node).left = saved_left_right;

        if !saved_left_right.is_null() {
            (*saved_left_right).parent = node;
        }
    }
}

/// Rebalance after the caller has linked `node` (with null children) at its
/// comparison-determined position.
///
/// # Safety
/// `node` must be linked into `tree` with correct parent/child pointers and
/// null `left`/`right`.
pub unsafe fn balance_insert(tree: &mut RbTree, node: *mut RbNode) {
    unsafe {
        let mut node = node;

        // A freshly inserted node starts red.
        (*node).color = Color::Red;

        // Cases 1-3 loop upward.
        loop {
            let parent = (*node).parent;

            if parent.is_null() {
                // Case 1: node is the root.
                (*node).color = Color::Black;
                tree.root = node;
                return;
            }

            if (*parent).color == Color::Black {
                // Case 2: red child of a black parent violates nothing.
                return;
            }

            let u = uncle(node);

            if is_red(u) {
                // Case 3: red parent and red uncle. Repaint both black and
                // the grandparent red, then re-examine the grandparent.
                let g = grandparent(node);

                (*parent).color = Color::Black;
                (*u).color = Color::Black;
                (*g).color = Color::Red;

                node = g;
            } else {
                break;
            }
        }

        // Case 4: red parent, black uncle. If node is on the opposite side
        // of its parent as the parent is of the grandparent, rotate the
        // parent first so the final rotation lines up.
        let g = grandparent(node);

        if (*node).parent == (*g).left && node == (*(*node).parent).right {
            rotate_left(tree, (*node).parent);
            node = (*node).left;
        } else if (*node).parent == (*g).right && node == (*(*node).parent).left {
            rotate_right(tree, (*node).parent);
            node = (*node).right;
        }

        (*(*node).parent).color = Color::Black;
        (*g).color = Color::Red;

        if node == (*(*node).parent).left {
            rotate_right(tree, g);
        } else {
            rotate_left(tree, g);
        }
    }
}

/// Exchange `node` with its in-order successor `succ`, links and colours
/// both, so that `node` ends up at `succ`'s old position with at most one
/// (right) child. Consumer pointers to other nodes stay valid.
unsafe fn swap_with_successor(tree: &mut RbTree, node: *mut RbNode, succ: *mut RbNode) {
    unsafe {
        let n_parent = (*node).parent;
        let n_left = (*node).left;
        let n_right = (*node).right;
        let s_parent = (*succ).parent;
        let s_right = (*succ).right; // the successor never has a left child

        core::mem::swap(&mut (*node).color, &mut (*succ).color);

        // Put succ where node was.
        (*succ).parent = n_parent;
        if n_parent.is_null() {
            tree.root = succ;
        } else if (*n_parent).left == node {
            (*n_parent).left = succ;
        } else {
            (*n_parent).right = succ;
        }

        (*succ).left = n_left;
        (*n_left).parent = succ;

        if s_parent == node {
            // succ was node's direct right child.
            (*succ).right = node;
            (*node).parent = succ;
        } else {
            (*succ).right = n_right;
            (*n_right).parent = succ;

            // succ was the leftmost node of the right subtree, so it hung on
            // its parent's left.
            (*node).parent = s_parent;
            (*s_parent).left = node;
        }

        // node takes over succ's old children.
        (*node).left = ptr::null_mut();
        (*node).right = s_right;
        if !s_right.is_null() {
            (*s_right).parent = node;
        }
    }
}

/// Detach `node` from the tree and restore the red-black properties. The
/// node's memory is untouched and may be reused or discarded by the caller.
///
/// # Safety
/// `node` must currently be linked into `tree`.
pub unsafe fn delete(tree: &mut RbTree, node: *mut RbNode) {
    unsafe {
        // With two children, trade places with the in-order successor first.
        // Afterwards node sits where the successor was and has at most a
        // right child, so the one-child machinery below applies.
        if !(*node).left.is_null() && !(*node).right.is_null() {
            let mut succ = (*node).right;
            while !(*succ).left.is_null() {
                succ = (*succ).left;
            }
            swap_with_successor(tree, node, succ);
        }

        let child = if (*node).left.is_null() {
            (*node).right
        } else {
            (*node).left
        };

        // A red node has only null children here; unlinking it changes no
        // black heights.
        if (*node).color == Color::Red {
            replace_node(tree, child, node);
            return;
        }

        // Black node with a red child: the child moves up and turns black.
        if !child.is_null() && (*child).color == Color::Red {
            (*child).color = Color::Black;
            replace_node(tree, child, node);
            return;
        }

        // Black node with black (necessarily null) children. Removing it
        // shortens this path by one black node; rebalance treating the node
        // as the null leaf that takes its place.
        assert!(child.is_null());

        let mut current = node;

        loop {
            let parent = (*current).parent;

            // Case 1: reached the root, heights cannot differ any more.
            if parent.is_null() {
                break;
            }

            // Case 2: red sibling. Swap colours with the parent and rotate
            // the sibling toward the root, giving current a black sibling.
            let mut s = sibling(current);

            if is_red(s) {
                (*parent).color = Color::Red;
                (*s).color = Color::Black;

                if current == (*parent).left {
                    rotate_left(tree, parent);
                } else {
                    rotate_right(tree, parent);
                }
            }

            s = sibling(current);

            // Case 3: parent, sibling and sibling's children all black.
            // Repainting the sibling red balances the parent's subtree but
            // removes a black node from every path through it, so continue
            // at the parent.
            if (*parent).color == Color::Black
                && is_black(s)
                && is_black((*s).left)
                && is_black((*s).right)
            {
                (*s).color = Color::Red;
                current = parent;
                continue;
            }

            // Case 4: red parent, black sibling with black children. Swap
            // the colours of sibling and parent; current's path regains its
            // black node and the sibling's path is unchanged.
            if (*parent).color == Color::Red
                && is_black((*s).left)
                && is_black((*s).right)
            {
                (*s).color = Color::Red;
                (*parent).color = Color::Black;
                break;
            }

            // Case 5: sibling black, sibling's near child red, far child
            // black. Rotate around the sibling so the red child moves to the
            // far side, setting up case 6.
            assert!(is_red((*s).left) || is_red((*s).right));

            if current == (*parent).left && is_black((*s).right) {
                (*s).color = Color::Red;
                (*(*s).left).color = Color::Black;
                rotate_right(tree, s);
                s = (*s).parent;
            } else if current == (*parent).right && is_black((*s).left) {
                (*s).color = Color::Red;
                (*(*s).right).color = Color::Black;
                rotate_left(tree, s);
                s = (*s).parent;
            }

            // Case 6: sibling black with a red far child. Rotate around the
            // parent, exchange sibling/parent colours, paint the far child
            // black. Every path through the subtree keeps its black count
            // and current's path gains one.
            (*s).color = (*parent).color;
            (*parent).color = Color::Black;

            if current == (*parent).left {
                assert!(is_red((*s).right));
                (*(*s).right).color = Color::Black;
                rotate_left(tree, parent);
            } else {
                assert!(is_red((*s).left));
                (*(*s).left).color = Color::Black;
                rotate_right(tree, parent);
            }

            break;
        }

        // The node now stands in for a leaf; unlink it.
        replace_node(tree, ptr::null_mut(), node);
    }
}

/// In-order successor of `node`, or null at the end of the tree.
///
/// # Safety
/// `node` must be linked into a well-formed tree.
pub unsafe fn next(node: *mut RbNode) -> *mut RbNode {
    unsafe {
        if !(*node).right.is_null() {
            // Go right once, then left as far as possible.
            let mut n = (*node).right;

            while !(*n).left.is_null() {
                n = (*n).left;
            }

            n
        } else {
            // Climb until we were a left-hand child; that parent is next.
            let mut n = node;

            while !(*n).parent.is_null() && n == (*(*n).parent).right {
                n = (*n).parent;
            }

            (*n).parent
        }
    }
}
