/*
 * Physical-to-Linear Table Map
 *
 * Intermediate page tables are referenced from their parent entries by
 * physical address, but the kernel can only write them through a virtual
 * alias. Each page set carries one of these maps, translating the physical
 * frame number of a table to the linear page it is reachable at.
 *
 * Entries are created when a table is allocated, removed when a subtree is
 * torn down, and the whole map is cleared when the page set is destroyed.
 */

use alloc::boxed::Box;
use core::ptr;

use crate::rbtree::{self, RbNode, RbTree};

/// Map node keyed by physical page frame. Link head first.
#[repr(C)]
struct PhyLinNode {
    node: RbNode,
    page_frame: u64,
    page_number: u64,
}

pub struct PhyLinMap {
    tree: RbTree,
    entries: u64,
}

impl PhyLinMap {
    pub const fn new() -> Self {
        PhyLinMap {
            tree: RbTree::new(),
            entries: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn find(&self, page_frame: u64) -> *mut PhyLinNode {
        let mut node = self.tree.root as *mut PhyLinNode;

        unsafe {
            while !node.is_null() && (*node).page_frame != page_frame {
                if (*node).page_frame < page_frame {
                    node = (*node).node.right as *mut PhyLinNode;
                } else {
                    node = (*node).node.left as *mut PhyLinNode;
                }
            }
        }

        node
    }

    /// Look up the linear address aliasing `physical_address`. The page
    /// offset carries over.
    pub fn get(&self, physical_address: u64) -> Option<u64> {
        let page_frame = physical_address >> 12;
        let page_offset = physical_address & 0xfff;

        let node = self.find(page_frame);

        if node.is_null() {
            None
        } else {
            unsafe { Some(((*node).page_number << 12) | page_offset) }
        }
    }

    /// Record (or update) the alias for `physical_address`.
    pub fn set(&mut self, physical_address: u64, linear_address: u64) {
        let page_frame = physical_address >> 12;
        let page_number = linear_address >> 12;

        // Allocate up front: the heap may grow while we do, and growth maps
        // kernel pages, which can insert into this very map. Searching only
        // after the allocation keeps the insertion position current.
        let new = Box::into_raw(Box::new(PhyLinNode {
            node: RbNode::new(),
            page_frame,
            page_number,
        }));

        unsafe {
            let mut parent: *mut PhyLinNode = ptr::null_mut();
            let mut node = self.tree.root as *mut PhyLinNode;

            while !node.is_null() && (*node).page_frame != page_frame {
                parent = node;

                if (*node).page_frame < page_frame {
                    node = (*node).node.right as *mut PhyLinNode;
                } else {
                    node = (*node).node.left as *mut PhyLinNode;
                }
            }

            if !node.is_null() {
                // Already present; just refresh the alias.
                (*node).page_number = page_number;
                drop(Box::from_raw(new));
                return;
            }

            (*new).node.parent = parent as *mut RbNode;

            if parent.is_null() {
                self.tree.root = new as *mut RbNode;
            } else {
                if page_frame < (*parent).page_frame {
                    (*parent).node.left = new as *mut RbNode;
                } else {
                    (*parent).node.right = new as *mut RbNode;
                }

                rbtree::balance_insert(&mut self.tree, new as *mut RbNode);
            }

            self.entries += 1;
        }
    }

    /// Drop the alias for `physical_address` if one is recorded.
    pub fn remove(&mut self, physical_address: u64) {
        let node = self.find(physical_address >> 12);

        if !node.is_null() {
            unsafe {
                rbtree::delete(&mut self.tree, node as *mut RbNode);
                drop(Box::from_raw(node));
            }

            self.entries -= 1;
        }
    }

    /// Discard every entry, e.g. when the owning page set is destroyed.
    pub fn clear(&mut self) {
        unsafe fn free_recursive(node: *mut PhyLinNode) {
            unsafe {
                if !(*node).node.left.is_null() {
                    free_recursive((*node).node.left as *mut PhyLinNode);
                }
                if !(*node).node.right.is_null() {
                    free_recursive((*node).node.right as *mut PhyLinNode);
                }

                drop(Box::from_raw(node));
            }
        }

        if !self.tree.root.is_null() {
            unsafe { free_recursive(self.tree.root as *mut PhyLinNode) };
        }

        self.tree.root = ptr::null_mut();
        self.entries = 0;
    }

    /// In-order traversal of `(page_frame, page_number)` pairs.
    pub fn iter(&self) -> PhyLinIter {
        PhyLinIter {
            node: self.tree.first() as *mut PhyLinNode,
        }
    }
}

pub struct PhyLinIter {
    node: *mut PhyLinNode,
}

impl Iterator for PhyLinIter {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.node.is_null() {
            return None;
        }

        unsafe {
            let item = ((*self.node).page_frame, (*self.node).page_number);
            self.node = rbtree::next(self.node as *mut RbNode) as *mut PhyLinNode;
            Some(item)
        }
    }
}
