/*
 * Physical Frame Allocator
 *
 * Free physical memory is tracked as contiguous page regions in a red-black
 * tree ordered by region size (pages). Keying by size makes `acquire` a
 * best-fit-by-size search in O(log n) without a second index; the tie-break
 * between equal sizes is unspecified.
 *
 * `release` inserts a region as-is and never coalesces with neighbours.
 * Fragmentation is accepted in exchange for simplicity; callers of `acquire`
 * loop over multiple contiguous runs when one run cannot cover a request.
 */

use alloc::boxed::Box;
use spin::Mutex;

use crate::config::{PAGE_SIZE, RESERVED_LOW};
use crate::multiboot::{MULTIBOOT_MEMORY_AVAILABLE, MultibootInfo};
use crate::rbtree::{self, RbNode, RbTree};

/// Free region tree node. The link head must stay the first field.
#[repr(C)]
struct FreeRegionNode {
    node: RbNode,
    base: u64,
    pages: u64,
}

struct FreeRegionTree {
    tree: RbTree,
    total_free: u64,
}

static FREE_REGIONS: Mutex<FreeRegionTree> = Mutex::new(FreeRegionTree {
    tree: RbTree::new(),
    total_free: 0,
});

/// Scan the loader memory map and release every usable range, aligned up to
/// 4 KiB and truncated below the reserved low boundary that holds the kernel
/// image and early tables.
pub fn init(info: &MultibootInfo) {
    let mut usable = 0u64;

    for entry in info.memory_map() {
        let addr = entry.addr;
        let len = entry.len;
        let entry_type = entry.entry_type;

        // The range must still span at least one page after alignment.
        if entry_type != MULTIBOOT_MEMORY_AVAILABLE || len < PAGE_SIZE + addr % PAGE_SIZE {
            continue;
        }

        let mut base = if addr % PAGE_SIZE != 0 {
            (addr / PAGE_SIZE + 1) * PAGE_SIZE
        } else {
            addr
        };

        let mut pages = (len - addr % PAGE_SIZE) / PAGE_SIZE;

        // Drop the part below the preallocated region.
        if base < RESERVED_LOW {
            let diff = (RESERVED_LOW - base) / PAGE_SIZE;

            if diff < pages {
                base += diff * PAGE_SIZE;
                pages -= diff;
            } else {
                continue;
            }
        }

        release(base, pages);
        usable += pages;
    }

    log::info!(
        "frame allocator initialized: {} pages ({} MiB) free",
        usable,
        usable / 256
    );
}

/// Number of free 4 KiB pages in the system.
pub fn total_free() -> u64 {
    FREE_REGIONS.lock().total_free
}

fn insert(regions: &mut FreeRegionTree, node: *mut FreeRegionNode) {
    unsafe {
        assert!((*node).base % PAGE_SIZE == 0);
        assert!((*node).pages > 0);

        let mut parent = regions.tree.root as *mut FreeRegionNode;

        if parent.is_null() {
            regions.tree.root = node as *mut RbNode;
            (*node).node.parent = core::ptr::null_mut();
        } else {
            // Walk down by size; equal sizes go right.
            loop {
                if (*parent).pages <= (*node).pages && !(*parent).node.right.is_null() {
                    parent = (*parent).node.right as *mut FreeRegionNode;
                } else if (*parent).pages > (*node).pages && !(*parent).node.left.is_null() {
                    parent = (*parent).node.left as *mut FreeRegionNode;
                } else {
                    break;
                }
            }

            (*node).node.parent = parent as *mut RbNode;

            if (*parent).pages <= (*node).pages {
                (*parent).node.right = node as *mut RbNode;
            } else {
                (*parent).node.left = node as *mut RbNode;
            }

            rbtree::balance_insert(&mut regions.tree, node as *mut RbNode);
        }

        regions.total_free += (*node).pages;
    }
}

/// Acquire up to `pages` contiguous pages. Returns `(base, granted)`;
/// `granted` is less than `pages` only when no single run of the requested
/// size exists, and zero when the tree is empty. Callers loop and coalesce
/// or treat a zero grant as out-of-memory.
pub fn acquire(pages: u64) -> (u64, u64) {
    let mut regions = FREE_REGIONS.lock();

    unsafe {
        let mut node = regions.tree.root as *mut FreeRegionNode;

        if node.is_null() {
            return (0, 0);
        }

        // Go left while strictly larger than needed, then walk the order
        // upward until the node is large enough (or we run out and settle
        // for the largest remaining run).
        while (*node).pages > pages && !(*node).node.left.is_null() {
            node = (*node).node.left as *mut FreeRegionNode;
        }

        while (*node).pages < pages {
            let next = rbtree::next(node as *mut RbNode);
            if next.is_null() {
                break;
            }
            node = next as *mut FreeRegionNode;
        }

        rbtree::delete(&mut regions.tree, node as *mut RbNode);
        regions.total_free -= (*node).pages;

        if (*node).pages > pages {
            // Trim the request off the high end and re-insert the rest. The
            // base computation is only correct after the subtraction.
            (*node).node.reset();
            (*node).pages -= pages;

            insert(&mut *regions, node);

            let base = (*node).base + ((*node).pages << 12);

            (base, pages)
        } else {
            // Exact fit or the largest run left: hand the whole node over.
            let base = (*node).base;
            let granted = (*node).pages;

            drop(Box::from_raw(node));

            (base, granted)
        }
    }
}

/// Return a region of `pages` pages at `base` to the free tree.
pub fn release(base: u64, pages: u64) {
    // Allocate before taking the lock: the heap may grow, and growth
    // acquires frames through this module.
    let node = Box::into_raw(Box::new(FreeRegionNode {
        node: RbNode::new(),
        base,
        pages,
    }));

    let mut regions = FREE_REGIONS.lock();

    insert(&mut *regions, node);
}
