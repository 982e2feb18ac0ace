/*
 * RB-Tree Property Tests
 *
 * Drives the intrusive tree through interleaved inserts and deletes with a
 * deterministic pseudo-random key stream and checks the red-black
 * properties after every phase: the root is black, no red node has a red
 * child, every root-to-null path has the same black depth, and in-order
 * traversal yields ascending keys.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::rbtree::{self, Color, RbNode, RbTree};
use crate::tests::check;

#[repr(C)]
struct TestNode {
    node: RbNode,
    key: u64,
}

fn insert(tree: &mut RbTree, node: *mut TestNode) {
    unsafe {
        let key = (*node).key;

        let mut parent: *mut TestNode = core::ptr::null_mut();
        let mut current = tree.root as *mut TestNode;

        while !current.is_null() {
            parent = current;

            if (*current).key < key {
                current = (*current).node.right as *mut TestNode;
            } else {
                current = (*current).node.left as *mut TestNode;
            }
        }

        (*node).node.parent = parent as *mut RbNode;

        if parent.is_null() {
            tree.root = node as *mut RbNode;
        } else if key < (*parent).key {
            (*parent).node.left = node as *mut RbNode;
        } else {
            (*parent).node.right = node as *mut RbNode;
        }

        rbtree::balance_insert(tree, node as *mut RbNode);
    }
}

/// Returns the black height of the subtree, or None when a property is
/// violated below it.
fn validate(node: *mut RbNode) -> Option<usize> {
    if node.is_null() {
        return Some(1);
    }

    unsafe {
        if (*node).color == Color::Red {
            for child in [(*node).left, (*node).right] {
                if !child.is_null() && (*child).color == Color::Red {
                    return None;
                }
            }
        }

        let left = validate((*node).left)?;
        let right = validate((*node).right)?;

        if left != right {
            return None;
        }

        Some(left + if (*node).color == Color::Black { 1 } else { 0 })
    }
}

fn tree_is_valid(tree: &RbTree) -> bool {
    if tree.root.is_null() {
        return true;
    }

    unsafe {
        if (*tree.root).color != Color::Black {
            return false;
        }
    }

    validate(tree.root).is_some()
}

fn keys_in_order(tree: &RbTree) -> Vec<u64> {
    let mut keys = Vec::new();
    let mut node = tree.first() as *mut TestNode;

    unsafe {
        while !node.is_null() {
            keys.push((*node).key);
            node = rbtree::next(node as *mut RbNode) as *mut TestNode;
        }
    }

    keys
}

pub fn run() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    let mut tree = RbTree::new();
    let mut nodes: Vec<*mut TestNode> = Vec::new();

    // Deterministic LCG key stream with duplicates possible.
    let mut seed = 0x2545_f491_4f6c_dd1du64;
    for _ in 0..256 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);

        let node = Box::into_raw(Box::new(TestNode {
            node: RbNode::new(),
            key: seed >> 40,
        }));

        insert(&mut tree, node);
        nodes.push(node);
    }

    check(tree_is_valid(&tree), "valid after 256 inserts", &mut passed, &mut failed);

    let keys = keys_in_order(&tree);
    check(keys.len() == 256, "traversal visits every node", &mut passed, &mut failed);
    check(
        keys.windows(2).all(|pair| pair[0] <= pair[1]),
        "in-order traversal ascends",
        &mut passed,
        &mut failed,
    );

    // Delete every other node, validating as we go.
    let mut valid_during_deletes = true;

    for (i, &node) in nodes.iter().enumerate() {
        if i % 2 == 0 {
            unsafe { rbtree::delete(&mut tree, node as *mut RbNode) };

            if i % 32 == 0 && !tree_is_valid(&tree) {
                valid_during_deletes = false;
            }
        }
    }

    check(valid_during_deletes, "valid during interleaved deletes", &mut passed, &mut failed);
    check(tree_is_valid(&tree), "valid after deleting half", &mut passed, &mut failed);
    check(
        keys_in_order(&tree).len() == 128,
        "half the nodes remain",
        &mut passed,
        &mut failed,
    );

    // Reinsert fresh keys into the gaps, then empty the tree completely.
    for (i, &node) in nodes.iter().enumerate() {
        if i % 2 == 0 {
            unsafe {
                (*node).node.reset();
                (*node).key = i as u64;
            }
            insert(&mut tree, node);
        }
    }

    check(tree_is_valid(&tree), "valid after reinsertion", &mut passed, &mut failed);

    for &node in nodes.iter() {
        unsafe { rbtree::delete(&mut tree, node as *mut RbNode) };
    }

    check(tree.is_empty(), "empty after deleting everything", &mut passed, &mut failed);

    (passed, failed)
}
