//! Credit bounds for allocator and B-tree mutations.
//!
//! Every function here is pure: it maps an operation kind and its
//! parameters to the largest [`Credit`] the operation can consume. Heights
//! count levels, so a tree whose root is a leaf has height 1.

use crate::primitives::tx::Credit;
use crate::storage::alloc::{AllocOp, Allocator, ALLOC_SHIFT_MIN};
use crate::storage::btree::node::{kv_len, node_len, TREE_HDR_LEN};
use crate::storage::btree::MAX_HEIGHT;

/// Credit of one allocator call; see [`Allocator::credit`].
pub fn alloc_credit(op: AllocOp, size: u64, shift: u32) -> Credit {
    Allocator::credit(op, size, shift)
}

fn node_alloc(fanout: u16) -> Credit {
    alloc_credit(AllocOp::Alloc, node_len(fanout, false), ALLOC_SHIFT_MIN)
}

fn node_free() -> Credit {
    alloc_credit(AllocOp::Free, 0, ALLOC_SHIFT_MIN)
}

fn node_write(fanout: u16) -> Credit {
    Credit::region(node_len(fanout, false))
}

fn header_write() -> Credit {
    Credit::region(TREE_HDR_LEN)
}

/// Creating an empty tree: its header and a root leaf.
pub fn create_credit(fanout: u16) -> Credit {
    alloc_credit(AllocOp::Alloc, TREE_HDR_LEN, ALLOC_SHIFT_MIN)
        + alloc_credit(AllocOp::Alloc, node_len(fanout, true), ALLOC_SHIFT_MIN)
        + node_write(fanout)
        + header_write()
}

/// Destroying a tree of `nr_items` pairs.
///
/// Every node but the root holds at least one pair, so a tree never has
/// more than `nr_items + 1` nodes.
pub fn destroy_credit(nr_items: u64) -> Credit {
    node_free() * (2 * nr_items + 2)
}

/// One insert into a tree of `height` levels.
///
/// A root split allocates two nodes and every lower level at most one more.
/// Each level dirties the node on the path and its new sibling.
pub fn insert_credit(fanout: u16, height: u16, ksize: u64, vsize: u64) -> Credit {
    let h = u64::from(height.max(1));
    let kv = kv_len(ksize, vsize);
    alloc_credit(AllocOp::Alloc, kv, ALLOC_SHIFT_MIN)
        + Credit::region(kv)
        + node_alloc(fanout) * (h + 1)
        + node_write(fanout) * (2 * h + 1)
        + header_write()
}

/// One delete from a tree of `height` levels.
pub fn delete_credit(fanout: u16, height: u16) -> Credit {
    let h = u64::from(height.max(1));
    node_free()
        + node_free() * h
        + node_write(fanout) * (2 * h + 2)
        + header_write()
}

/// One value update to a pair with a `ksize` key and a new `vsize` value.
pub fn update_credit(fanout: u16, ksize: u64, vsize: u64) -> Credit {
    let kv = kv_len(ksize, vsize);
    alloc_credit(AllocOp::Alloc, kv, ALLOC_SHIFT_MIN)
        + Credit::region(kv)
        + node_free()
        + node_write(fanout)
        + Credit::region(vsize)
}

/// One in-place insert plus the value capture made when its anchor is
/// released.
pub fn insert_inplace_credit(fanout: u16, height: u16, ksize: u64, vsize: u64) -> Credit {
    insert_credit(fanout, height, ksize, vsize) + Credit::region(vsize)
}

/// One in-place update to a `vsize`-byte value plus its anchor release.
pub fn update_inplace_credit(fanout: u16, ksize: u64, vsize: u64) -> Credit {
    update_credit(fanout, ksize, vsize) + Credit::region(vsize)
}

/// One save, which either inserts or updates.
pub fn save_credit(fanout: u16, height: u16, ksize: u64, vsize: u64) -> Credit {
    insert_credit(fanout, height, ksize, vsize) + update_credit(fanout, ksize, vsize)
}

/// One truncate call removing at most `limit` pairs.
pub fn truncate_credit(fanout: u16, height: u16, limit: u64) -> Credit {
    delete_credit(fanout, height) * limit
}

/// Insert bound that holds for any tree.
pub fn insert_credit_worst(fanout: u16, ksize: u64, vsize: u64) -> Credit {
    insert_credit(fanout, MAX_HEIGHT as u16, ksize, vsize)
}

/// Delete bound that holds for any tree.
pub fn delete_credit_worst(fanout: u16) -> Credit {
    delete_credit(fanout, MAX_HEIGHT as u16)
}

/// Save bound that holds for any tree.
pub fn save_credit_worst(fanout: u16, ksize: u64, vsize: u64) -> Credit {
    save_credit(fanout, MAX_HEIGHT as u16, ksize, vsize)
}

/// Tallest tree of `fanout` that can hold `nr_items` pairs.
///
/// A tree of height `h` holds at least `2 * t^(h-1) - 1` pairs.
pub fn max_height(fanout: u16, nr_items: u64) -> u16 {
    let t = u64::from(fanout.max(2));
    let mut height = 1u16;
    let mut width = 1u64;
    while (height as usize) < MAX_HEIGHT {
        width = width.saturating_mul(t);
        if width.saturating_mul(2) - 1 > nr_items {
            break;
        }
        height += 1;
    }
    height
}
