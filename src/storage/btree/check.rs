use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;

use crate::primitives::seg::SegBytes;
use crate::types::{Result, SegAddr, StoreError};

use super::node::{read_node, Slot, TreeHeader, TREE_HDR_LEN};
use super::{KvOps, MAX_HEIGHT};

/// Shape of a tree that passed [`check_tree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TreeSummary {
    /// Fanout recorded in the tree header.
    pub fanout: u16,
    /// Root node address.
    #[serde(serialize_with = "serialize_addr")]
    pub root: SegAddr,
    /// Number of levels.
    pub height: u16,
    /// Number of nodes.
    pub nodes: u64,
    /// Number of key/value pairs.
    pub items: u64,
    /// Bytes held by key/value chunks, excluding chunk headers.
    pub kv_bytes: u64,
}

fn serialize_addr<S: serde::Serializer>(addr: &SegAddr, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(addr.get())
}

fn pair_key<'p, P: SegBytes>(pin: &'p P, slot: &Slot) -> Result<&'p [u8]> {
    if !pin.spans(slot.kv, slot.kv_len()) {
        return Err(StoreError::Corruption("key/value pair outside segment"));
    }
    Ok(pin.bytes_at(slot.kv, u64::from(slot.key_len)))
}

struct Visit {
    addr: SegAddr,
    level: u16,
    lo: Option<Slot>,
    hi: Option<Slot>,
}

/// Walks the tree whose header lives at `header` and validates it.
///
/// Checked: node and header checksums, occupancy bounds, strict key order
/// inside and across nodes, uniform leaf depth, that every pair lies inside
/// the segment and that the header item count matches the leaves.
pub fn check_tree<P: SegBytes>(pin: &P, header: SegAddr, ops: &dyn KvOps) -> Result<TreeSummary> {
    if !pin.spans(header, TREE_HDR_LEN) {
        return Err(StoreError::Corruption("tree header outside segment"));
    }
    let hdr = TreeHeader::decode(pin.bytes_at(header, TREE_HDR_LEN))?;
    let fanout = usize::from(hdr.fanout);
    let root = read_node(pin, hdr.root, hdr.fanout)?;
    if usize::from(root.level) >= MAX_HEIGHT {
        return Err(StoreError::Corruption("tree taller than supported"));
    }
    if !root.leaf && root.is_empty() {
        return Err(StoreError::Corruption("internal root without keys"));
    }

    let key = |slot: &Slot| pair_key(pin, slot);

    let mut summary = TreeSummary {
        fanout: hdr.fanout,
        root: hdr.root,
        height: root.level + 1,
        nodes: 0,
        items: 0,
        kv_bytes: 0,
    };
    let mut seen = BTreeSet::new();
    let mut stack = vec![Visit {
        addr: hdr.root,
        level: root.level,
        lo: None,
        hi: None,
    }];
    while let Some(visit) = stack.pop() {
        if !seen.insert(visit.addr) {
            return Err(StoreError::Corruption("node reachable twice"));
        }
        let node = read_node(pin, visit.addr, hdr.fanout)?;
        if node.level != visit.level {
            return Err(StoreError::Corruption("leaves at uneven depth"));
        }
        if visit.addr != hdr.root && node.len() < fanout - 1 {
            return Err(StoreError::Corruption("node below minimum occupancy"));
        }
        for (i, slot) in node.slots.iter().enumerate() {
            let k = key(slot)?;
            if i > 0 && ops.compare(key(&node.slots[i - 1])?, k) != Ordering::Less {
                return Err(StoreError::Corruption("node keys out of order"));
            }
            summary.kv_bytes += slot.kv_len();
        }
        if let (Some(lo), Some(first)) = (visit.lo, node.slots.first()) {
            if ops.compare(key(&lo)?, key(first)?) != Ordering::Less {
                return Err(StoreError::Corruption("key below its subtree bound"));
            }
        }
        if let (Some(hi), Some(last)) = (visit.hi, node.slots.last()) {
            if ops.compare(key(last)?, key(&hi)?) != Ordering::Less {
                return Err(StoreError::Corruption("key above its subtree bound"));
            }
        }
        summary.nodes += 1;
        summary.items += node.len() as u64;
        if node.leaf {
            continue;
        }
        for (j, child) in node.children.iter().enumerate() {
            stack.push(Visit {
                addr: *child,
                level: node.level - 1,
                lo: if j == 0 { visit.lo } else { Some(node.slots[j - 1]) },
                hi: node.slots.get(j).copied().or(visit.hi),
            });
        }
    }
    if summary.items != hdr.nr_items {
        return Err(StoreError::Corruption("tree item count does not match header"));
    }
    Ok(summary)
}
