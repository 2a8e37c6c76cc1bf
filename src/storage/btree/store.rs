//! Per-operation node working set.
//!
//! Nodes are decoded once per operation, edited in memory and written back
//! by [`NodeStore::flush`], which captures each dirty node once. No segment
//! pin is held across allocator calls.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::primitives::seg::Segment;
use crate::primitives::tx::{Region, Tx};
use crate::storage::alloc::{Allocator, ALLOC_SHIFT_MIN};
use crate::types::{align_up, intact, Result, SegAddr};

use super::node::{kv_len, node_len, read_node, Node, Slot};
use super::{BTreeStats, KvOps};

/// Where the value bytes of a new pair come from.
#[derive(Clone, Copy)]
pub(crate) enum ValSrc<'v> {
    Bytes(&'v [u8]),
    Zeroed(u32),
}

impl ValSrc<'_> {
    fn len(&self) -> u32 {
        match self {
            ValSrc::Bytes(val) => val.len() as u32,
            ValSrc::Zeroed(len) => *len,
        }
    }
}

pub(crate) struct NodeStore<'t> {
    seg: &'t Segment,
    alloc: &'t Allocator,
    ops: &'t dyn KvOps,
    stats: &'t BTreeStats,
    tx: Option<&'t Tx>,
    fanout: u16,
    cache: BTreeMap<SegAddr, Node>,
    dirty: BTreeSet<SegAddr>,
}

impl<'t> NodeStore<'t> {
    pub(crate) fn new(
        seg: &'t Segment,
        alloc: &'t Allocator,
        ops: &'t dyn KvOps,
        stats: &'t BTreeStats,
        tx: Option<&'t Tx>,
        fanout: u16,
    ) -> Self {
        Self {
            seg,
            alloc,
            ops,
            stats,
            tx,
            fanout,
            cache: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub(crate) fn fanout(&self) -> u16 {
        self.fanout
    }

    pub(crate) fn load(&mut self, addr: SegAddr) -> Node {
        if let Some(node) = self.cache.get(&addr) {
            return node.clone();
        }
        let node = {
            let pin = self.seg.pin_read();
            intact(read_node(&pin, addr, self.fanout), "btree node damaged")
        };
        self.cache.insert(addr, node.clone());
        node
    }

    pub(crate) fn store(&mut self, node: Node) {
        self.dirty.insert(node.addr);
        self.cache.insert(node.addr, node);
    }

    pub(crate) fn alloc_node(&mut self, leaf: bool, level: u16) -> Result<Node> {
        let size = node_len(self.fanout, leaf);
        let addr = self.alloc.alloc_aligned(self.tx, size, ALLOC_SHIFT_MIN).wait()?;
        let node = Node::new(addr, self.fanout, leaf, level);
        self.store(node.clone());
        Ok(node)
    }

    pub(crate) fn free_node(&mut self, addr: SegAddr) -> Result<()> {
        self.cache.remove(&addr);
        self.dirty.remove(&addr);
        self.alloc.free_aligned(self.tx, Some(addr)).wait()
    }

    /// Binary search over the node's keys: `Ok(i)` on a hit, `Err(i)` with
    /// the insertion point on a miss.
    pub(crate) fn search(&self, node: &Node, key: &[u8]) -> std::result::Result<usize, usize> {
        self.stats.inc_search(node.leaf);
        let pin = self.seg.pin_read();
        node.slots.binary_search_by(|slot| {
            self.ops
                .compare(pin.bytes(slot.kv, u64::from(slot.key_len)), key)
        })
    }

    pub(crate) fn compare_slot(&self, key: &[u8], slot: &Slot) -> Ordering {
        let pin = self.seg.pin_read();
        self.ops
            .compare(key, pin.bytes(slot.kv, u64::from(slot.key_len)))
    }

    /// Allocates a pair holding `key` and the value from `val`, writes and
    /// captures it.
    pub(crate) fn alloc_kv(&mut self, key: &[u8], val: ValSrc<'_>) -> Result<Slot> {
        let val_len = val.len();
        let len = kv_len(key.len() as u64, u64::from(val_len));
        let kv = self.alloc.alloc_aligned(self.tx, len, ALLOC_SHIFT_MIN).wait()?;
        let slot = Slot {
            kv,
            key_len: key.len() as u32,
            val_len,
        };
        {
            let mut pin = self.seg.pin_write();
            let buf = pin.bytes_mut(kv, len);
            let key_end = key.len();
            let val_start = align_up(key_end as u64, 3) as usize;
            buf[..key_end].copy_from_slice(key);
            buf[key_end..val_start].fill(0);
            match val {
                ValSrc::Bytes(bytes) => buf[val_start..].copy_from_slice(bytes),
                ValSrc::Zeroed(_) => buf[val_start..].fill(0),
            }
        }
        self.capture(Region::new(kv, len));
        Ok(slot)
    }

    pub(crate) fn free_kv(&mut self, slot: Slot) -> Result<()> {
        self.alloc.free_aligned(self.tx, Some(slot.kv)).wait()
    }

    /// Overwrites the value of a pair in place; lengths must match.
    pub(crate) fn write_value(&mut self, slot: Slot, val: &[u8]) {
        {
            let mut pin = self.seg.pin_write();
            pin.write(slot.val_addr(), val);
        }
        self.capture(Region::new(slot.val_addr(), val.len() as u64));
    }

    pub(crate) fn key_of(&self, slot: &Slot) -> Vec<u8> {
        let pin = self.seg.pin_read();
        pin.bytes(slot.kv, u64::from(slot.key_len)).to_vec()
    }

    pub(crate) fn value_of(&self, slot: &Slot) -> Vec<u8> {
        let pin = self.seg.pin_read();
        pin.bytes(slot.val_addr(), u64::from(slot.val_len)).to_vec()
    }

    pub(crate) fn capture(&self, region: Region) {
        if let Some(tx) = self.tx {
            tx.capture(region);
        }
    }

    /// Encodes every dirty node and captures each once.
    pub(crate) fn flush(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let mut written = Vec::with_capacity(self.dirty.len());
        {
            let mut pin = self.seg.pin_write();
            for addr in &self.dirty {
                if let Some(node) = self.cache.get(addr) {
                    let len = node.encoded_len();
                    node.encode(pin.bytes_mut(*addr, len));
                    written.push(Region::new(*addr, len));
                }
            }
        }
        for region in written {
            self.capture(region);
        }
        self.dirty.clear();
    }
}
