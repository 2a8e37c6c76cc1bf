//! On-segment node and tree header formats.
//!
//! ```text
//! node header (24 bytes)
//! 0..8     magic
//! 8..10    version
//! 10       leaf flag
//! 11       reserved
//! 12..14   level, leaves are level 0
//! 14..16   active slot count
//! 16..18   fanout
//! 18..24   reserved
//! slots    (2t-1) x {kv addr u64, key len u32, value len u32}
//! children 2t x u64, internal nodes only
//! footer   crc32 u32 over everything before it, footer magic u32
//! ```
//!
//! A key/value pair lives in its own allocation: the key padded to eight
//! bytes, then the value.

use std::ops::Range;

use smallvec::SmallVec;

use crate::primitives::seg::SegBytes;
use crate::types::checksum::{crc32_with_zeroed, Checksum, Crc32Fast};
use crate::types::{align_up, read_u16, read_u32, read_u64, Result, SegAddr, StoreError};

/// Magic at the start of every node.
pub const NODE_MAGIC: u64 = 0x5345_4742_4e4f_4445;
/// Magic closing every node footer.
pub const NODE_FOOTER_MAGIC: u32 = 0x4e46_4f54;
/// Node format version.
pub const NODE_VERSION: u16 = 1;
/// Magic at the start of a tree header.
pub const TREE_MAGIC: u64 = 0x5345_4742_5452_4545;
/// Tree header format version.
pub const TREE_VERSION: u16 = 1;
/// Encoded tree header length.
pub const TREE_HDR_LEN: u64 = 40;

const NODE_HDR_LEN: usize = 24;
const SLOT_LEN: usize = 16;
const FOOTER_LEN: usize = 8;

const MAGIC: Range<usize> = 0..8;
const VERSION: Range<usize> = 8..10;
const LEAF: usize = 10;
const RESERVED0: usize = 11;
const LEVEL: Range<usize> = 12..14;
const NR_ACTIVE: Range<usize> = 14..16;
const FANOUT: Range<usize> = 16..18;
const RESERVED1: Range<usize> = 18..24;

const TREE_MAGIC_AT: Range<usize> = 0..8;
const TREE_VERSION_AT: Range<usize> = 8..10;
const TREE_FANOUT: Range<usize> = 10..12;
const TREE_RESERVED0: Range<usize> = 12..16;
const TREE_ROOT: Range<usize> = 16..24;
const TREE_NR_ITEMS: Range<usize> = 24..32;
const TREE_CRC: Range<usize> = 32..36;
const TREE_RESERVED1: Range<usize> = 36..40;

/// Largest number of keys a node of `fanout` holds.
pub fn max_keys(fanout: u16) -> usize {
    2 * fanout as usize - 1
}

/// Encoded size of a node; leaves carry no child array.
pub fn node_len(fanout: u16, leaf: bool) -> u64 {
    let t = u64::from(fanout);
    let children = if leaf { 0 } else { 2 * t * 8 };
    (NODE_HDR_LEN + FOOTER_LEN) as u64 + (2 * t - 1) * SLOT_LEN as u64 + children
}

/// Size of the allocation holding a key/value pair.
pub fn kv_len(key_len: u64, val_len: u64) -> u64 {
    align_up(key_len, 3) + val_len
}

/// Location of one key/value pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Start of the pair allocation; the key sits here.
    pub kv: SegAddr,
    /// Key length in bytes.
    pub key_len: u32,
    /// Value length in bytes.
    pub val_len: u32,
}

impl Slot {
    /// First value byte.
    pub fn val_addr(&self) -> SegAddr {
        self.kv.offset(align_up(u64::from(self.key_len), 3))
    }

    /// Bytes of the pair in use. A shrinking in-place update leaves the
    /// allocation itself larger.
    pub fn kv_len(&self) -> u64 {
        kv_len(u64::from(self.key_len), u64::from(self.val_len))
    }
}

/// Slot array of one node.
pub type Slots = SmallVec<[Slot; 9]>;
/// Child array of one internal node.
pub type Children = SmallVec<[SegAddr; 10]>;

/// Decoded B-tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Where the node lives (not persisted).
    pub addr: SegAddr,
    /// Leaf nodes carry no children.
    pub leaf: bool,
    /// Distance from the leaves.
    pub level: u16,
    /// Fanout the node was sized for.
    pub fanout: u16,
    /// Sorted key/value slots.
    pub slots: Slots,
    /// `slots.len() + 1` children on internal nodes.
    pub children: Children,
}

impl Node {
    /// Empty node.
    pub fn new(addr: SegAddr, fanout: u16, leaf: bool, level: u16) -> Self {
        Self {
            addr,
            leaf,
            level,
            fanout,
            slots: Slots::new(),
            children: Children::new(),
        }
    }

    /// Number of active slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Reports whether the node holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reports whether another slot would overflow the node.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= max_keys(self.fanout)
    }

    /// Encoded size.
    pub fn encoded_len(&self) -> u64 {
        node_len(self.fanout, self.leaf)
    }

    /// Validates the fixed header and returns the encoded length of the node
    /// it starts.
    pub fn peek_len(head: &[u8], fanout: u16) -> Result<u64> {
        if head.len() < NODE_HDR_LEN {
            return Err(StoreError::Corruption("node header truncated"));
        }
        if read_u64(head, MAGIC) != NODE_MAGIC {
            return Err(StoreError::Corruption("node magic mismatch"));
        }
        if read_u16(head, VERSION) != NODE_VERSION {
            return Err(StoreError::Corruption("unsupported node version"));
        }
        if read_u16(head, FANOUT) != fanout {
            return Err(StoreError::Corruption("node fanout mismatch"));
        }
        let leaf = match head[LEAF] {
            0 => false,
            1 => true,
            _ => return Err(StoreError::Corruption("node leaf flag out of range")),
        };
        Ok(node_len(fanout, leaf))
    }

    /// Decodes and checksums the node at `addr`.
    pub fn decode(addr: SegAddr, buf: &[u8], fanout: u16) -> Result<Self> {
        let len = Self::peek_len(buf, fanout)? as usize;
        if buf.len() < len {
            return Err(StoreError::Corruption("node truncated"));
        }
        let buf = &buf[..len];
        let body = len - FOOTER_LEN;
        if read_u32(buf, body + 4..len) != NODE_FOOTER_MAGIC {
            return Err(StoreError::Corruption("node footer magic mismatch"));
        }
        let mut crc = Crc32Fast::default();
        crc.update(&buf[..body]);
        if read_u32(buf, body..body + 4) != crc.finalize() {
            return Err(StoreError::Corruption("node checksum mismatch"));
        }
        if buf[RESERVED0] != 0 || buf[RESERVED1].iter().any(|b| *b != 0) {
            return Err(StoreError::Corruption("node reserved bytes not zero"));
        }
        let leaf = buf[LEAF] == 1;
        let level = read_u16(buf, LEVEL);
        if leaf != (level == 0) {
            return Err(StoreError::Corruption("node level disagrees with leaf flag"));
        }
        let nr = read_u16(buf, NR_ACTIVE) as usize;
        if nr > max_keys(fanout) {
            return Err(StoreError::Corruption("node slot count out of range"));
        }
        let mut node = Node::new(addr, fanout, leaf, level);
        for i in 0..nr {
            let at = NODE_HDR_LEN + i * SLOT_LEN;
            let kv = SegAddr::from_raw(read_u64(buf, at..at + 8))
                .ok_or(StoreError::Corruption("node slot has null pair address"))?;
            node.slots.push(Slot {
                kv,
                key_len: read_u32(buf, at + 8..at + 12),
                val_len: read_u32(buf, at + 12..at + 16),
            });
        }
        if !leaf {
            let base = NODE_HDR_LEN + max_keys(fanout) * SLOT_LEN;
            for i in 0..=nr {
                let at = base + i * 8;
                let child = SegAddr::from_raw(read_u64(buf, at..at + 8))
                    .ok_or(StoreError::Corruption("internal node has null child"))?;
                node.children.push(child);
            }
        }
        Ok(node)
    }

    /// Encodes the node into `buf`, which must be [`Node::encoded_len`] bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        let len = self.encoded_len() as usize;
        let buf = &mut buf[..len];
        buf.fill(0);
        buf[MAGIC].copy_from_slice(&NODE_MAGIC.to_be_bytes());
        buf[VERSION].copy_from_slice(&NODE_VERSION.to_be_bytes());
        buf[LEAF] = u8::from(self.leaf);
        buf[LEVEL].copy_from_slice(&self.level.to_be_bytes());
        buf[NR_ACTIVE].copy_from_slice(&(self.slots.len() as u16).to_be_bytes());
        buf[FANOUT].copy_from_slice(&self.fanout.to_be_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let at = NODE_HDR_LEN + i * SLOT_LEN;
            buf[at..at + 8].copy_from_slice(&slot.kv.get().to_be_bytes());
            buf[at + 8..at + 12].copy_from_slice(&slot.key_len.to_be_bytes());
            buf[at + 12..at + 16].copy_from_slice(&slot.val_len.to_be_bytes());
        }
        if !self.leaf {
            let base = NODE_HDR_LEN + max_keys(self.fanout) * SLOT_LEN;
            for (i, child) in self.children.iter().enumerate() {
                let at = base + i * 8;
                buf[at..at + 8].copy_from_slice(&child.get().to_be_bytes());
            }
        }
        let body = len - FOOTER_LEN;
        let mut crc = Crc32Fast::default();
        crc.update(&buf[..body]);
        buf[body..body + 4].copy_from_slice(&crc.finalize().to_be_bytes());
        buf[body + 4..].copy_from_slice(&NODE_FOOTER_MAGIC.to_be_bytes());
    }
}

/// Reads the node at `addr`, failing instead of faulting on wild addresses.
pub(crate) fn read_node<P: SegBytes>(pin: &P, addr: SegAddr, fanout: u16) -> Result<Node> {
    if !pin.spans(addr, NODE_HDR_LEN as u64) {
        return Err(StoreError::Corruption("node address outside segment"));
    }
    let len = Node::peek_len(pin.bytes_at(addr, NODE_HDR_LEN as u64), fanout)?;
    if !pin.spans(addr, len) {
        return Err(StoreError::Corruption("node extends past segment"));
    }
    Node::decode(addr, pin.bytes_at(addr, len), fanout)
}

/// Persisted tree header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeHeader {
    /// Fanout every node of the tree was sized for.
    pub fanout: u16,
    /// Root node.
    pub root: SegAddr,
    /// Number of key/value pairs.
    pub nr_items: u64,
}

impl TreeHeader {
    /// Decodes and checksums a tree header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TREE_HDR_LEN as usize {
            return Err(StoreError::Corruption("tree header truncated"));
        }
        let buf = &buf[..TREE_HDR_LEN as usize];
        if read_u64(buf, TREE_MAGIC_AT) != TREE_MAGIC {
            return Err(StoreError::Corruption("tree magic mismatch"));
        }
        if read_u16(buf, TREE_VERSION_AT) != TREE_VERSION {
            return Err(StoreError::Corruption("unsupported tree version"));
        }
        if read_u32(buf, TREE_CRC) != crc32_with_zeroed(buf, TREE_CRC) {
            return Err(StoreError::Corruption("tree header checksum mismatch"));
        }
        if buf[TREE_RESERVED0].iter().chain(&buf[TREE_RESERVED1]).any(|b| *b != 0) {
            return Err(StoreError::Corruption("tree header reserved bytes not zero"));
        }
        let fanout = read_u16(buf, TREE_FANOUT);
        if fanout < 2 {
            return Err(StoreError::Corruption("tree fanout out of range"));
        }
        Ok(Self {
            fanout,
            root: SegAddr::from_raw(read_u64(buf, TREE_ROOT))
                .ok_or(StoreError::Corruption("tree has no root"))?,
            nr_items: read_u64(buf, TREE_NR_ITEMS),
        })
    }

    /// Encodes the header into `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        let buf = &mut buf[..TREE_HDR_LEN as usize];
        buf.fill(0);
        buf[TREE_MAGIC_AT].copy_from_slice(&TREE_MAGIC.to_be_bytes());
        buf[TREE_VERSION_AT].copy_from_slice(&TREE_VERSION.to_be_bytes());
        buf[TREE_FANOUT].copy_from_slice(&self.fanout.to_be_bytes());
        buf[TREE_ROOT].copy_from_slice(&self.root.get().to_be_bytes());
        buf[TREE_NR_ITEMS].copy_from_slice(&self.nr_items.to_be_bytes());
        let crc = crc32_with_zeroed(buf, TREE_CRC);
        buf[TREE_CRC].copy_from_slice(&crc.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(kv: u64) -> Slot {
        Slot {
            kv: SegAddr(kv),
            key_len: 3,
            val_len: 11,
        }
    }

    #[test]
    fn sizes_follow_fanout() {
        assert_eq!(max_keys(5), 9);
        assert_eq!(node_len(5, true), 24 + 9 * 16 + 8);
        assert_eq!(node_len(5, false), 24 + 9 * 16 + 10 * 8 + 8);
        assert_eq!(kv_len(3, 11), 19);
        assert_eq!(slot(4096).val_addr(), SegAddr(4104));
    }

    #[test]
    fn internal_node_codec() -> Result<()> {
        let mut node = Node::new(SegAddr(1024), 3, false, 2);
        node.slots.push(slot(4096));
        node.slots.push(slot(4160));
        node.children.extend([SegAddr(8192), SegAddr(8448), SegAddr(8704)]);
        let mut buf = vec![0u8; node.encoded_len() as usize];
        node.encode(&mut buf);
        assert_eq!(Node::peek_len(&buf, 3)?, node_len(3, false));
        assert_eq!(Node::decode(SegAddr(1024), &buf, 3)?, node);
        Ok(())
    }

    #[test]
    fn leaf_checksum_catches_flipped_bit() {
        let mut node = Node::new(SegAddr(1024), 2, true, 0);
        node.slots.push(slot(4096));
        let mut buf = vec![0u8; node.encoded_len() as usize];
        node.encode(&mut buf);
        buf[NODE_HDR_LEN + 9] ^= 0x01;
        assert!(matches!(
            Node::decode(SegAddr(1024), &buf, 2),
            Err(StoreError::Corruption("node checksum mismatch"))
        ));
        assert!(matches!(
            Node::decode(SegAddr(1024), &buf, 5),
            Err(StoreError::Corruption("node fanout mismatch"))
        ));
    }

    #[test]
    fn tree_header_codec() -> Result<()> {
        let header = TreeHeader {
            fanout: 5,
            root: SegAddr(2048),
            nr_items: 17,
        };
        let mut buf = [0u8; TREE_HDR_LEN as usize];
        header.encode(&mut buf);
        assert_eq!(TreeHeader::decode(&buf)?, header);
        buf[TREE_NR_ITEMS.start] ^= 0x80;
        assert!(TreeHeader::decode(&buf).is_err());
        Ok(())
    }
}
