#![forbid(unsafe_code)]

//! Persistent B-tree whose nodes and key/value pairs live in allocator chunks.
//!
//! The tree follows the classic multiway scheme with fanout `t`: every node
//! holds at most `2t - 1` keys and every node except the root at least
//! `t - 1`. Inserts split full nodes on the way down, deletes top up thin
//! nodes on the way down by rotating through the parent or merging with a
//! sibling, so neither ever walks back up. Every node write recomputes the
//! node checksum and every touched byte range is captured in the caller's
//! transaction.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

mod anchor;
mod check;
mod cursor;
pub(crate) mod node;
mod stats;
mod store;
mod tree;

pub use anchor::Anchor;
pub use check::{check_tree, TreeSummary};
pub use cursor::Cursor;
pub use node::{Node, Slot, TreeHeader, TREE_HDR_LEN};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::BTree;

/// Deepest tree supported; sizes cursor stacks and worst-case credits.
pub const MAX_HEIGHT: usize = 15;

/// Tree configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BTreeOptions {
    /// Fanout `t` used when creating a tree.
    pub fanout: u16,
    /// Validate the whole tree before and after every mutation.
    pub check_invariants: bool,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            fanout: 5,
            check_invariants: cfg!(debug_assertions),
        }
    }
}

/// Caller-supplied key/value operations. Not persisted.
pub trait KvOps: Send + Sync {
    /// Number of meaningful bytes in `key`.
    fn key_size(&self, key: &[u8]) -> usize;
    /// Number of meaningful bytes in `val`.
    fn val_size(&self, val: &[u8]) -> usize;
    /// Orders two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Variable-length keys compared byte by byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseOps;

impl KvOps for BytewiseOps {
    fn key_size(&self, key: &[u8]) -> usize {
        key.len()
    }

    fn val_size(&self, val: &[u8]) -> usize {
        val.len()
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Big-endian `u64` keys compared numerically.
#[derive(Clone, Copy, Debug, Default)]
pub struct U64Ops;

impl U64Ops {
    fn decode(key: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        let n = key.len().min(8);
        raw[..n].copy_from_slice(&key[..n]);
        u64::from_be_bytes(raw)
    }
}

impl KvOps for U64Ops {
    fn key_size(&self, _key: &[u8]) -> usize {
        8
    }

    fn val_size(&self, val: &[u8]) -> usize {
        val.len()
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        Self::decode(a).cmp(&Self::decode(b))
    }
}
