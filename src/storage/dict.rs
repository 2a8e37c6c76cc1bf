//! Segment dictionary: a B-tree mapping names to segment addresses.
//!
//! The dictionary tree header is recorded in the segment header, so a
//! segment image can be reopened without outside bookkeeping. Applications
//! register the roots of their own trees here.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::primitives::seg::Segment;
use crate::primitives::tx::{Credit, Tx};
use crate::storage::alloc::Allocator;
use crate::types::{read_u64, Result, SegAddr, StoreError};

use super::btree::{BTree, BTreeOptions, KvOps};

const ADDR_LEN: u64 = 8;

/// Names compare bytewise; values are big-endian addresses.
#[derive(Clone, Copy, Debug, Default)]
struct NameOps;

impl KvOps for NameOps {
    fn key_size(&self, key: &[u8]) -> usize {
        key.len()
    }

    fn val_size(&self, _val: &[u8]) -> usize {
        ADDR_LEN as usize
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

fn check_name(name: &str) -> Result<&[u8]> {
    if name.is_empty() || name.contains('\0') {
        return Err(StoreError::Invalid("dictionary names must be non-empty and NUL-free"));
    }
    Ok(name.as_bytes())
}

fn decode_addr(val: &[u8]) -> Result<SegAddr> {
    if val.len() != ADDR_LEN as usize {
        return Err(StoreError::Corruption("dictionary value is not an address"));
    }
    SegAddr::from_raw(read_u64(val, 0..8)).ok_or(StoreError::Corruption("dictionary entry holds a null address"))
}

/// Handle on the dictionary of one segment.
pub struct SegDict {
    seg: Arc<Segment>,
    tree: BTree,
}

impl SegDict {
    /// Creates the dictionary and records it in the segment header.
    pub fn create(seg: Arc<Segment>, alloc: Arc<Allocator>, tx: Option<&Tx>, options: BTreeOptions) -> Result<Self> {
        if seg.header()?.dict_root.is_some() {
            return Err(StoreError::Exists);
        }
        let tree = BTree::init(seg.clone(), alloc, Arc::new(NameOps), options)?;
        let header = tree.create(tx).wait()?;
        seg.set_dict_root(tx, Some(header));
        tracing::debug!(target: "segstore::dict", header = %header, "dictionary created");
        Ok(Self { seg, tree })
    }

    /// Opens the dictionary recorded in the segment header.
    pub fn open(seg: Arc<Segment>, alloc: Arc<Allocator>, options: BTreeOptions) -> Result<Self> {
        let header = seg.header()?.dict_root.ok_or(StoreError::NotFound)?;
        let tree = BTree::init(seg.clone(), alloc, Arc::new(NameOps), options)?;
        tree.open(header)?;
        Ok(Self { seg, tree })
    }

    /// Frees the dictionary tree and clears the segment header slot. The
    /// registered addresses themselves are left alone.
    pub fn destroy(self, tx: Option<&Tx>) -> Result<()> {
        self.tree.destroy(tx).wait()?;
        self.seg.set_dict_root(tx, None);
        tracing::debug!(target: "segstore::dict", "dictionary destroyed");
        Ok(())
    }

    /// Registers `addr` under `name`; `Exists` when the name is taken.
    pub fn insert(&self, tx: Option<&Tx>, name: &str, addr: SegAddr) -> Result<()> {
        let name = check_name(name)?;
        self.tree
            .insert(tx, name, &addr.get().to_be_bytes())
            .wait()
    }

    /// Removes `name`.
    pub fn delete(&self, tx: Option<&Tx>, name: &str) -> Result<()> {
        let name = check_name(name)?;
        self.tree.delete(tx, name).wait()
    }

    /// Address registered under `name`.
    pub fn lookup(&self, name: &str) -> Result<SegAddr> {
        let name = check_name(name)?;
        decode_addr(&self.tree.lookup(name).wait()?)
    }

    /// Every entry whose name starts with `prefix`, in ascending name order.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, SegAddr)>> {
        let mut entries = Vec::new();
        let mut cursor = self.tree.cursor();
        let positioned = if prefix.is_empty() {
            cursor.first().wait()
        } else {
            cursor.get(prefix.as_bytes(), true).wait()
        };
        match positioned {
            Ok(()) => {}
            Err(StoreError::NotFound) => return Ok(entries),
            Err(err) => return Err(err),
        }
        while let Some((name, val)) = cursor.kv_get() {
            if !name.starts_with(prefix.as_bytes()) {
                break;
            }
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| StoreError::Corruption("dictionary name is not UTF-8"))?;
            entries.push((name, decode_addr(val)?));
            match cursor.next().wait() {
                Ok(()) => {}
                Err(StoreError::NotFound) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    /// Reports whether the dictionary has no entries.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Address of the dictionary tree header.
    pub fn header(&self) -> Option<SegAddr> {
        self.tree.header()
    }

    /// Underlying tree.
    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Credit for [`SegDict::create`] with `fanout`.
    pub fn create_credit(fanout: u16) -> Credit {
        crate::storage::credit::create_credit(fanout) + Credit::region(Segment::dict_root_region().len)
    }

    /// Credit for [`SegDict::destroy`].
    pub fn destroy_credit(&self) -> Credit {
        self.tree.destroy_credit() + Credit::region(Segment::dict_root_region().len)
    }

    /// Credit for `nr` inserts of names up to `name_len` bytes.
    pub fn insert_credit(&self, nr: u64, name_len: u64) -> Credit {
        self.tree.insert_credit(nr, name_len, ADDR_LEN)
    }

    /// Credit for `nr` deletes.
    pub fn delete_credit(&self, nr: u64) -> Credit {
        self.tree.delete_credit(nr)
    }
}
