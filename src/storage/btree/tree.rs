use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::primitives::op::Op;
use crate::primitives::seg::{SegBytes, Segment};
use crate::primitives::tx::{Credit, Region, Tx};
use crate::storage::alloc::Allocator;
use crate::storage::credit;
use crate::types::{fatal, intact, Result, SegAddr, StoreError};

use super::anchor::Anchor;
use super::check::check_tree;
use super::cursor::Cursor;
use super::node::{max_keys, read_node, Node, Slot, TreeHeader, TREE_HDR_LEN};
use super::store::{NodeStore, ValSrc};
use super::{BTreeOptions, BTreeStats, KvOps, MAX_HEIGHT};

/// In-memory mirror of the persisted tree header, guarded by the tree lock.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TreeState {
    pub(crate) header: Option<SegAddr>,
    pub(crate) root: SegAddr,
    pub(crate) fanout: u16,
    pub(crate) height: u16,
    pub(crate) nr_items: u64,
    /// Bumped by every mutation; cursors re-seek when it moves.
    pub(crate) generation: u64,
}

impl TreeState {
    fn detached(fanout: u16, generation: u64) -> Self {
        Self {
            header: None,
            root: SegAddr(0),
            fanout,
            height: 0,
            nr_items: 0,
            generation,
        }
    }

    pub(crate) fn created(&self) -> Result<SegAddr> {
        self.header.ok_or(StoreError::Invalid("tree not created"))
    }
}

/// What a delete descent is looking for.
#[derive(Clone, Copy)]
enum Target<'k> {
    Key(&'k [u8]),
    Min,
    Max,
}

/// B-tree handle.
///
/// One reader/writer lock covers the whole tree: lookups and cursor moves
/// share it, mutations hold it exclusively for the whole call.
pub struct BTree {
    seg: Arc<Segment>,
    alloc: Arc<Allocator>,
    ops: Arc<dyn KvOps>,
    options: BTreeOptions,
    state: RwLock<TreeState>,
    stats: BTreeStats,
}

impl BTree {
    /// Builds a handle that is not yet attached to a persisted tree; follow
    /// with [`BTree::create`] or [`BTree::open`].
    pub fn init(
        seg: Arc<Segment>,
        alloc: Arc<Allocator>,
        ops: Arc<dyn KvOps>,
        options: BTreeOptions,
    ) -> Result<Self> {
        if options.fanout < 2 {
            return Err(StoreError::Invalid("fanout must be at least 2"));
        }
        if max_keys(options.fanout) > usize::from(u16::MAX) {
            return Err(StoreError::Invalid("fanout too large"));
        }
        let fanout = options.fanout;
        Ok(Self {
            seg,
            alloc,
            ops,
            options,
            state: RwLock::new(TreeState::detached(fanout, 0)),
            stats: BTreeStats::default(),
        })
    }

    /// Releases the handle. The persisted tree is untouched.
    pub fn fini(self) {
        tracing::trace!(target: "segstore::btree", "btree handle released");
    }

    /// Options in effect.
    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    /// Operation counters.
    pub fn stats(&self) -> &BTreeStats {
        &self.stats
    }

    /// Address of the persisted tree header, once attached.
    pub fn header(&self) -> Option<SegAddr> {
        self.state.read().header
    }

    /// Number of key/value pairs.
    pub fn len(&self) -> u64 {
        self.state.read().nr_items
    }

    /// Reports whether the tree holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels; zero while detached.
    pub fn height(&self) -> u16 {
        self.state.read().height
    }

    /// Fanout of the attached tree, or of [`BTreeOptions`] while detached.
    pub fn fanout(&self) -> u16 {
        self.state.read().fanout
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state.read()
    }

    pub(crate) fn kv_ops(&self) -> &dyn KvOps {
        self.ops.as_ref()
    }

    pub(crate) fn reader(&self, fanout: u16) -> NodeStore<'_> {
        self.node_store(None, fanout)
    }

    fn node_store<'t>(&'t self, tx: Option<&'t Tx>, fanout: u16) -> NodeStore<'t> {
        NodeStore::new(
            &self.seg,
            &self.alloc,
            self.ops.as_ref(),
            &self.stats,
            tx,
            fanout,
        )
    }

    pub(crate) fn key_bytes<'k>(&self, key: &'k [u8]) -> Result<&'k [u8]> {
        let size = self.ops.key_size(key);
        if size > key.len() {
            return Err(StoreError::Invalid("key shorter than its reported size"));
        }
        if u32::try_from(size).is_err() {
            return Err(StoreError::Invalid("key too large"));
        }
        Ok(&key[..size])
    }

    fn val_bytes<'v>(&self, val: &'v [u8]) -> Result<&'v [u8]> {
        let size = self.ops.val_size(val);
        if size > val.len() {
            return Err(StoreError::Invalid("value shorter than its reported size"));
        }
        if u32::try_from(size).is_err() {
            return Err(StoreError::Invalid("value too large"));
        }
        Ok(&val[..size])
    }

    /// Allocates the tree header and an empty root leaf. Returns the header
    /// address, which [`BTree::open`] accepts later.
    pub fn create(&self, tx: Option<&Tx>) -> Op<SegAddr> {
        Op::run("btree.create", || {
            let mut state = self.state.write();
            if state.header.is_some() {
                return Err(StoreError::Invalid("tree already attached"));
            }
            let fanout = self.options.fanout;
            let header = self.alloc.alloc(tx, TREE_HDR_LEN).wait()?;
            let mut store = self.node_store(tx, fanout);
            let root = match store.alloc_node(true, 0) {
                Ok(root) => root,
                Err(err) => {
                    self.alloc.free(tx, Some(header)).wait()?;
                    return Err(err);
                }
            };
            store.flush();
            *state = TreeState {
                header: Some(header),
                root: root.addr,
                fanout,
                height: 1,
                nr_items: 0,
                generation: state.generation + 1,
            };
            self.write_header(tx, header, &state);
            tracing::debug!(target: "segstore::btree", header = %header, fanout, "btree created");
            Ok(header)
        })
    }

    /// Attaches the handle to the tree whose header lives at `header`.
    pub fn open(&self, header: SegAddr) -> Result<()> {
        let mut state = self.state.write();
        if state.header.is_some() {
            return Err(StoreError::Invalid("tree already attached"));
        }
        let (hdr, root) = {
            let pin = self.seg.pin_read();
            if !pin.spans(header, TREE_HDR_LEN) {
                return Err(StoreError::Corruption("tree header outside segment"));
            }
            let hdr = TreeHeader::decode(pin.bytes(header, TREE_HDR_LEN))?;
            let root = read_node(&pin, hdr.root, hdr.fanout)?;
            (hdr, root)
        };
        if usize::from(root.level) >= MAX_HEIGHT {
            return Err(StoreError::Corruption("tree taller than supported"));
        }
        *state = TreeState {
            header: Some(header),
            root: hdr.root,
            fanout: hdr.fanout,
            height: root.level + 1,
            nr_items: hdr.nr_items,
            generation: state.generation + 1,
        };
        tracing::debug!(
            target: "segstore::btree",
            header = %header,
            fanout = hdr.fanout,
            height = state.height,
            items = hdr.nr_items,
            "btree opened"
        );
        Ok(())
    }

    /// Frees every pair, every node and the tree header, then detaches.
    pub fn destroy(&self, tx: Option<&Tx>) -> Op<()> {
        Op::run("btree.destroy", || {
            let mut state = self.state.write();
            let header = state.created()?;
            self.pre_check(&state);
            let mut store = self.node_store(tx, state.fanout);
            let mut queue = vec![state.root];
            let mut next = 0;
            while next < queue.len() {
                let node = store.load(queue[next]);
                next += 1;
                for slot in &node.slots {
                    store.free_kv(*slot)?;
                }
                queue.extend(node.children.iter().copied());
            }
            for addr in &queue {
                store.free_node(*addr)?;
            }
            self.alloc.free(tx, Some(header)).wait()?;
            tracing::debug!(
                target: "segstore::btree",
                header = %header,
                nodes = queue.len(),
                items = state.nr_items,
                "btree destroyed"
            );
            *state = TreeState::detached(self.options.fanout, state.generation + 1);
            Ok(())
        })
    }

    /// Deletes up to `limit` pairs from the low end. Returns how many went.
    ///
    /// The tree is valid between calls, so a large tree can be emptied over
    /// several bounded transactions.
    pub fn truncate(&self, tx: Option<&Tx>, limit: u64) -> Op<u64> {
        Op::run("btree.truncate", || {
            let mut state = self.state.write();
            self.mutate(&mut state, tx, |state, store| {
                let mut removed = 0;
                while removed < limit && state.nr_items > 0 {
                    let slot = self.delete_slot(state, store, Target::Min)?;
                    store.free_kv(slot)?;
                    state.nr_items -= 1;
                    removed += 1;
                }
                self.stats.inc_deletes(removed);
                Ok(removed)
            })
        })
    }

    /// Inserts a new pair; `Exists` when the key is present.
    pub fn insert(&self, tx: Option<&Tx>, key: &[u8], val: &[u8]) -> Op<()> {
        Op::run("btree.insert", || {
            let key = self.key_bytes(key)?;
            let val = self.val_bytes(val)?;
            let mut state = self.state.write();
            self.mutate(&mut state, tx, |state, store| {
                self.insert_locked(state, store, key, ValSrc::Bytes(val))
                    .map(|_| ())
            })
        })
    }

    /// Replaces the value of an existing pair; `NotFound` when absent.
    pub fn update(&self, tx: Option<&Tx>, key: &[u8], val: &[u8]) -> Op<()> {
        Op::run("btree.update", || {
            let key = self.key_bytes(key)?;
            let val = self.val_bytes(val)?;
            let mut state = self.state.write();
            self.mutate(&mut state, tx, |state, store| {
                self.update_locked(state, store, key, val).map(|_| ())
            })
        })
    }

    /// Inserts, or updates when `overwrite` is set and the key is present.
    pub fn save(&self, tx: Option<&Tx>, key: &[u8], val: &[u8], overwrite: bool) -> Op<()> {
        Op::run("btree.save", || {
            let key = self.key_bytes(key)?;
            let val = self.val_bytes(val)?;
            let mut state = self.state.write();
            self.mutate(&mut state, tx, |state, store| {
                match self.find(store, state.root, key) {
                    Some(_) if overwrite => self.update_locked(state, store, key, val).map(|_| ()),
                    Some(_) => Err(StoreError::Exists),
                    None => self
                        .insert_locked(state, store, key, ValSrc::Bytes(val))
                        .map(|_| ()),
                }
            })
        })
    }

    /// Deletes a pair; `NotFound` leaves the tree untouched.
    pub fn delete(&self, tx: Option<&Tx>, key: &[u8]) -> Op<()> {
        Op::run("btree.delete", || {
            let key = self.key_bytes(key)?;
            let mut state = self.state.write();
            self.mutate(&mut state, tx, |state, store| {
                if self.find(store, state.root, key).is_none() {
                    return Err(StoreError::NotFound);
                }
                let slot = self.delete_slot(state, store, Target::Key(key))?;
                store.free_kv(slot)?;
                state.nr_items -= 1;
                self.stats.inc_deletes(1);
                Ok(())
            })
        })
    }

    /// Copies the value stored under `key`.
    pub fn lookup(&self, key: &[u8]) -> Op<Vec<u8>> {
        Op::run("btree.lookup", || {
            let key = self.key_bytes(key)?;
            let state = self.state.read();
            state.created()?;
            let mut store = self.reader(state.fanout);
            match self.find(&mut store, state.root, key) {
                Some((node, i)) => Ok(store.value_of(&node.slots[i])),
                None => Err(StoreError::NotFound),
            }
        })
    }

    /// Smallest key; `NotFound` on an empty tree.
    pub fn min_key(&self) -> Op<Vec<u8>> {
        Op::run("btree.min_key", || self.extreme_key(true))
    }

    /// Largest key; `NotFound` on an empty tree.
    pub fn max_key(&self) -> Op<Vec<u8>> {
        Op::run("btree.max_key", || self.extreme_key(false))
    }

    /// Inserts `key` with a zeroed value of `vsize` bytes and anchors the
    /// value for the caller to fill.
    pub fn insert_inplace<'a>(&'a self, tx: Option<&Tx>, key: &[u8], vsize: usize) -> Op<Anchor<'a>> {
        Op::run("btree.insert_inplace", || {
            let key = self.key_bytes(key)?;
            let vsize = u32::try_from(vsize).map_err(|_| StoreError::Invalid("value too large"))?;
            let mut state = self.state.write();
            let slot = self.mutate(&mut state, tx, |state, store| {
                self.insert_locked(state, store, key, ValSrc::Zeroed(vsize))
            })?;
            Ok(Anchor::write(state, &self.seg, value_region(&slot)))
        })
    }

    /// Anchors the value under `key` for in-place modification, resizing it
    /// to `vsize` bytes first when the length differs.
    ///
    /// A shorter value stays in its pair and keeps its leading bytes; only
    /// the slot length changes. A longer one moves to a new pair that keeps
    /// the old bytes as its prefix and zero-fills the rest.
    pub fn update_inplace<'a>(&'a self, tx: Option<&Tx>, key: &[u8], vsize: usize) -> Op<Anchor<'a>> {
        Op::run("btree.update_inplace", || {
            let key = self.key_bytes(key)?;
            let Ok(vlen) = u32::try_from(vsize) else {
                return Err(StoreError::Invalid("value too large"));
            };
            let mut state = self.state.write();
            let slot = self.mutate(&mut state, tx, |state, store| {
                let Some((mut node, i)) = self.find(store, state.root, key) else {
                    return Err(StoreError::NotFound);
                };
                let old = node.slots[i];
                if old.val_len == vlen {
                    self.stats.inc_updates();
                    return Ok(old);
                }
                if vlen < old.val_len {
                    let shrunk = Slot { val_len: vlen, ..old };
                    node.slots[i] = shrunk;
                    store.store(node);
                    self.stats.inc_updates();
                    return Ok(shrunk);
                }
                let mut val = store.value_of(&old);
                val.resize(vsize, 0);
                self.update_locked(state, store, key, &val)
            })?;
            Ok(Anchor::write(state, &self.seg, value_region(&slot)))
        })
    }

    /// Anchors the value under `key` for reading.
    pub fn lookup_inplace(&self, key: &[u8]) -> Op<Anchor<'_>> {
        Op::run("btree.lookup_inplace", || {
            let key = self.key_bytes(key)?;
            let state = self.state.read();
            state.created()?;
            let mut store = self.reader(state.fanout);
            let Some((node, i)) = self.find(&mut store, state.root, key) else {
                return Err(StoreError::NotFound);
            };
            let region = value_region(&node.slots[i]);
            drop(store);
            Ok(Anchor::read(state, &self.seg, region))
        })
    }

    /// Cursor over this tree, initially unpositioned.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Validates the whole tree without panicking.
    pub fn check(&self) -> Result<()> {
        let state = self.state.read();
        self.check_state(&state)
    }

    /// Credit for creating a tree with this handle's fanout.
    pub fn create_credit(&self) -> Credit {
        credit::create_credit(self.options.fanout)
    }

    /// Credit for destroying the attached tree.
    pub fn destroy_credit(&self) -> Credit {
        credit::destroy_credit(self.state.read().nr_items)
    }

    /// Credit for `nr` inserts of `ksize`/`vsize` pairs, allowing for the
    /// tree to grow while they run.
    pub fn insert_credit(&self, nr: u64, ksize: u64, vsize: u64) -> Credit {
        let (fanout, height) = self.growth_bound(nr);
        credit::insert_credit(fanout, height, ksize, vsize) * nr
    }

    /// Credit for `nr` deletes.
    pub fn delete_credit(&self, nr: u64) -> Credit {
        let state = self.state.read();
        credit::delete_credit(state.fanout, state.height) * nr
    }

    /// Credit for `nr` updates to `vsize`-byte values.
    pub fn update_credit(&self, nr: u64, ksize: u64, vsize: u64) -> Credit {
        credit::update_credit(self.fanout(), ksize, vsize) * nr
    }

    /// Credit for `nr` [`BTree::insert_inplace`] calls, each followed by
    /// [`Anchor::release`] of its write anchor.
    pub fn insert_inplace_credit(&self, nr: u64, ksize: u64, vsize: u64) -> Credit {
        let (fanout, height) = self.growth_bound(nr);
        credit::insert_inplace_credit(fanout, height, ksize, vsize) * nr
    }

    /// Credit for `nr` [`BTree::update_inplace`] calls to `vsize`-byte
    /// values, each followed by [`Anchor::release`].
    pub fn update_inplace_credit(&self, nr: u64, ksize: u64, vsize: u64) -> Credit {
        credit::update_inplace_credit(self.fanout(), ksize, vsize) * nr
    }

    /// Credit for `nr` saves.
    pub fn save_credit(&self, nr: u64, ksize: u64, vsize: u64) -> Credit {
        let (fanout, height) = self.growth_bound(nr);
        credit::save_credit(fanout, height, ksize, vsize) * nr
    }

    /// Credit for one [`BTree::truncate`] call.
    pub fn truncate_credit(&self, limit: u64) -> Credit {
        let state = self.state.read();
        credit::truncate_credit(state.fanout, state.height, limit)
    }

    fn growth_bound(&self, nr: u64) -> (u16, u16) {
        let state = self.state.read();
        let grown = credit::max_height(state.fanout, state.nr_items.saturating_add(nr));
        (state.fanout, state.height.max(grown))
    }

    /// Runs one mutation under the write lock: checks invariants around it,
    /// flushes dirty nodes and rewrites the tree header when it changed.
    fn mutate<'t, T>(
        &'t self,
        state: &mut TreeState,
        tx: Option<&'t Tx>,
        body: impl FnOnce(&mut TreeState, &mut NodeStore<'t>) -> Result<T>,
    ) -> Result<T> {
        let header = state.created()?;
        self.pre_check(state);
        let before = (state.root, state.nr_items);
        let mut store = self.node_store(tx, state.fanout);
        let outcome = body(state, &mut store);
        store.flush();
        if (state.root, state.nr_items) != before {
            self.write_header(tx, header, state);
        }
        if outcome.is_ok() || (state.root, state.nr_items) != before {
            state.generation += 1;
        }
        self.post_check(state);
        outcome
    }

    fn write_header(&self, tx: Option<&Tx>, header: SegAddr, state: &TreeState) {
        let encoded = TreeHeader {
            fanout: state.fanout,
            root: state.root,
            nr_items: state.nr_items,
        };
        {
            let mut pin = self.seg.pin_write();
            encoded.encode(pin.bytes_mut(header, TREE_HDR_LEN));
        }
        if let Some(tx) = tx {
            tx.capture(Region::new(header, TREE_HDR_LEN));
        }
    }

    fn pre_check(&self, state: &TreeState) {
        if self.options.check_invariants {
            intact(self.check_state(state), "btree invariant violated on entry");
        }
    }

    fn post_check(&self, state: &TreeState) {
        if self.options.check_invariants {
            intact(self.check_state(state), "btree invariant violated on exit");
        }
    }

    fn check_state(&self, state: &TreeState) -> Result<()> {
        let Some(header) = state.header else {
            return Ok(());
        };
        let summary = {
            let pin = self.seg.pin_read();
            check_tree(&pin, header, self.ops.as_ref())?
        };
        if summary.height != state.height
            || summary.items != state.nr_items
            || summary.root != state.root
        {
            return Err(StoreError::Corruption("tree handle out of step with segment"));
        }
        Ok(())
    }

    /// Descends from `root` to the node holding `key`.
    pub(crate) fn find(&self, store: &mut NodeStore<'_>, root: SegAddr, key: &[u8]) -> Option<(Node, usize)> {
        let mut addr = root;
        for _ in 0..MAX_HEIGHT {
            let node = store.load(addr);
            match store.search(&node, key) {
                Ok(i) => return Some((node, i)),
                Err(_) if node.leaf => return None,
                Err(i) => addr = node.children[i],
            }
        }
        fatal("btree deeper than its height limit")
    }

    fn extreme_key(&self, min: bool) -> Result<Vec<u8>> {
        let state = self.state.read();
        state.created()?;
        let mut store = self.reader(state.fanout);
        let mut addr = state.root;
        for _ in 0..MAX_HEIGHT {
            let node = store.load(addr);
            if node.leaf {
                let slot = if min { node.slots.first() } else { node.slots.last() };
                return slot.map(|s| store.key_of(s)).ok_or(StoreError::NotFound);
            }
            addr = if min {
                node.children[0]
            } else {
                node.children[node.len()]
            };
        }
        fatal("btree deeper than its height limit")
    }

    fn insert_locked(
        &self,
        state: &mut TreeState,
        store: &mut NodeStore<'_>,
        key: &[u8],
        val: ValSrc<'_>,
    ) -> Result<Slot> {
        if self.find(store, state.root, key).is_some() {
            return Err(StoreError::Exists);
        }
        if store.load(state.root).is_full() && usize::from(state.height) >= MAX_HEIGHT {
            return Err(StoreError::Invalid("tree height limit reached"));
        }
        let slot = store.alloc_kv(key, val)?;
        if let Err(err) = self.insert_slot(state, store, key, slot) {
            store.free_kv(slot)?;
            return Err(err);
        }
        state.nr_items += 1;
        self.stats.inc_inserts();
        tracing::trace!(target: "segstore::btree", kv = %slot.kv, items = state.nr_items, "insert");
        Ok(slot)
    }

    /// Places `slot` in its leaf, splitting every full node met on the way.
    fn insert_slot(
        &self,
        state: &mut TreeState,
        store: &mut NodeStore<'_>,
        key: &[u8],
        slot: Slot,
    ) -> Result<()> {
        let root = store.load(state.root);
        if root.is_full() {
            let mut new_root = store.alloc_node(false, root.level + 1)?;
            new_root.children.push(root.addr);
            if let Err(err) = self.split_child(store, &mut new_root, 0) {
                store.free_node(new_root.addr)?;
                return Err(err);
            }
            state.root = new_root.addr;
            state.height += 1;
            store.store(new_root);
            tracing::debug!(target: "segstore::btree", height = state.height, "root split");
        }

        let mut addr = state.root;
        for _ in 0..MAX_HEIGHT {
            let mut node = store.load(addr);
            let mut i = match store.search(&node, key) {
                Ok(_) => fatal("duplicate key met during insert descent"),
                Err(i) => i,
            };
            if node.leaf {
                node.slots.insert(i, slot);
                store.store(node);
                return Ok(());
            }
            if store.load(node.children[i]).is_full() {
                self.split_child(store, &mut node, i)?;
                if store.compare_slot(key, &node.slots[i]) == Ordering::Greater {
                    i += 1;
                }
                store.store(node.clone());
            }
            addr = node.children[i];
        }
        fatal("btree deeper than its height limit")
    }

    /// Moves the upper half of full child `i` into a new sibling and lifts
    /// the median into `parent`. The caller stores `parent`.
    fn split_child(&self, store: &mut NodeStore<'_>, parent: &mut Node, i: usize) -> Result<()> {
        let t = usize::from(store.fanout());
        let mut child = store.load(parent.children[i]);
        let mut sibling = store.alloc_node(child.leaf, child.level)?;
        sibling.slots.extend(child.slots.drain(t..));
        let Some(median) = child.slots.pop() else {
            fatal("splitting an empty node");
        };
        if !child.leaf {
            sibling.children.extend(child.children.drain(t..));
        }
        parent.slots.insert(i, median);
        parent.children.insert(i + 1, sibling.addr);
        self.stats.inc_split(child.leaf);
        store.store(child);
        store.store(sibling);
        Ok(())
    }

    fn update_locked(
        &self,
        state: &mut TreeState,
        store: &mut NodeStore<'_>,
        key: &[u8],
        val: &[u8],
    ) -> Result<Slot> {
        let Some((mut node, i)) = self.find(store, state.root, key) else {
            return Err(StoreError::NotFound);
        };
        let old = node.slots[i];
        self.stats.inc_updates();
        if old.val_len as usize == val.len() {
            store.write_value(old, val);
            return Ok(old);
        }
        let stored_key = store.key_of(&old);
        let slot = store.alloc_kv(&stored_key, ValSrc::Bytes(val))?;
        node.slots[i] = slot;
        store.store(node);
        store.free_kv(old)?;
        Ok(slot)
    }

    /// Removes the slot named by `target` and returns it; the caller frees
    /// its pair.
    ///
    /// Every child entered holds at least `t` keys, so the final leaf
    /// removal never underflows. A key found in an internal node is replaced
    /// by its predecessor or successor, which is then removed from its leaf.
    fn delete_slot(
        &self,
        state: &mut TreeState,
        store: &mut NodeStore<'_>,
        target: Target<'_>,
    ) -> Result<Slot> {
        let t = usize::from(store.fanout());
        let mut target = target;
        let mut pending: Option<(SegAddr, usize)> = None;
        let mut addr = state.root;
        for _ in 0..=MAX_HEIGHT {
            let mut node = store.load(addr);
            if node.leaf && node.is_empty() {
                return Err(StoreError::NotFound);
            }
            let pos = match target {
                Target::Key(key) => store.search(&node, key),
                Target::Min if node.leaf => Ok(0),
                Target::Min => Err(0),
                Target::Max if node.leaf => Ok(node.len() - 1),
                Target::Max => Err(node.len()),
            };
            if node.leaf {
                let i = pos.map_err(|_| StoreError::NotFound)?;
                let removed = node.slots.remove(i);
                store.store(node);
                let Some((holder, j)) = pending else {
                    return Ok(removed);
                };
                let mut holder = store.load(holder);
                let replaced = std::mem::replace(&mut holder.slots[j], removed);
                store.store(holder);
                return Ok(replaced);
            }
            addr = match pos {
                Ok(i) => {
                    let left = store.load(node.children[i]);
                    let right = store.load(node.children[i + 1]);
                    if left.len() >= t {
                        pending = Some((node.addr, i));
                        target = Target::Max;
                        left.addr
                    } else if right.len() >= t {
                        pending = Some((node.addr, i));
                        target = Target::Min;
                        right.addr
                    } else {
                        self.merge_siblings(state, store, &mut node, i)?
                    }
                }
                Err(i) => self.fill_child(state, store, &mut node, i)?,
            };
        }
        fatal("btree deeper than its height limit")
    }

    /// Makes child `i` of `parent` hold at least `t` keys before the descent
    /// enters it. Returns the node to descend into.
    fn fill_child(
        &self,
        state: &mut TreeState,
        store: &mut NodeStore<'_>,
        parent: &mut Node,
        i: usize,
    ) -> Result<SegAddr> {
        let t = usize::from(store.fanout());
        let mut child = store.load(parent.children[i]);
        if child.len() >= t {
            return Ok(child.addr);
        }
        if parent.is_empty() {
            fatal("internal node without keys");
        }
        if i > 0 {
            let mut left = store.load(parent.children[i - 1]);
            if left.len() >= t {
                let Some(borrowed) = left.slots.pop() else {
                    fatal("rotating from an empty sibling");
                };
                child.slots.insert(0, std::mem::replace(&mut parent.slots[i - 1], borrowed));
                if let (false, Some(moved)) = (child.leaf, left.children.pop()) {
                    child.children.insert(0, moved);
                }
                self.stats.inc_rotations();
                let addr = child.addr;
                store.store(left);
                store.store(child);
                store.store(parent.clone());
                return Ok(addr);
            }
        }
        if i < parent.len() {
            let mut right = store.load(parent.children[i + 1]);
            if right.len() >= t {
                let borrowed = right.slots.remove(0);
                child.slots.push(std::mem::replace(&mut parent.slots[i], borrowed));
                if !child.leaf {
                    child.children.push(right.children.remove(0));
                }
                self.stats.inc_rotations();
                let addr = child.addr;
                store.store(right);
                store.store(child);
                store.store(parent.clone());
                return Ok(addr);
            }
            return self.merge_siblings(state, store, parent, i);
        }
        self.merge_siblings(state, store, parent, i - 1)
    }

    /// Folds child `i + 1` and the separating key into child `i`, frees the
    /// right child and, when that empties the root, makes the merged node
    /// the new root.
    fn merge_siblings(
        &self,
        state: &mut TreeState,
        store: &mut NodeStore<'_>,
        parent: &mut Node,
        i: usize,
    ) -> Result<SegAddr> {
        let mut left = store.load(parent.children[i]);
        let right = store.load(parent.children[i + 1]);
        left.slots.push(parent.slots.remove(i));
        left.slots.extend(right.slots.iter().copied());
        left.children.extend(right.children.iter().copied());
        parent.children.remove(i + 1);
        let merged = left.addr;
        store.store(left);
        store.free_node(right.addr)?;
        self.stats.inc_merges();
        if parent.is_empty() && parent.addr == state.root {
            store.free_node(parent.addr)?;
            state.root = merged;
            state.height -= 1;
            tracing::debug!(target: "segstore::btree", height = state.height, "root collapsed");
        } else {
            store.store(parent.clone());
        }
        Ok(merged)
    }
}

fn value_region(slot: &Slot) -> Region {
    Region::new(slot.val_addr(), u64::from(slot.val_len))
}
