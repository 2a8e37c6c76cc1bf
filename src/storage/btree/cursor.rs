use std::cmp::Ordering;

use crate::primitives::op::Op;
use crate::types::{fatal, Result, SegAddr, StoreError};

use super::store::NodeStore;
use super::tree::TreeState;
use super::{BTree, MAX_HEIGHT};

#[derive(Clone, Copy, Debug)]
struct Frame {
    node: SegAddr,
    /// Child entered on ancestors, slot on the top frame.
    idx: usize,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            node: SegAddr(0),
            idx: 0,
        }
    }
}

/// Ordered iteration over a [`BTree`].
///
/// The cursor records the path from the root to its current slot in a
/// fixed stack and keeps a copy of the current pair. Every call takes the
/// tree lock for its own duration only; when a mutation slipped in between
/// two calls, the next step re-seeks from the saved key.
pub struct Cursor<'a> {
    tree: &'a BTree,
    stack: [Frame; MAX_HEIGHT],
    depth: usize,
    current: Option<(Vec<u8>, Vec<u8>)>,
    generation: u64,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tree: &'a BTree) -> Self {
        Self {
            tree,
            stack: [Frame::default(); MAX_HEIGHT],
            depth: 0,
            current: None,
            generation: 0,
        }
    }

    /// Positions on `key`. Without `slant` a missing key is `NotFound`; with
    /// it the cursor lands on the smallest key above `key`.
    pub fn get(&mut self, key: &[u8], slant: bool) -> Op<()> {
        Op::run("btree.cursor.get", || {
            let tree = self.tree;
            let key = tree.key_bytes(key)?.to_vec();
            let state = tree.read_state();
            state.created()?;
            let mut store = tree.reader(state.fanout);
            let outcome = self.seek(&mut store, state.root, &key, slant);
            self.finish(&state, outcome)
        })
    }

    /// Positions on the smallest key.
    pub fn first(&mut self) -> Op<()> {
        Op::run("btree.cursor.first", || self.edge(true))
    }

    /// Positions on the largest key.
    pub fn last(&mut self) -> Op<()> {
        Op::run("btree.cursor.last", || self.edge(false))
    }

    /// Moves to the next key; `NotFound` past the end.
    pub fn next(&mut self) -> Op<()> {
        Op::run("btree.cursor.next", || {
            let tree = self.tree;
            let state = tree.read_state();
            state.created()?;
            let Some((key, _)) = self.current.clone() else {
                return Err(StoreError::Invalid("cursor is not positioned"));
            };
            let mut store = tree.reader(state.fanout);
            let outcome = if self.generation == state.generation {
                self.step_next(&mut store)
            } else {
                match self.seek(&mut store, state.root, &key, true) {
                    Ok(()) if self.at_key(&key) => self.step_next(&mut store),
                    other => other,
                }
            };
            self.finish(&state, outcome)
        })
    }

    /// Moves to the previous key; `NotFound` before the start.
    pub fn prev(&mut self) -> Op<()> {
        Op::run("btree.cursor.prev", || {
            let tree = self.tree;
            let state = tree.read_state();
            state.created()?;
            let Some((key, _)) = self.current.clone() else {
                return Err(StoreError::Invalid("cursor is not positioned"));
            };
            let mut store = tree.reader(state.fanout);
            let outcome = if self.generation == state.generation {
                self.step_prev(&mut store)
            } else {
                match self.seek(&mut store, state.root, &key, true) {
                    Ok(()) => self.step_prev(&mut store),
                    Err(StoreError::NotFound) => {
                        self.depth = 0;
                        self.descend(&mut store, state.root, false)
                    }
                    Err(err) => Err(err),
                }
            };
            self.finish(&state, outcome)
        })
    }

    /// Current key and value, when positioned.
    pub fn kv_get(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(key, val)| (key.as_slice(), val.as_slice()))
    }

    /// Current key, when positioned.
    pub fn key(&self) -> Option<&[u8]> {
        self.kv_get().map(|(key, _)| key)
    }

    /// Current value, when positioned.
    pub fn value(&self) -> Option<&[u8]> {
        self.kv_get().map(|(_, val)| val)
    }

    /// Drops the current position.
    pub fn put(&mut self) {
        self.depth = 0;
        self.current = None;
    }

    /// Releases the cursor.
    pub fn fini(self) {}

    fn edge(&mut self, leftmost: bool) -> Result<()> {
        let tree = self.tree;
        let state = tree.read_state();
        state.created()?;
        let mut store = tree.reader(state.fanout);
        self.depth = 0;
        let outcome = self.descend(&mut store, state.root, leftmost);
        self.finish(&state, outcome)
    }

    fn finish(&mut self, state: &TreeState, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => self.generation = state.generation,
            Err(_) => self.put(),
        }
        outcome
    }

    fn at_key(&self, key: &[u8]) -> bool {
        self.key()
            .is_some_and(|cur| self.tree.kv_ops().compare(cur, key) == Ordering::Equal)
    }

    fn push(&mut self, node: SegAddr, idx: usize) {
        if self.depth == MAX_HEIGHT {
            fatal("cursor path deeper than the height limit");
        }
        self.stack[self.depth] = Frame { node, idx };
        self.depth += 1;
    }

    fn top(&mut self) -> &mut Frame {
        &mut self.stack[self.depth - 1]
    }

    /// Copies the pair under the top frame.
    fn settle(&mut self, store: &mut NodeStore<'_>) -> Result<()> {
        let frame = *self.top();
        let node = store.load(frame.node);
        let slot = node.slots[frame.idx];
        self.current = Some((store.key_of(&slot), store.value_of(&slot)));
        Ok(())
    }

    fn seek(&mut self, store: &mut NodeStore<'_>, root: SegAddr, key: &[u8], slant: bool) -> Result<()> {
        self.depth = 0;
        let mut addr = root;
        loop {
            let node = store.load(addr);
            match store.search(&node, key) {
                Ok(i) => {
                    self.push(addr, i);
                    return self.settle(store);
                }
                Err(i) if node.leaf => {
                    self.push(addr, i);
                    if !slant {
                        return Err(StoreError::NotFound);
                    }
                    if i < node.len() {
                        return self.settle(store);
                    }
                    return self.climb_next(store);
                }
                Err(i) => {
                    self.push(addr, i);
                    addr = node.children[i];
                }
            }
        }
    }

    /// Walks down from `addr` to the leftmost or rightmost pair.
    fn descend(&mut self, store: &mut NodeStore<'_>, addr: SegAddr, leftmost: bool) -> Result<()> {
        let mut addr = addr;
        loop {
            let node = store.load(addr);
            if node.leaf {
                if node.is_empty() {
                    return Err(StoreError::NotFound);
                }
                self.push(addr, if leftmost { 0 } else { node.len() - 1 });
                return self.settle(store);
            }
            let idx = if leftmost { 0 } else { node.len() };
            self.push(addr, idx);
            addr = node.children[idx];
        }
    }

    fn step_next(&mut self, store: &mut NodeStore<'_>) -> Result<()> {
        let frame = *self.top();
        let node = store.load(frame.node);
        if !node.leaf {
            self.top().idx += 1;
            return self.descend(store, node.children[frame.idx + 1], true);
        }
        if frame.idx + 1 < node.len() {
            self.top().idx += 1;
            return self.settle(store);
        }
        self.climb_next(store)
    }

    fn step_prev(&mut self, store: &mut NodeStore<'_>) -> Result<()> {
        let frame = *self.top();
        let node = store.load(frame.node);
        if !node.leaf {
            return self.descend(store, node.children[frame.idx], false);
        }
        if frame.idx > 0 {
            self.top().idx -= 1;
            return self.settle(store);
        }
        self.climb_prev(store)
    }

    /// Pops finished frames until an ancestor has a slot right of the
    /// child it was entered through.
    fn climb_next(&mut self, store: &mut NodeStore<'_>) -> Result<()> {
        loop {
            self.depth -= 1;
            if self.depth == 0 {
                return Err(StoreError::NotFound);
            }
            let frame = *self.top();
            if frame.idx < store.load(frame.node).len() {
                return self.settle(store);
            }
        }
    }

    fn climb_prev(&mut self, store: &mut NodeStore<'_>) -> Result<()> {
        loop {
            self.depth -= 1;
            if self.depth == 0 {
                return Err(StoreError::NotFound);
            }
            if self.top().idx > 0 {
                self.top().idx -= 1;
                return self.settle(store);
            }
        }
    }
}
