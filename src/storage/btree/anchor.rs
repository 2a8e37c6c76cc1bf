use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::primitives::seg::Segment;
use crate::primitives::tx::{Region, Tx};
use crate::types::{fatal, Result, StoreError};

use super::tree::TreeState;

enum Hold<'a> {
    Read(RwLockReadGuard<'a, TreeState>),
    Write(RwLockWriteGuard<'a, TreeState>),
}

/// Direct access to a value stored in the tree.
///
/// The anchor holds the tree lock for as long as it lives, so the value
/// cannot move underneath it. The segment is pinned only for the duration
/// of each access; other trees and the allocator stay usable meanwhile.
/// A write anchor must be handed back through [`Anchor::release`] so the
/// value bytes are captured; dropping it unreleased is fatal.
pub struct Anchor<'a> {
    _hold: Hold<'a>,
    seg: &'a Segment,
    value: Region,
    writable: bool,
    released: bool,
}

impl<'a> Anchor<'a> {
    pub(crate) fn read(state: RwLockReadGuard<'a, TreeState>, seg: &'a Segment, value: Region) -> Self {
        Self {
            _hold: Hold::Read(state),
            seg,
            value,
            writable: false,
            released: false,
        }
    }

    pub(crate) fn write(state: RwLockWriteGuard<'a, TreeState>, seg: &'a Segment, value: Region) -> Self {
        Self {
            _hold: Hold::Write(state),
            seg,
            value,
            writable: true,
            released: false,
        }
    }

    /// Segment range holding the value.
    pub fn region(&self) -> Region {
        self.value
    }

    /// Value length in bytes.
    pub fn len(&self) -> usize {
        self.value.len as usize
    }

    /// Reports whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.value.len == 0
    }

    /// Reports whether the value may be modified.
    pub fn is_write(&self) -> bool {
        self.writable
    }

    /// Copy of the current value bytes.
    pub fn value(&self) -> Vec<u8> {
        self.with_value(<[u8]>::to_vec)
    }

    /// Runs `f` over the value bytes under a read pin.
    pub fn with_value<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let pin = self.seg.pin_read();
        f(pin.bytes(self.value.addr, self.value.len))
    }

    /// Runs `f` over the value bytes under a write pin; `Invalid` on a read
    /// anchor.
    pub fn with_value_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        if !self.writable {
            return Err(StoreError::Invalid("read anchor is not writable"));
        }
        let mut pin = self.seg.pin_write();
        Ok(f(pin.bytes_mut(self.value.addr, self.value.len)))
    }

    /// Ends the access, capturing the value when it was writable. The
    /// capture consumes `(1, len)` of the transaction credit; the
    /// `*_inplace_credit` methods of [`BTree`](super::BTree) include it.
    pub fn release(mut self, tx: Option<&Tx>) {
        if let (true, Some(tx)) = (self.writable, tx) {
            tx.capture(self.value);
        }
        self.released = true;
    }
}

impl Drop for Anchor<'_> {
    fn drop(&mut self) {
        if self.writable && !self.released && !std::thread::panicking() {
            fatal("write anchor dropped without release");
        }
    }
}
