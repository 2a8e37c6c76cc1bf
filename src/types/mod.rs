#![forbid(unsafe_code)]
//! Shared address, field codec and checksum primitives.

use std::fmt;

pub mod checksum;

pub(crate) use crate::error::intact;
pub use crate::error::{fatal, Result, StoreError};

/// Byte offset of an object inside its segment.
///
/// Offset zero is occupied by the segment header, so it doubles as the
/// null encoding for optional addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegAddr(pub u64);

impl SegAddr {
    /// Returns the raw offset.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns the address `delta` bytes further into the segment.
    pub fn offset(self, delta: u64) -> SegAddr {
        SegAddr(self.0 + delta)
    }

    /// Decodes an optional address where zero means `None`.
    pub fn from_raw(raw: u64) -> Option<SegAddr> {
        if raw == 0 {
            None
        } else {
            Some(SegAddr(raw))
        }
    }

    /// Encodes an optional address where `None` becomes zero.
    pub fn to_raw(addr: Option<SegAddr>) -> u64 {
        addr.map(SegAddr::get).unwrap_or(0)
    }
}

impl fmt::Display for SegAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Rounds `value` up to a multiple of `1 << shift`.
pub fn align_up(value: u64, shift: u32) -> u64 {
    let mask = (1u64 << shift) - 1;
    (value + mask) & !mask
}

/// Reports whether `value` is a multiple of `1 << shift`.
pub fn is_aligned(value: u64, shift: u32) -> bool {
    value & ((1u64 << shift) - 1) == 0
}

pub(crate) fn read_u64(buf: &[u8], range: std::ops::Range<usize>) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[range]);
    u64::from_be_bytes(raw)
}

pub(crate) fn read_u32(buf: &[u8], range: std::ops::Range<usize>) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[range]);
    u32::from_be_bytes(raw)
}

pub(crate) fn read_u16(buf: &[u8], range: std::ops::Range<usize>) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[range]);
    u16::from_be_bytes(raw)
}
