#![forbid(unsafe_code)]
//! Fixed-size addressable segment with pin-for-read/pin-for-write access.
//!
//! The segment header occupies the first [`SEG_HDR_LEN`] bytes. It records
//! the format magic, the segment size, the dictionary root slot and embeds
//! the allocator header at [`SEG_HDR_ALLOC`]. Everything after the header is
//! allocator space.

use std::ops::Range;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::primitives::tx::{Region, Tx};
use crate::types::{fatal, read_u32, read_u64, Result, SegAddr, StoreError};

/// Magic stored at offset zero of every formatted segment.
pub const SEG_MAGIC: u64 = 0x5345_4753_544f_5245;
/// Segment header format version.
pub const SEG_VERSION: u32 = 1;
/// Length of the segment header; allocator space starts here.
pub const SEG_HDR_LEN: usize = 512;
/// Smallest segment accepted by [`Segment::new`].
pub const SEG_MIN_SIZE: u64 = 4096;

const SEG_HDR_MAGIC: Range<usize> = 0..8;
const SEG_HDR_VERSION: Range<usize> = 8..12;
const SEG_HDR_RESERVED0: Range<usize> = 12..16;
const SEG_HDR_SIZE: Range<usize> = 16..24;
/// Slot holding the segment dictionary tree header address.
pub const SEG_HDR_DICT_ROOT: Range<usize> = 24..32;
/// Area reserved for the embedded allocator header.
pub const SEG_HDR_ALLOC: Range<usize> = 64..320;

/// Decoded segment header fields outside the allocator area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegHeader {
    /// Format version.
    pub version: u32,
    /// Total segment size in bytes.
    pub size: u64,
    /// Dictionary tree header, if one was created.
    pub dict_root: Option<SegAddr>,
}

impl SegHeader {
    /// Decodes the header from the first [`SEG_HDR_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SEG_HDR_LEN {
            return Err(StoreError::Corruption("segment header truncated"));
        }
        if read_u64(buf, SEG_HDR_MAGIC) != SEG_MAGIC {
            return Err(StoreError::Corruption("segment magic mismatch"));
        }
        let version = read_u32(buf, SEG_HDR_VERSION);
        if version != SEG_VERSION {
            return Err(StoreError::Corruption("unsupported segment version"));
        }
        if buf[SEG_HDR_RESERVED0].iter().any(|b| *b != 0) {
            return Err(StoreError::Corruption("segment header reserved bytes not zero"));
        }
        Ok(Self {
            version,
            size: read_u64(buf, SEG_HDR_SIZE),
            dict_root: SegAddr::from_raw(read_u64(buf, SEG_HDR_DICT_ROOT)),
        })
    }

    /// Encodes the header into `buf`, leaving the allocator area untouched.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[SEG_HDR_MAGIC].copy_from_slice(&SEG_MAGIC.to_be_bytes());
        buf[SEG_HDR_VERSION].copy_from_slice(&self.version.to_be_bytes());
        buf[SEG_HDR_RESERVED0].fill(0);
        buf[SEG_HDR_SIZE].copy_from_slice(&self.size.to_be_bytes());
        buf[SEG_HDR_DICT_ROOT].copy_from_slice(&SegAddr::to_raw(self.dict_root).to_be_bytes());
    }
}

/// Flat in-memory segment.
pub struct Segment {
    size: u64,
    mem: RwLock<Box<[u8]>>,
}

impl Segment {
    /// Creates a zero-filled segment of `size` bytes without a header.
    pub fn new(size: u64) -> Result<Self> {
        if size < SEG_MIN_SIZE {
            return Err(StoreError::Invalid("segment smaller than minimum size"));
        }
        if size % 8 != 0 {
            return Err(StoreError::Invalid("segment size must be a multiple of 8"));
        }
        let len = usize::try_from(size)
            .map_err(|_| StoreError::Invalid("segment size exceeds address space"))?;
        Ok(Self {
            size,
            mem: RwLock::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    /// Creates a segment and writes a fresh header.
    pub fn format(size: u64) -> Result<Self> {
        let seg = Self::new(size)?;
        {
            let mut pin = seg.pin_write();
            let header = SegHeader {
                version: SEG_VERSION,
                size,
                dict_root: None,
            };
            header.encode(pin.bytes_mut(SegAddr(0), SEG_HDR_LEN as u64));
        }
        tracing::debug!(target: "segstore::seg", size, "formatted segment");
        Ok(seg)
    }

    /// Rebuilds a segment from a previously saved image.
    pub fn from_image(image: Vec<u8>) -> Result<Self> {
        let header = SegHeader::decode(&image)?;
        if header.size != image.len() as u64 {
            return Err(StoreError::Corruption("segment size does not match image length"));
        }
        Ok(Self {
            size: header.size,
            mem: RwLock::new(image.into_boxed_slice()),
        })
    }

    /// Copies the current segment contents.
    pub fn to_image(&self) -> Vec<u8> {
        self.mem.read().to_vec()
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reports whether `[addr, addr + len)` lies inside the segment.
    pub fn contains(&self, addr: SegAddr, len: u64) -> bool {
        addr.get()
            .checked_add(len)
            .map(|end| end <= self.size)
            .unwrap_or(false)
    }

    /// Pins the segment for reading.
    pub fn pin_read(&self) -> SegRead<'_> {
        SegRead {
            mem: self.mem.read(),
        }
    }

    /// Pins the segment for writing.
    pub fn pin_write(&self) -> SegWrite<'_> {
        SegWrite {
            mem: self.mem.write(),
        }
    }

    /// Decodes the segment header.
    pub fn header(&self) -> Result<SegHeader> {
        let pin = self.pin_read();
        SegHeader::decode(pin.bytes(SegAddr(0), SEG_HDR_LEN as u64))
    }

    /// Region covering the dictionary root slot.
    pub fn dict_root_region() -> Region {
        Region::new(
            SegAddr(SEG_HDR_DICT_ROOT.start as u64),
            SEG_HDR_DICT_ROOT.len() as u64,
        )
    }

    /// Updates the dictionary root slot and captures it.
    pub fn set_dict_root(&self, tx: Option<&Tx>, root: Option<SegAddr>) {
        let region = Self::dict_root_region();
        {
            let mut pin = self.pin_write();
            pin.write_u64(region.addr, SegAddr::to_raw(root));
        }
        if let Some(tx) = tx {
            tx.capture(region);
        }
    }
}

fn span(size: usize, addr: SegAddr, len: u64) -> Range<usize> {
    let start = addr.get() as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= size => start..end,
        _ => fatal("segment access out of bounds"),
    }
}

/// Byte access shared by both pin flavours.
pub trait SegBytes {
    /// Borrows `len` bytes at `addr`.
    fn bytes_at(&self, addr: SegAddr, len: u64) -> &[u8];

    /// Size of the pinned segment.
    fn seg_len(&self) -> u64;

    /// Reports whether `[addr, addr + len)` lies inside the pinned segment.
    fn spans(&self, addr: SegAddr, len: u64) -> bool {
        addr.get()
            .checked_add(len)
            .map(|end| end <= self.seg_len())
            .unwrap_or(false)
    }
}

impl SegBytes for SegRead<'_> {
    fn bytes_at(&self, addr: SegAddr, len: u64) -> &[u8] {
        self.bytes(addr, len)
    }

    fn seg_len(&self) -> u64 {
        self.mem.len() as u64
    }
}

impl SegBytes for SegWrite<'_> {
    fn bytes_at(&self, addr: SegAddr, len: u64) -> &[u8] {
        self.bytes(addr, len)
    }

    fn seg_len(&self) -> u64 {
        self.mem.len() as u64
    }
}

/// Read pin over the segment.
pub struct SegRead<'a> {
    mem: RwLockReadGuard<'a, Box<[u8]>>,
}

impl<'a> SegRead<'a> {
    /// Borrows `len` bytes at `addr`.
    pub fn bytes(&self, addr: SegAddr, len: u64) -> &[u8] {
        &self.mem[span(self.mem.len(), addr, len)]
    }

    /// Reads a big-endian `u64` at `addr`.
    pub fn read_u64(&self, addr: SegAddr) -> u64 {
        read_u64(self.bytes(addr, 8), 0..8)
    }
}

/// Write pin over the segment.
pub struct SegWrite<'a> {
    mem: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl<'a> SegWrite<'a> {
    /// Borrows `len` bytes at `addr`.
    pub fn bytes(&self, addr: SegAddr, len: u64) -> &[u8] {
        &self.mem[span(self.mem.len(), addr, len)]
    }

    /// Mutably borrows `len` bytes at `addr`.
    pub fn bytes_mut(&mut self, addr: SegAddr, len: u64) -> &mut [u8] {
        let range = span(self.mem.len(), addr, len);
        &mut self.mem[range]
    }

    /// Copies `data` to `addr`.
    pub fn write(&mut self, addr: SegAddr, data: &[u8]) {
        self.bytes_mut(addr, data.len() as u64).copy_from_slice(data);
    }

    /// Reads a big-endian `u64` at `addr`.
    pub fn read_u64(&self, addr: SegAddr) -> u64 {
        read_u64(self.bytes(addr, 8), 0..8)
    }

    /// Writes a big-endian `u64` at `addr`.
    pub fn write_u64(&mut self, addr: SegAddr, value: u64) {
        self.write(addr, &value.to_be_bytes());
    }

    /// Zeroes `len` bytes at `addr`.
    pub fn zero(&mut self, addr: SegAddr, len: u64) {
        self.bytes_mut(addr, len).fill(0);
    }
}
