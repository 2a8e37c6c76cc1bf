//! Allocator header embedded in the segment header.

use std::ops::Range;

use super::chunk::ListKind;
use super::stats::{CallStats, CALL_STATS_LEN};
use crate::primitives::seg::SEG_HDR_ALLOC;
use crate::types::{read_u64, Result, SegAddr, StoreError};

/// Magic marking a created allocator.
pub const ALLOC_MAGIC: u64 = 0xa110_c8ed_4ead_0001;
/// Length of the encoded allocator header.
pub const ALLOC_HDR_LEN: u64 = (SEG_HDR_ALLOC.end - SEG_HDR_ALLOC.start) as u64;

const MAGIC: Range<usize> = 0..8;
const SPACE_ADDR: Range<usize> = 8..16;
const SPACE_SIZE: Range<usize> = 16..24;
const ALL_HEAD: Range<usize> = 24..32;
const ALL_TAIL: Range<usize> = 32..40;
const FREE_HEAD: Range<usize> = 40..48;
const FREE_TAIL: Range<usize> = 48..56;
const CHUNKS_NR: Range<usize> = 56..64;
const FREE_CHUNKS_NR: Range<usize> = 64..72;
const USED: Range<usize> = 72..80;
const FREE: Range<usize> = 80..88;
const LOST: Range<usize> = 88..96;
const STATS_TOTAL: usize = 96;
const STATS_SMALL: usize = STATS_TOTAL + CALL_STATS_LEN;
const STATS_LARGE: usize = STATS_SMALL + CALL_STATS_LEN;
const RESERVED: Range<usize> = STATS_LARGE + CALL_STATS_LEN..ALLOC_HDR_LEN as usize;

/// Head and tail of one address-ordered list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListHead {
    /// Lowest-addressed element.
    pub head: Option<SegAddr>,
    /// Highest-addressed element.
    pub tail: Option<SegAddr>,
}

/// Decoded allocator header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocHeader {
    /// First byte of allocator space.
    pub space_addr: SegAddr,
    /// Size of allocator space.
    pub space_size: u64,
    /// All-chunks list.
    pub all: ListHead,
    /// Free-chunks list.
    pub free_list: ListHead,
    /// Number of chunks.
    pub chunks_nr: u64,
    /// Number of free chunks.
    pub free_chunks_nr: u64,
    /// Payload bytes in allocated chunks.
    pub used: u64,
    /// Payload bytes in free chunks.
    pub free: u64,
    /// Unusable bytes before the first chunk.
    pub lost: u64,
    /// Counters over every call.
    pub total: CallStats,
    /// Counters over calls at or below the stats boundary.
    pub small: CallStats,
    /// Counters over calls above the stats boundary.
    pub large: CallStats,
}

impl AllocHeader {
    /// Header for an allocator over `[space_addr, space_addr + space_size)` with no chunks yet.
    pub fn new(space_addr: SegAddr, space_size: u64) -> Self {
        Self {
            space_addr,
            space_size,
            all: ListHead::default(),
            free_list: ListHead::default(),
            chunks_nr: 0,
            free_chunks_nr: 0,
            used: 0,
            free: 0,
            lost: space_size,
            total: CallStats::default(),
            small: CallStats::default(),
            large: CallStats::default(),
        }
    }

    /// One past the last byte of allocator space.
    pub fn space_end(&self) -> u64 {
        self.space_addr.get() + self.space_size
    }

    /// List head for `kind`.
    pub fn list(&self, kind: ListKind) -> ListHead {
        match kind {
            ListKind::All => self.all,
            ListKind::Free => self.free_list,
        }
    }

    /// Mutable list head for `kind`.
    pub fn list_mut(&mut self, kind: ListKind) -> &mut ListHead {
        match kind {
            ListKind::All => &mut self.all,
            ListKind::Free => &mut self.free_list,
        }
    }

    /// Reports whether `buf` carries a created allocator.
    pub fn is_created(buf: &[u8]) -> bool {
        buf.len() >= ALLOC_HDR_LEN as usize && read_u64(buf, MAGIC) == ALLOC_MAGIC
    }

    /// Decodes a created allocator header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ALLOC_HDR_LEN as usize {
            return Err(StoreError::Corruption("allocator header truncated"));
        }
        if read_u64(buf, MAGIC) != ALLOC_MAGIC {
            return Err(StoreError::Corruption("allocator magic mismatch"));
        }
        if buf[RESERVED].iter().any(|b| *b != 0) {
            return Err(StoreError::Corruption("allocator reserved bytes not zero"));
        }
        let space_addr = SegAddr(read_u64(buf, SPACE_ADDR));
        let space_size = read_u64(buf, SPACE_SIZE);
        if space_addr.get().checked_add(space_size).is_none() {
            return Err(StoreError::Corruption("allocator space overflows"));
        }
        Ok(Self {
            space_addr,
            space_size,
            all: ListHead {
                head: SegAddr::from_raw(read_u64(buf, ALL_HEAD)),
                tail: SegAddr::from_raw(read_u64(buf, ALL_TAIL)),
            },
            free_list: ListHead {
                head: SegAddr::from_raw(read_u64(buf, FREE_HEAD)),
                tail: SegAddr::from_raw(read_u64(buf, FREE_TAIL)),
            },
            chunks_nr: read_u64(buf, CHUNKS_NR),
            free_chunks_nr: read_u64(buf, FREE_CHUNKS_NR),
            used: read_u64(buf, USED),
            free: read_u64(buf, FREE),
            lost: read_u64(buf, LOST),
            total: CallStats::decode(&buf[STATS_TOTAL..STATS_SMALL]),
            small: CallStats::decode(&buf[STATS_SMALL..STATS_LARGE]),
            large: CallStats::decode(&buf[STATS_LARGE..RESERVED.start]),
        })
    }

    /// Encodes the header into `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        let words = [
            (MAGIC, ALLOC_MAGIC),
            (SPACE_ADDR, self.space_addr.get()),
            (SPACE_SIZE, self.space_size),
            (ALL_HEAD, SegAddr::to_raw(self.all.head)),
            (ALL_TAIL, SegAddr::to_raw(self.all.tail)),
            (FREE_HEAD, SegAddr::to_raw(self.free_list.head)),
            (FREE_TAIL, SegAddr::to_raw(self.free_list.tail)),
            (CHUNKS_NR, self.chunks_nr),
            (FREE_CHUNKS_NR, self.free_chunks_nr),
            (USED, self.used),
            (FREE, self.free),
            (LOST, self.lost),
        ];
        for (range, value) in words {
            buf[range].copy_from_slice(&value.to_be_bytes());
        }
        self.total.encode(&mut buf[STATS_TOTAL..STATS_SMALL]);
        self.small.encode(&mut buf[STATS_SMALL..STATS_LARGE]);
        self.large.encode(&mut buf[STATS_LARGE..RESERVED.start]);
        buf[RESERVED].fill(0);
    }
}
