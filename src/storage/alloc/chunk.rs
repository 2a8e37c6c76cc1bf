//! Chunk header codec.
//!
//! ```text
//! 0..8    magic0
//! 8..16   all-list prev
//! 16..24  all-list next
//! 24..32  free-list prev
//! 32..40  free-list next
//! 40..48  payload size
//! 48      free flag
//! 49..56  reserved (zero)
//! 56..64  magic1
//! ```
//!
//! The payload follows the header directly.

use std::ops::Range;

use crate::types::{read_u64, Result, SegAddr, StoreError};

/// Size of a chunk header in bytes.
pub const CHUNK_HDR_LEN: u64 = 64;
/// Leading guard magic.
pub const CHUNK_MAGIC0: u64 = 0xa110_c8ed_c4a0_0001;
/// Trailing guard magic.
pub const CHUNK_MAGIC1: u64 = 0xa110_c8ed_c4a0_0002;

const MAGIC0: Range<usize> = 0..8;
const ALL_PREV: Range<usize> = 8..16;
const ALL_NEXT: Range<usize> = 16..24;
const FREE_PREV: Range<usize> = 24..32;
const FREE_NEXT: Range<usize> = 32..40;
const SIZE: Range<usize> = 40..48;
const FREE_FLAG: usize = 48;
const RESERVED: Range<usize> = 49..56;
const MAGIC1: Range<usize> = 56..64;

/// Which intrusive list a link pair belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    /// Every chunk, address ordered.
    All,
    /// Free chunks only, address ordered.
    Free,
}

/// Prev/next pointers of one intrusive list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Links {
    /// Previous element.
    pub prev: Option<SegAddr>,
    /// Next element.
    pub next: Option<SegAddr>,
}

/// Decoded chunk header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Location of the header itself (not persisted).
    pub addr: SegAddr,
    /// Links of the all-chunks list.
    pub all: Links,
    /// Links of the free-chunks list; unused while the chunk is allocated.
    pub free_links: Links,
    /// Payload size in bytes.
    pub size: u64,
    /// Whether the chunk is free.
    pub free: bool,
}

impl ChunkHeader {
    /// Builds an unlinked header.
    pub fn new(addr: SegAddr, size: u64, free: bool) -> Self {
        Self {
            addr,
            all: Links::default(),
            free_links: Links::default(),
            size,
            free,
        }
    }

    /// Links for `kind`.
    pub fn links(&self, kind: ListKind) -> Links {
        match kind {
            ListKind::All => self.all,
            ListKind::Free => self.free_links,
        }
    }

    /// Mutable links for `kind`.
    pub fn links_mut(&mut self, kind: ListKind) -> &mut Links {
        match kind {
            ListKind::All => &mut self.all,
            ListKind::Free => &mut self.free_links,
        }
    }

    /// First payload byte.
    pub fn payload(&self) -> SegAddr {
        self.addr.offset(CHUNK_HDR_LEN)
    }

    /// One past the last payload byte.
    pub fn end(&self) -> u64 {
        self.addr.get() + CHUNK_HDR_LEN + self.size
    }

    /// Decodes the header stored at `addr`.
    pub fn decode(addr: SegAddr, buf: &[u8]) -> Result<Self> {
        if buf.len() < CHUNK_HDR_LEN as usize {
            return Err(StoreError::Corruption("chunk header truncated"));
        }
        if read_u64(buf, MAGIC0) != CHUNK_MAGIC0 {
            return Err(StoreError::Corruption("chunk magic0 mismatch"));
        }
        if read_u64(buf, MAGIC1) != CHUNK_MAGIC1 {
            return Err(StoreError::Corruption("chunk magic1 mismatch"));
        }
        let free = match buf[FREE_FLAG] {
            0 => false,
            1 => true,
            _ => return Err(StoreError::Corruption("chunk free flag out of range")),
        };
        if buf[RESERVED].iter().any(|b| *b != 0) {
            return Err(StoreError::Corruption("chunk reserved bytes not zero"));
        }
        Ok(Self {
            addr,
            all: Links {
                prev: SegAddr::from_raw(read_u64(buf, ALL_PREV)),
                next: SegAddr::from_raw(read_u64(buf, ALL_NEXT)),
            },
            free_links: Links {
                prev: SegAddr::from_raw(read_u64(buf, FREE_PREV)),
                next: SegAddr::from_raw(read_u64(buf, FREE_NEXT)),
            },
            size: read_u64(buf, SIZE),
            free,
        })
    }

    /// Encodes the header into `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[MAGIC0].copy_from_slice(&CHUNK_MAGIC0.to_be_bytes());
        buf[ALL_PREV].copy_from_slice(&SegAddr::to_raw(self.all.prev).to_be_bytes());
        buf[ALL_NEXT].copy_from_slice(&SegAddr::to_raw(self.all.next).to_be_bytes());
        buf[FREE_PREV].copy_from_slice(&SegAddr::to_raw(self.free_links.prev).to_be_bytes());
        buf[FREE_NEXT].copy_from_slice(&SegAddr::to_raw(self.free_links.next).to_be_bytes());
        buf[SIZE].copy_from_slice(&self.size.to_be_bytes());
        buf[FREE_FLAG] = u8::from(self.free);
        buf[RESERVED].fill(0);
        buf[MAGIC1].copy_from_slice(&CHUNK_MAGIC1.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_codec_preserves_links() -> Result<()> {
        let mut header = ChunkHeader::new(SegAddr(576), 128, true);
        header.all.prev = Some(SegAddr(512));
        header.free_links.next = Some(SegAddr(4096));
        let mut buf = [0u8; CHUNK_HDR_LEN as usize];
        header.encode(&mut buf);
        let decoded = ChunkHeader::decode(SegAddr(576), &buf)?;
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload(), SegAddr(640));
        assert_eq!(decoded.end(), 768);
        Ok(())
    }

    #[test]
    fn damaged_guards_are_rejected() {
        let header = ChunkHeader::new(SegAddr(512), 8, false);
        let mut buf = [0u8; CHUNK_HDR_LEN as usize];
        header.encode(&mut buf);

        let mut bad_tail = buf;
        bad_tail[60] ^= 0xff;
        assert!(matches!(
            ChunkHeader::decode(SegAddr(512), &bad_tail),
            Err(StoreError::Corruption("chunk magic1 mismatch"))
        ));

        let mut bad_flag = buf;
        bad_flag[FREE_FLAG] = 7;
        assert!(ChunkHeader::decode(SegAddr(512), &bad_flag).is_err());

        assert!(ChunkHeader::decode(SegAddr(512), &[0u8; 64]).is_err());
    }
}
