#![forbid(unsafe_code)]
//! Checksums for persisted structures.

use std::ops::Range;

/// Streaming checksum used by on-segment codecs.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 of `buf` with the bytes in `crc_field` treated as zero.
pub fn crc32_with_zeroed(buf: &[u8], crc_field: Range<usize>) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&buf[..crc_field.start]);
    hasher.update(&[0u8; 8][..crc_field.len()]);
    hasher.update(&buf[crc_field.end..]);
    hasher.finalize()
}
