use serde::Serialize;

use crate::types::read_u64;

/// Per-size-class call counters persisted in the allocator header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    /// Successful allocations.
    pub alloc_nr: u64,
    /// Bytes handed out by successful allocations.
    pub alloc_size: u64,
    /// Failed allocations.
    pub fail_nr: u64,
    /// Bytes requested by failed allocations.
    pub fail_size: u64,
    /// Frees.
    pub free_nr: u64,
    /// Bytes returned by frees.
    pub free_size: u64,
}

pub(crate) const CALL_STATS_LEN: usize = 48;

impl CallStats {
    pub(crate) fn record_alloc(&mut self, size: u64) {
        self.alloc_nr += 1;
        self.alloc_size += size;
    }

    pub(crate) fn record_failure(&mut self, size: u64) {
        self.fail_nr += 1;
        self.fail_size += size;
    }

    pub(crate) fn record_free(&mut self, size: u64) {
        self.free_nr += 1;
        self.free_size += size;
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        Self {
            alloc_nr: read_u64(buf, 0..8),
            alloc_size: read_u64(buf, 8..16),
            fail_nr: read_u64(buf, 16..24),
            fail_size: read_u64(buf, 24..32),
            free_nr: read_u64(buf, 32..40),
            free_size: read_u64(buf, 40..48),
        }
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        let fields = [
            self.alloc_nr,
            self.alloc_size,
            self.fail_nr,
            self.fail_size,
            self.free_nr,
            self.free_size,
        ];
        for (slot, value) in buf[..CALL_STATS_LEN].chunks_exact_mut(8).zip(fields) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
    }
}

/// Point-in-time view of allocator space usage and call counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct AllocatorStats {
    /// Bytes managed by the allocator.
    pub space_size: u64,
    /// Header bytes charged to every chunk.
    pub chunk_overhead: u64,
    /// Number of chunks.
    pub chunks_nr: u64,
    /// Number of free chunks.
    pub free_chunks_nr: u64,
    /// Payload bytes in allocated chunks.
    pub used: u64,
    /// Payload bytes in free chunks.
    pub free: u64,
    /// Bytes before the first chunk that are too small to host a header.
    pub lost: u64,
    /// Size that separates the small and large call classes.
    pub stats_boundary: u64,
    /// Every call.
    pub total: CallStats,
    /// Calls with `size <= stats_boundary`.
    pub small: CallStats,
    /// Calls with `size > stats_boundary`.
    pub large: CallStats,
}

impl AllocatorStats {
    /// Header bytes plus lost prefix.
    pub fn overhead(&self) -> u64 {
        self.chunks_nr * self.chunk_overhead + self.lost
    }

    /// Emits the snapshot to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        tracing::info!(
            target: "segstore::alloc::stats",
            space_size = self.space_size,
            chunks = self.chunks_nr,
            free_chunks = self.free_chunks_nr,
            used = self.used,
            free = self.free,
            lost = self.lost,
            alloc_nr = self.total.alloc_nr,
            alloc_size = self.total.alloc_size,
            fail_nr = self.total.fail_nr,
            free_nr = self.total.free_nr,
            small_alloc_nr = self.small.alloc_nr,
            large_alloc_nr = self.large.alloc_nr,
            "allocator stats snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_stats_codec() {
        let mut stats = CallStats::default();
        stats.record_alloc(64);
        stats.record_alloc(8);
        stats.record_failure(1 << 20);
        stats.record_free(64);
        let mut buf = [0u8; CALL_STATS_LEN];
        stats.encode(&mut buf);
        let decoded = CallStats::decode(&buf);
        assert_eq!(decoded, stats);
        assert_eq!(decoded.alloc_nr, 2);
        assert_eq!(decoded.alloc_size, 72);
    }
}
