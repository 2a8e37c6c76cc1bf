use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::types::SegAddr;

/// Contiguous byte range inside a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// First byte.
    pub addr: SegAddr,
    /// Length in bytes.
    pub len: u64,
}

impl Region {
    /// Builds a region.
    pub const fn new(addr: SegAddr, len: u64) -> Self {
        Self { addr, len }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.addr.get() + self.len
    }
}

/// Address-ordered set of captured ranges; overlapping or touching
/// ranges coalesce on insert.
#[derive(Default, Debug, Clone)]
pub struct RegionMap {
    spans: BTreeMap<u64, u64>,
}

impl RegionMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `region`, merging it with every span it overlaps or touches.
    pub fn insert(&mut self, region: Region) {
        if region.len == 0 {
            return;
        }
        let mut start = region.addr.get();
        let mut end = region.end();
        let absorbed: SmallVec<[u64; 4]> = self
            .spans
            .range(..=end)
            .rev()
            .take_while(|(_, span_end)| **span_end >= start)
            .map(|(span_start, _)| *span_start)
            .collect();
        for span_start in absorbed {
            if let Some(span_end) = self.spans.remove(&span_start) {
                start = start.min(span_start);
                end = end.max(span_end);
            }
        }
        self.spans.insert(start, end);
    }

    /// Number of disjoint spans.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Reports whether nothing was inserted.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Sum of span lengths.
    pub fn total_bytes(&self) -> u64 {
        self.spans.iter().map(|(start, end)| end - start).sum()
    }

    /// Reports whether `region` is wholly covered by one span.
    pub fn covers(&self, region: Region) -> bool {
        if region.len == 0 {
            return true;
        }
        self.spans
            .range(..=region.addr.get())
            .next_back()
            .map(|(_, end)| *end >= region.end())
            .unwrap_or(false)
    }

    /// Iterates spans in address order.
    pub fn iter(&self) -> impl Iterator<Item = Region> + '_ {
        self.spans
            .iter()
            .map(|(start, end)| Region::new(SegAddr(*start), end - start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(addr: u64, len: u64) -> Region {
        Region::new(SegAddr(addr), len)
    }

    #[test]
    fn overlapping_and_touching_regions_merge() {
        let mut map = RegionMap::new();
        map.insert(r(100, 10));
        map.insert(r(200, 10));
        map.insert(r(105, 10));
        assert_eq!(map.len(), 2);
        map.insert(r(115, 85));
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![r(100, 110)]);
        assert_eq!(map.total_bytes(), 110);
    }

    #[test]
    fn repeated_capture_is_idempotent() {
        let mut map = RegionMap::new();
        for _ in 0..5 {
            map.insert(r(64, 64));
        }
        map.insert(r(80, 8));
        assert_eq!(map.len(), 1);
        assert!(map.covers(r(64, 64)));
        assert!(!map.covers(r(60, 8)));
        assert!(!map.covers(r(120, 16)));
    }

    #[test]
    fn empty_regions_are_ignored() {
        let mut map = RegionMap::new();
        map.insert(r(64, 0));
        assert!(map.is_empty());
        assert!(map.covers(r(10, 0)));
    }
}
