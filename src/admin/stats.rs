use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::admin::image::load_segment;
use crate::admin::options::AdminOpenOptions;
use crate::admin::Result;
use crate::storage::alloc::{Allocator, AllocatorStats};
use crate::storage::btree::{check_tree, BytewiseOps, TreeSummary};
use crate::storage::dict::SegDict;

/// Sectioned usage report for one image file.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Segment header and file facts.
    pub segment: SegmentStatsSection,
    /// Allocator space usage and call counters.
    pub allocator: AllocatorStats,
    /// Dictionary and registered trees.
    pub dictionary: DictionaryStatsSection,
}

#[derive(Debug, Clone, Serialize)]
#[allow(missing_docs)]
pub struct SegmentStatsSection {
    pub path: String,
    pub file_size_bytes: u64,
    pub size: u64,
    pub version: u32,
    pub dict_root: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[allow(missing_docs)]
pub struct DictionaryStatsSection {
    pub entries: u64,
    pub height: u16,
    pub fanout: u16,
    pub trees: Vec<TreeStatsEntry>,
}

/// One dictionary entry with the shape of the tree it names.
#[derive(Debug, Clone, Serialize)]
pub struct TreeStatsEntry {
    /// Registered name.
    pub name: String,
    /// Tree header address.
    pub header: u64,
    /// Shape of the tree; absent when it does not validate as a bytewise tree.
    pub summary: Option<TreeSummary>,
}

/// Collects a [`StatsReport`] for the image at `path`.
///
/// The allocator and the dictionary tree are checked first; damage there is
/// reported as an error rather than summarised.
pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let seg = Arc::new(load_segment(path)?);
    let header = seg.header()?;
    let file_size_bytes = fs::metadata(path)?.len();

    let alloc = Arc::new(Allocator::init(seg.clone(), opts.allocator.clone()));
    alloc.check()?;
    let allocator = alloc.stats();

    if let Some(root) = header.dict_root {
        let pin = seg.pin_read();
        check_tree(&pin, root, &BytewiseOps)?;
    }
    let dict = SegDict::open(seg.clone(), alloc, opts.btree.clone())?;
    let mut trees = Vec::new();
    for (name, addr) in dict.list("")? {
        let summary = {
            let pin = seg.pin_read();
            check_tree(&pin, addr, &BytewiseOps).ok()
        };
        trees.push(TreeStatsEntry {
            name,
            header: addr.get(),
            summary,
        });
    }

    Ok(StatsReport {
        segment: SegmentStatsSection {
            path: path.display().to_string(),
            file_size_bytes,
            size: header.size,
            version: header.version,
            dict_root: header.dict_root.map(|addr| addr.get()),
        },
        allocator,
        dictionary: DictionaryStatsSection {
            entries: dict.len(),
            height: dict.tree().height(),
            fanout: dict.tree().fanout(),
            trees,
        },
    })
}
