use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::admin::error::AdminError;
use crate::admin::options::AdminOpenOptions;
use crate::admin::Result;
use crate::primitives::seg::Segment;
use crate::storage::alloc::Allocator;
use crate::storage::btree::{check_tree, BytewiseOps};
use crate::storage::dict::SegDict;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Segment header, allocator lists and the dictionary tree.
    Fast,
    /// Everything in `Fast` plus every tree registered in the dictionary.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Structural damage.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Chunks on the allocator's list of all chunks.
    pub chunks: u64,
    /// Chunks on the free list.
    pub free_chunks: u64,
    /// Payload bytes in allocated chunks.
    pub used_bytes: u64,
    /// Dictionary entries.
    pub dict_entries: u64,
    /// Registered trees that were walked.
    pub trees_checked: u64,
    /// Nodes visited across the dictionary and registered trees.
    pub tree_nodes: u64,
    /// Key/value pairs visited across the dictionary and registered trees.
    pub tree_items: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without any error finding.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the structures examined.
    pub counts: VerifyCounts,
}

/// Validates the image at `path`.
///
/// Damage is reported as findings; only a missing or unreadable file is an
/// error. Registered trees are walked with bytewise key order.
pub fn verify(path: impl AsRef<Path>, opts: &AdminOpenOptions, level: VerifyLevel) -> Result<VerifyReport> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(AdminError::missing_image(path));
    }
    let bytes = fs::read(path)?;
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();

    match Segment::from_image(bytes) {
        Ok(seg) => check_segment(Arc::new(seg), opts, level, &mut findings, &mut counts),
        Err(err) => push_error(&mut findings, format!("segment header: {err}")),
    }

    let success = !findings
        .iter()
        .any(|finding| finding.severity == VerifySeverity::Error);
    tracing::info!(
        target: "segstore::admin",
        path = %path.display(),
        ?level,
        success,
        findings = findings.len(),
        "verification finished"
    );
    Ok(VerifyReport {
        level,
        success,
        findings,
        counts,
    })
}

fn check_segment(
    seg: Arc<Segment>,
    opts: &AdminOpenOptions,
    level: VerifyLevel,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) {
    let alloc = Arc::new(Allocator::init(seg.clone(), opts.allocator.clone()));
    if !alloc.is_created() {
        push_error(findings, "allocator header missing");
        return;
    }
    if let Err(err) = alloc.check() {
        push_error(findings, format!("allocator: {err}"));
        return;
    }
    let stats = alloc.stats();
    counts.chunks = stats.chunks_nr;
    counts.free_chunks = stats.free_chunks_nr;
    counts.used_bytes = stats.used;

    let root = match seg.header() {
        Ok(header) => header.dict_root,
        Err(err) => {
            push_error(findings, format!("segment header: {err}"));
            return;
        }
    };
    let Some(root) = root else {
        push_finding(findings, VerifyFinding::warning("segment has no dictionary"));
        return;
    };
    let summary = {
        let pin = seg.pin_read();
        check_tree(&pin, root, &BytewiseOps)
    };
    match summary {
        Ok(summary) => {
            counts.dict_entries = summary.items;
            counts.tree_nodes += summary.nodes;
            counts.tree_items += summary.items;
        }
        Err(err) => {
            push_error(findings, format!("dictionary tree at {root}: {err}"));
            return;
        }
    }
    if level == VerifyLevel::Fast {
        return;
    }

    let entries = SegDict::open(seg.clone(), alloc, opts.btree.clone()).and_then(|dict| dict.list(""));
    let entries = match entries {
        Ok(entries) => entries,
        Err(err) => {
            push_error(findings, format!("dictionary entries: {err}"));
            return;
        }
    };
    let mut seen = BTreeSet::new();
    for (name, addr) in entries {
        if !seen.insert(addr) {
            push_error(findings, format!("tree {name:?} shares header {addr} with another entry"));
            continue;
        }
        let summary = {
            let pin = seg.pin_read();
            check_tree(&pin, addr, &BytewiseOps)
        };
        match summary {
            Ok(summary) => {
                counts.trees_checked += 1;
                counts.tree_nodes += summary.nodes;
                counts.tree_items += summary.items;
            }
            Err(err) => push_error(findings, format!("tree {name:?} at {addr}: {err}")),
        }
        if findings.len() >= MAX_FINDINGS {
            break;
        }
    }
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    push_finding(findings, VerifyFinding::error(message));
}

fn push_finding(findings: &mut Vec<VerifyFinding>, finding: VerifyFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}
