#![forbid(unsafe_code)]

//! Image-level administration.
//!
//! A segment lives in memory; these helpers persist it as an image file,
//! report on it and verify it without trusting its contents.

mod error;
mod image;
mod options;
mod stats;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Image files: formatting, loading, transactional commits and named trees.
pub use image::{format_image, open_image, SegImage};

/// Options applied when an image is formatted or opened.
pub use options::AdminOpenOptions;

/// Segment, allocator and dictionary usage report.
pub use stats::{stats, DictionaryStatsSection, SegmentStatsSection, StatsReport, TreeStatsEntry};

/// Structural verification that reports damage as findings.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};
