//! Transactional chunk allocator and persistent B-tree over a flat segment.
//!
//! The [`storage`] layer holds the core: a first-fit allocator, a B-tree
//! built on its chunks, credit accounting and the segment dictionary.
//! [`primitives`] provides the segment, transaction and completion-object
//! collaborators the core consumes. [`admin`] and [`config`] persist
//! segments as image files and drive the `segctl` tool.

#![warn(missing_docs)]

pub mod admin;
pub mod config;
/// Crate-wide error type and the fatal-precondition path.
pub mod error;
pub mod primitives;
pub mod storage;
pub mod types;

pub use error::{Result, StoreError};
