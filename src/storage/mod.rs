//! Transactional storage core.
//!
//! Everything here lives inside one [`Segment`](crate::primitives::seg::Segment)
//! and reports each modified byte range to the caller's transaction.

/// First-fit chunk allocator over the segment space.
pub mod alloc;

/// Persistent B-tree built on allocator chunks.
///
/// Node store, insert/delete algorithms, cursors and in-place anchors.
pub mod btree;

/// Credit bounds for allocator and B-tree operations.
pub mod credit;

/// Named roots stored in a B-tree whose header hangs off the segment header.
pub mod dict;
