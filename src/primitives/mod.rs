//! Collaborators the storage core is built on.
//!
//! The segment, transaction and completion-object types here are deliberately
//! small: they provide exactly the contract the allocator and B-tree consume.

/// Addressable segment with pinned access.
///
/// Holds the segment header and the allocator space.
pub mod seg;

/// Transactions, credit and region capture.
pub mod tx;

/// Completion objects with explicit states.
pub mod op;
