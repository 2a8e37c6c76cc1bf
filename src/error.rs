use thiserror::Error;
use tracing::error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by segment, allocator and B-tree operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure while reading or writing an image.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted structure failed magic, version or checksum validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Lookup target is absent.
    #[error("not found")]
    NotFound,
    /// Insert target is already present.
    #[error("already exists")]
    Exists,
    /// Allocator space is exhausted.
    #[error("no space for {requested} bytes")]
    NoSpace {
        /// Payload size that could not be satisfied.
        requested: u64,
    },
    /// Prepared credit exceeds what a single transaction may reserve.
    #[error("transaction credit too large ({reg_nr} regions, {reg_size} bytes)")]
    TxTooLarge {
        /// Number of regions requested.
        reg_nr: u64,
        /// Number of bytes requested.
        reg_size: u64,
    },
}

/// Aborts on a violated precondition.
///
/// Double frees, out-of-protocol calls, damaged on-segment structures and
/// credit under-reservation all end here: the durable state can no longer
/// be trusted, so the process stops instead of continuing.
#[track_caller]
pub fn fatal(what: &str) -> ! {
    error!(target: "segstore::fatal", reason = what, "fatal precondition violation");
    panic!("segstore fatal: {what}");
}

/// Unwraps a structure load, treating any decode error as fatal.
#[track_caller]
pub(crate) fn intact<T>(res: Result<T>, what: &str) -> T {
    match res {
        Ok(value) => value,
        Err(err) => {
            error!(target: "segstore::fatal", error = %err, "{what}");
            fatal(what)
        }
    }
}
