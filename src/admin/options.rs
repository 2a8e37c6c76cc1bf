use crate::primitives::tx::TxOptions;
use crate::storage::alloc::AllocatorOptions;
use crate::storage::btree::BTreeOptions;

/// Options applied when an image is formatted or opened.
#[derive(Clone, Debug, Default)]
pub struct AdminOpenOptions {
    /// Allocator checks and statistics.
    pub allocator: AllocatorOptions,
    /// Options for the dictionary and for trees opened through the image.
    pub btree: BTreeOptions,
    /// Limits for transactions started with [`SegImage::begin_tx`](crate::admin::SegImage::begin_tx).
    pub tx: TxOptions,
}
