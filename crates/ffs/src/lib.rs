#![forbid(unsafe_code)]
//! Public API facade for the node address table core.
//!
//! Re-exports the node manager and the types needed to drive it through a
//! stable external interface. Consumers (inode and extent-tree readers,
//! node writeback, the checkpoint manager) depend on this crate only.

pub use ffs_block::{
    BlockBuf, BlockDevice, FileBlockDevice, MemBlockDevice, PageCache,
    WritebackCache,
};
pub use ffs_error::{FfsError, Result};
pub use ffs_node::{
    FlushStats, NatCheckpoint, NatFlags, NatGeometry, NodeInfo, NodeManager, NodeManagerOptions,
    NodePage,
};
pub use ffs_ondisk::{NodeFooter, NodeKind, NodeMarks, classify_node, is_direct_node};
pub use ffs_types::{BlockAddr, CheckpointVersion, NatBlockIndex, Nid};

/// Lower-level building blocks for callers that manage their own locking.
pub mod raw {
    pub use ffs_node::{
        DirtySets, FlushSet, FreeNidPool, NatBitmap, NatCache, NatEntrySet, NatJournal,
        NatScanSource, NidState,
    };
    pub use ffs_ondisk::{NatBlock, RawNatEntry, encode_offset};
}
