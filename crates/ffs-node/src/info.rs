//! In-memory NAT record for one node id.

use bitflags::bitflags;
use ffs_ondisk::RawNatEntry;
use ffs_types::{BlockAddr, Nid};

bitflags! {
    /// Cache-only state of a NAT entry; never persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NatFlags: u8 {
        /// Mapping matches the last checkpoint.
        const IS_CHECKPOINTED = 1 << 0;
        /// The owning inode's node was written by an fsync.
        const HAS_FSYNCED_INODE = 1 << 1;
        /// Latest write of this node completed an fsync.
        const HAS_LAST_FSYNC = 1 << 2;
        /// Mapping changed since the last checkpoint flush.
        const IS_DIRTY = 1 << 3;
    }
}

impl NatFlags {
    /// State of an entry that matches the checkpoint: checkpointed, last
    /// write fsync-complete, no fsynced inode, clean.
    #[must_use]
    pub fn checkpointed() -> Self {
        Self::IS_CHECKPOINTED | Self::HAS_LAST_FSYNC
    }
}

/// One NAT entry as seen by the cache.
///
/// `nid` never changes after construction; `blk_addr` changes only through
/// [`crate::NatCache::update_blkaddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    nid: Nid,
    pub ino: Nid,
    pub blk_addr: BlockAddr,
    pub version: u8,
    pub flags: NatFlags,
}

impl NodeInfo {
    #[must_use]
    pub fn new(nid: Nid, ino: Nid, blk_addr: BlockAddr, version: u8) -> Self {
        Self {
            nid,
            ino,
            blk_addr,
            version,
            flags: NatFlags::checkpointed(),
        }
    }

    /// Build from an on-disk entry. Flags start in the checkpointed state.
    #[must_use]
    pub fn from_raw(nid: Nid, raw: &RawNatEntry) -> Self {
        Self::new(nid, raw.ino, raw.block_addr, raw.version)
    }

    #[must_use]
    pub fn to_raw(&self) -> RawNatEntry {
        RawNatEntry {
            ino: self.ino,
            block_addr: self.blk_addr,
            version: self.version,
        }
    }

    #[must_use]
    pub fn nid(&self) -> Nid {
        self.nid
    }

    /// Advance the 8-bit version, wrapping at 255.
    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(NatFlags::IS_DIRTY)
    }

    #[must_use]
    pub fn is_checkpointed(&self) -> bool {
        self.flags.contains(NatFlags::IS_CHECKPOINTED)
    }

    pub fn set_flag(&mut self, flag: NatFlags, on: bool) {
        self.flags.set(flag, on);
    }

    /// Same persisted mapping (ino, address, version) as `other`.
    #[must_use]
    pub fn same_mapping(&self, other: &Self) -> bool {
        self.nid == other.nid
            && self.ino == other.ino
            && self.blk_addr == other.blk_addr
            && self.version == other.version
    }
}
