//! Node block footer and node-tree offset layout.
//!
//! Every node block (inode, direct, indirect) ends with a 24-byte footer:
//!
//! | Offset | Field | Size |
//! |--------|-------|------|
//! | 0x00 | nid | u32 |
//! | 0x04 | ino | u32 |
//! | 0x08 | flag | u32 |
//! | 0x0C | cp_ver | u64 |
//! | 0x14 | next_blkaddr | u32 |
//!
//! The flag word packs the node's offset in its file's node tree into bits
//! `[31:OFFSET_BIT_SHIFT]` and independent marker bits below it. Offset
//! updates are read-modify-write: the markers survive unless a reset is
//! requested.

use bitflags::bitflags;
use ffs_types::{
    BLOCK_SIZE, BlockAddr, CheckpointVersion, COLD_BIT_SHIFT, DENT_BIT_SHIFT, FSYNC_BIT_SHIFT,
    INODE_NID_OFFSET, INODE_NID_SLOTS, NIDS_PER_BLOCK, NODE_DIR1_BLOCK, NODE_FOOTER_OFFSET, Nid,
    OFFSET_BIT_MASK, OFFSET_BIT_SHIFT, ParseError, XATTR_NODE_OFFSET, read_le_u32, read_le_u64,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Marker bits stored below the offset field of the footer flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeMarks: u32 {
        /// Node belongs to a non-directory (cold) file.
        const COLD = 1 << COLD_BIT_SHIFT;
        /// Last direct node written by an fsync.
        const FSYNC = 1 << FSYNC_BIT_SHIFT;
        /// Direct node written by fsync while a dentry was pending.
        const DENTRY = 1 << DENT_BIT_SHIFT;
    }
}

/// Replace the offset bits of `flag_word`.
///
/// With `reset` the word starts from zero; otherwise every bit below
/// `OFFSET_BIT_SHIFT` is carried over unchanged.
#[must_use]
pub fn encode_offset(flag_word: u32, new_offset: u32, reset: bool) -> u32 {
    let old = if reset { 0 } else { flag_word };
    (new_offset << OFFSET_BIT_SHIFT) | (old & OFFSET_BIT_MASK)
}

/// Typed view of the footer flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FooterFlag(u32);

impl FooterFlag {
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Offset of the node within its file's node tree.
    #[must_use]
    pub fn offset(self) -> u32 {
        self.0 >> OFFSET_BIT_SHIFT
    }

    #[must_use]
    pub fn with_offset(self, offset: u32, reset: bool) -> Self {
        Self(encode_offset(self.0, offset, reset))
    }

    #[must_use]
    pub fn marks(self) -> NodeMarks {
        NodeMarks::from_bits_truncate(self.0 & OFFSET_BIT_MASK)
    }

    #[must_use]
    pub fn has(self, mark: NodeMarks) -> bool {
        self.marks().contains(mark)
    }

    #[must_use]
    pub fn with_mark(self, mark: NodeMarks, on: bool) -> Self {
        if on {
            Self(self.0 | mark.bits())
        } else {
            Self(self.0 & !mark.bits())
        }
    }
}

/// Decoded node footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFooter {
    pub nid: Nid,
    pub ino: Nid,
    pub flag: FooterFlag,
    pub cp_ver: CheckpointVersion,
    /// Next block of an fsync recovery chain.
    pub next_blkaddr: BlockAddr,
}

impl NodeFooter {
    /// Decode the footer of a full node block.
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() > BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "node_block",
                reason: "longer than one block",
            });
        }
        let base = NODE_FOOTER_OFFSET;
        Ok(Self {
            nid: Nid(read_le_u32(block, base)?),
            ino: Nid(read_le_u32(block, base + 0x04)?),
            flag: FooterFlag(read_le_u32(block, base + 0x08)?),
            cp_ver: CheckpointVersion(read_le_u64(block, base + 0x0C)?),
            next_blkaddr: BlockAddr(read_le_u32(block, base + 0x14)?),
        })
    }

    /// Encode into the footer area of `block`, leaving the body untouched.
    pub fn write_to_block(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let base = NODE_FOOTER_OFFSET;
        write_le_u32(block, base, self.nid.0)?;
        write_le_u32(block, base + 0x04, self.ino.0)?;
        write_le_u32(block, base + 0x08, self.flag.0)?;
        write_le_u64(block, base + 0x0C, self.cp_ver.0)?;
        write_le_u32(block, base + 0x14, self.next_blkaddr.0)
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.flag.offset()
    }

    /// The inode block of a file carries its own nid as owner.
    #[must_use]
    pub fn is_inode(&self) -> bool {
        self.nid == self.ino
    }
}

// ── Node-tree shape ─────────────────────────────────────────────────────────
//
// offset 0                 inode
// offsets 1, 2             direct nodes (i_nid[0], i_nid[1])
// offset 3                 indirect (i_nid[2]), followed by N direct nodes
// offset 4 + N             indirect (i_nid[3]), followed by N direct nodes
// offset 5 + 2N            double indirect (i_nid[4])
// offset 6 + 2N + k(N + 1) indirect children of the double indirect node,
//                          each followed by N direct nodes

/// Kind of node block at a given node-tree offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Inode,
    Direct,
    Indirect,
    DoubleIndirect,
    Xattr,
}

#[must_use]
pub fn is_xattr_offset(offset: u32) -> bool {
    offset == XATTR_NODE_OFFSET
}

/// Whether the node at `offset` holds data block addresses.
#[must_use]
pub fn is_direct_node(offset: u32) -> bool {
    if is_xattr_offset(offset) {
        return false;
    }
    if offset == 3 || offset == 4 + NIDS_PER_BLOCK || offset == 5 + 2 * NIDS_PER_BLOCK {
        return false;
    }
    if offset >= 6 + 2 * NIDS_PER_BLOCK {
        let rel = offset - (6 + 2 * NIDS_PER_BLOCK);
        if rel % (NIDS_PER_BLOCK + 1) == 0 {
            return false;
        }
    }
    true
}

#[must_use]
pub fn classify_node(offset: u32) -> NodeKind {
    if offset == 0 {
        NodeKind::Inode
    } else if is_xattr_offset(offset) {
        NodeKind::Xattr
    } else if offset == 5 + 2 * NIDS_PER_BLOCK {
        NodeKind::DoubleIndirect
    } else if is_direct_node(offset) {
        NodeKind::Direct
    } else {
        NodeKind::Indirect
    }
}

/// Byte offset of a child-nid slot.
///
/// For an inode block `slot` is a node-tree offset in
/// `NODE_DIR1_BLOCK..NODE_DIR1_BLOCK + 5` addressing `i_nid[]`; for an
/// indirect block it indexes `nid[0..NIDS_PER_BLOCK]`.
pub fn nid_slot_offset(slot: u32, in_inode: bool) -> Result<usize, ParseError> {
    if in_inode {
        let idx = slot
            .checked_sub(NODE_DIR1_BLOCK)
            .map(|idx| idx as usize)
            .filter(|idx| *idx < INODE_NID_SLOTS)
            .ok_or(ParseError::InvalidField {
                field: "i_nid",
                reason: "slot outside NODE_DIR1_BLOCK..+5",
            })?;
        Ok(INODE_NID_OFFSET + idx * 4)
    } else if slot < NIDS_PER_BLOCK {
        Ok(slot as usize * 4)
    } else {
        Err(ParseError::InvalidField {
            field: "nid",
            reason: "slot beyond NIDS_PER_BLOCK",
        })
    }
}

pub fn read_nid_slot(block: &[u8], slot: u32, in_inode: bool) -> Result<Nid, ParseError> {
    read_le_u32(block, nid_slot_offset(slot, in_inode)?).map(Nid)
}

pub fn write_nid_slot(block: &mut [u8], slot: u32, in_inode: bool, nid: Nid) -> Result<(), ParseError> {
    write_le_u32(block, nid_slot_offset(slot, in_inode)?, nid.0)
}
