#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Block and node layout ───────────────────────────────────────────────────

/// Size of every metadata block (NAT blocks and node blocks).
pub const BLOCK_SIZE: usize = 4096;
pub const LOG_BLOCK_SIZE: u32 = 12;

/// Packed NAT entry: `{ino: u32, block_addr: u32, version: u8, reserved: [u8; 3]}`.
pub const NAT_ENTRY_SIZE: usize = 12;
/// NAT entries held by one NAT block.
pub const NAT_ENTRY_PER_BLOCK: u32 = (BLOCK_SIZE / NAT_ENTRY_SIZE) as u32;

/// Node footer: `{nid, ino, flag, cp_ver: u64, next_blkaddr}`.
pub const NODE_FOOTER_SIZE: usize = 24;
/// Byte offset of the footer inside a node block.
pub const NODE_FOOTER_OFFSET: usize = BLOCK_SIZE - NODE_FOOTER_SIZE;

/// Node ids (or data addresses) held by a direct/indirect node block.
pub const NIDS_PER_BLOCK: u32 = ((BLOCK_SIZE - NODE_FOOTER_SIZE) / 4) as u32;

/// Data addresses held inline by an inode block.
pub const DEF_ADDRS_PER_INODE: u32 = 923;
/// Node-id slots at the tail of an inode block (2 direct, 2 indirect, 1 double).
pub const INODE_NID_SLOTS: usize = 5;
/// Byte offset of `i_nid[0]` inside an inode block.
pub const INODE_NID_OFFSET: usize = NODE_FOOTER_OFFSET - INODE_NID_SLOTS * 4;
/// Block offset (in the file's node tree) addressed by `i_nid[0]`.
pub const NODE_DIR1_BLOCK: u32 = DEF_ADDRS_PER_INODE + 1;

// ── Footer flag word ────────────────────────────────────────────────────────

pub const COLD_BIT_SHIFT: u32 = 0;
pub const FSYNC_BIT_SHIFT: u32 = 1;
pub const DENT_BIT_SHIFT: u32 = 2;
pub const OFFSET_BIT_SHIFT: u32 = 3;
/// Marker bits below the offset field.
pub const OFFSET_BIT_MASK: u32 = (1 << OFFSET_BIT_SHIFT) - 1;
/// Node offset reserved for the xattr node (every offset bit set).
pub const XATTR_NODE_OFFSET: u32 = u32::MAX >> OFFSET_BIT_SHIFT;

// ── Free nid scanning ───────────────────────────────────────────────────────

/// NAT blocks read per free-nid scan.
pub const FREE_NID_PAGES: u32 = 4;

// ── NAT journal ─────────────────────────────────────────────────────────────

/// NAT updates that fit in the checkpoint summary area.
pub const NAT_JOURNAL_ENTRIES: usize = 32;
/// `{nid: u32, nat entry}`.
pub const NAT_JOURNAL_ENTRY_SIZE: usize = 4 + NAT_ENTRY_SIZE;
/// `n_nats: u16` header plus the fixed record array.
pub const NAT_JOURNAL_SIZE: usize = 2 + NAT_JOURNAL_ENTRIES * NAT_JOURNAL_ENTRY_SIZE;

/// Node identifier: logical name of one node block.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Nid(pub u32);

impl Nid {
    /// nid 0 is reserved and never allocated.
    pub const RESERVED: Self = Self(0);

    /// NAT block holding this nid's entry (also the dirty-set key).
    #[must_use]
    pub fn nat_block(self) -> NatBlockIndex {
        NatBlockIndex(self.0 / NAT_ENTRY_PER_BLOCK)
    }

    /// First nid stored in the same NAT block.
    #[must_use]
    pub fn start_of_block(self) -> Self {
        Self(self.0 / NAT_ENTRY_PER_BLOCK * NAT_ENTRY_PER_BLOCK)
    }

    /// Slot of this nid inside its NAT block.
    #[must_use]
    pub fn slot_in_block(self) -> usize {
        (self.0 % NAT_ENTRY_PER_BLOCK) as usize
    }
}

/// Physical block address (32-bit, as stored in NAT entries and footers).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockAddr(pub u32);

impl BlockAddr {
    /// Unallocated / invalid; a NAT entry holding it marks a free nid.
    pub const NULL: Self = Self(0);
    /// Reserved for a node that exists but has not been written yet.
    pub const NEW: Self = Self(u32::MAX);

    /// A real on-disk address (neither sentinel).
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::NULL && self != Self::NEW
    }

    /// Byte offset of this block on a device with `BLOCK_SIZE` blocks.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) << LOG_BLOCK_SIZE
    }
}

/// Index of a NAT block within the logical table (`nid / NAT_ENTRY_PER_BLOCK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NatBlockIndex(pub u32);

impl NatBlockIndex {
    #[must_use]
    pub fn first_nid(self) -> Nid {
        Nid(self.0 * NAT_ENTRY_PER_BLOCK)
    }
}

/// Checkpoint version stamped into node footers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointVersion(pub u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    match offset.checked_add(len) {
        Some(end) if end <= data.len() => Ok(&mut data[offset..end]),
        Some(_) => Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        }),
        None => Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        }),
    }
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => f.write_str("NULL_ADDR"),
            Self::NEW => f.write_str("NEW_ADDR"),
            Self(addr) => write!(f, "{addr}"),
        }
    }
}

impl fmt::Display for NatBlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CheckpointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
