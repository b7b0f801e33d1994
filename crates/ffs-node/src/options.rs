//! Mount-time tuning and NAT geometry.

use ffs_error::{FfsError, Result};
use ffs_types::{BlockAddr, FREE_NID_PAGES, NAT_ENTRY_PER_BLOCK};
use serde::{Deserialize, Serialize};

/// Tuning knobs for one mounted node manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeManagerOptions {
    /// NAT blocks read per free-nid scan.
    pub free_nid_pages: u32,
    /// A scan is skipped while more NEW nids than this are pooled.
    pub free_nid_low_water: usize,
    /// A scan stops once this many NEW nids are pooled.
    pub free_nid_high_water: usize,
    /// Clean cache entries kept while the page cache reports pressure.
    pub nat_cache_soft_limit: usize,
    /// Flush small dirty batches into the checkpoint NAT journal.
    pub use_nat_journal: bool,
}

impl Default for NodeManagerOptions {
    fn default() -> Self {
        Self {
            free_nid_pages: FREE_NID_PAGES,
            free_nid_low_water: NAT_ENTRY_PER_BLOCK as usize,
            free_nid_high_water: (NAT_ENTRY_PER_BLOCK * FREE_NID_PAGES) as usize,
            nat_cache_soft_limit: 4096,
            use_nat_journal: true,
        }
    }
}

impl NodeManagerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.free_nid_pages == 0 {
            return Err(FfsError::InvalidGeometry(
                "free_nid_pages must be non-zero".into(),
            ));
        }
        if self.free_nid_high_water == 0 {
            return Err(FfsError::InvalidGeometry(
                "free_nid_high_water must be non-zero".into(),
            ));
        }
        if self.free_nid_low_water > self.free_nid_high_water {
            return Err(FfsError::InvalidGeometry(format!(
                "free_nid_low_water {} exceeds free_nid_high_water {}",
                self.free_nid_low_water, self.free_nid_high_water
            )));
        }
        Ok(())
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Location and size of the double-buffered NAT area.
///
/// The area is laid out as pairs of segments: segment `2k` and `2k + 1`
/// hold the two copies of the NAT blocks `[k * blocks_per_seg, (k + 1) *
/// blocks_per_seg)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatGeometry {
    /// First block of the NAT area.
    pub nat_blkaddr: BlockAddr,
    pub log_blocks_per_seg: u32,
    /// Segments in the NAT area, both copies included.
    pub nat_segments: u32,
}

impl NatGeometry {
    pub fn validate(&self) -> Result<()> {
        if self.log_blocks_per_seg == 0 || self.log_blocks_per_seg > 16 {
            return Err(FfsError::InvalidGeometry(format!(
                "log_blocks_per_seg {} out of range 1..=16",
                self.log_blocks_per_seg
            )));
        }
        if self.nat_segments == 0 || self.nat_segments % 2 != 0 {
            return Err(FfsError::InvalidGeometry(format!(
                "nat_segments {} must be a non-zero even count",
                self.nat_segments
            )));
        }
        let blocks = u64::from(self.nat_segments) << self.log_blocks_per_seg;
        let end = u64::from(self.nat_blkaddr.0) + blocks;
        if end >= u64::from(BlockAddr::NEW.0) {
            return Err(FfsError::InvalidGeometry(format!(
                "NAT area [{}, {end}) overflows the block address space",
                self.nat_blkaddr.0
            )));
        }
        if u64::from(self.nat_blocks()) * u64::from(NAT_ENTRY_PER_BLOCK) > u64::from(u32::MAX) {
            return Err(FfsError::InvalidGeometry(
                "NAT addresses more nids than fit in 32 bits".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn blocks_per_seg(&self) -> u32 {
        1 << self.log_blocks_per_seg
    }

    /// Logical NAT blocks (one copy).
    #[must_use]
    pub fn nat_blocks(&self) -> u32 {
        (self.nat_segments / 2) << self.log_blocks_per_seg
    }

    /// First nid past the end of the table.
    #[must_use]
    pub fn max_nid(&self) -> u32 {
        self.nat_blocks().saturating_mul(NAT_ENTRY_PER_BLOCK)
    }

    /// Bytes of the double-buffer bitmap.
    #[must_use]
    pub fn bitmap_size(&self) -> usize {
        (self.nat_blocks() as usize).div_ceil(8)
    }

    /// One past the last block of the NAT area.
    #[must_use]
    pub fn end_blkaddr(&self) -> u64 {
        u64::from(self.nat_blkaddr.0) + (u64::from(self.nat_segments) << self.log_blocks_per_seg)
    }
}
