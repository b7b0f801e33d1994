//! Double-buffer NAT bitmap and address resolution.
//!
//! Each logical NAT block has two physical copies, one in each segment of a
//! segment pair. One bit per block (most-significant bit first within each
//! byte) selects the copy that is current. The bit flips only after the
//! other copy has been durably written during a checkpoint flush.

use ffs_error::{FfsError, Result};
use ffs_types::{BlockAddr, NatBlockIndex, Nid};

use crate::options::NatGeometry;

// ── Bit helpers ─────────────────────────────────────────────────────────────

fn test_bit(bits: &[u8], idx: usize) -> bool {
    bits.get(idx / 8)
        .is_some_and(|byte| byte & (0x80 >> (idx % 8)) != 0)
}

fn toggle_bit(bits: &mut [u8], idx: usize) {
    if let Some(byte) = bits.get_mut(idx / 8) {
        *byte ^= 0x80 >> (idx % 8);
    }
}

// ── Resolver ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatBitmap {
    geometry: NatGeometry,
    bits: Vec<u8>,
}

impl NatBitmap {
    /// Wrap a persisted bitmap. Its length must be exactly `bitmap_size`.
    pub fn new(geometry: NatGeometry, bits: Vec<u8>) -> Result<Self> {
        geometry.validate()?;
        if bits.len() != geometry.bitmap_size() {
            return Err(FfsError::Format(format!(
                "NAT bitmap is {} bytes, geometry requires {}",
                bits.len(),
                geometry.bitmap_size()
            )));
        }
        Ok(Self { geometry, bits })
    }

    /// Fresh bitmap with every block on its primary copy.
    pub fn zeroed(geometry: NatGeometry) -> Result<Self> {
        let size = geometry.bitmap_size();
        Self::new(geometry, vec![0; size])
    }

    #[must_use]
    pub fn geometry(&self) -> &NatGeometry {
        &self.geometry
    }

    fn check_block(&self, index: NatBlockIndex) -> Result<usize> {
        if index.0 >= self.geometry.nat_blocks() {
            return Err(FfsError::InvalidNid {
                nid: index.first_nid().0,
                max_nid: self.geometry.max_nid(),
            });
        }
        Ok(index.0 as usize)
    }

    /// Whether `index` currently lives in the secondary copy.
    pub fn is_set(&self, index: NatBlockIndex) -> Result<bool> {
        let idx = self.check_block(index)?;
        Ok(test_bit(&self.bits, idx))
    }

    /// Current physical address of NAT block `index`.
    pub fn resolve_block(&self, index: NatBlockIndex) -> Result<BlockAddr> {
        let idx = self.check_block(index)?;
        let log = self.geometry.log_blocks_per_seg;
        let block_off = index.0;
        let seg_off = block_off >> log;
        let mut addr = self.geometry.nat_blkaddr.0
            + ((seg_off << log) << 1)
            + (block_off & (self.geometry.blocks_per_seg() - 1));
        if test_bit(&self.bits, idx) {
            addr += self.geometry.blocks_per_seg();
        }
        Ok(BlockAddr(addr))
    }

    /// Current physical address of the NAT block holding `nid`.
    pub fn resolve(&self, nid: Nid) -> Result<BlockAddr> {
        if nid.0 >= self.geometry.max_nid() {
            return Err(FfsError::InvalidNid {
                nid: nid.0,
                max_nid: self.geometry.max_nid(),
            });
        }
        self.resolve_block(nid.nat_block())
    }

    /// Address of the other copy of the NAT block stored at `current`.
    pub fn mirror_address(&self, current: BlockAddr) -> Result<BlockAddr> {
        let start = self.geometry.nat_blkaddr.0;
        if current.0 < start || u64::from(current.0) >= self.geometry.end_blkaddr() {
            return Err(FfsError::Format(format!(
                "block {current} is outside the NAT area"
            )));
        }
        let rel = current.0 - start;
        let per_seg = self.geometry.blocks_per_seg();
        let rel = if (rel >> self.geometry.log_blocks_per_seg) % 2 == 1 {
            rel - per_seg
        } else {
            rel + per_seg
        };
        Ok(BlockAddr(start + rel))
    }

    /// Switch NAT block `index` to its other copy.
    pub fn flip_block(&mut self, index: NatBlockIndex) -> Result<()> {
        let idx = self.check_block(index)?;
        toggle_bit(&mut self.bits, idx);
        Ok(())
    }

    pub fn flip(&mut self, nid: Nid) -> Result<()> {
        if nid.0 >= self.geometry.max_nid() {
            return Err(FfsError::InvalidNid {
                nid: nid.0,
                max_nid: self.geometry.max_nid(),
            });
        }
        self.flip_block(nid.nat_block())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Bulk copy for the checkpoint image.
    #[must_use]
    pub fn copy_out(&self) -> Vec<u8> {
        self.bits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_types::NAT_ENTRY_PER_BLOCK;
    use proptest::prelude::*;

    fn geometry() -> NatGeometry {
        NatGeometry {
            nat_blkaddr: BlockAddr(1000),
            log_blocks_per_seg: 2,
            nat_segments: 4,
        }
    }

    #[test]
    fn bitmap_size_is_checked() {
        assert!(NatBitmap::new(geometry(), vec![0; 5]).is_err());
        let bitmap = NatBitmap::zeroed(geometry()).expect("bitmap");
        assert_eq!(bitmap.as_bytes().len(), 1);
    }

    #[test]
    fn resolves_primary_copies_across_segment_pairs() {
        let bitmap = NatBitmap::zeroed(geometry()).expect("bitmap");
        // 4 blocks per segment; logical blocks 0..4 live in segment 0,
        // 4..8 in segment 2 (segments 1 and 3 hold the mirrors).
        assert_eq!(bitmap.resolve_block(NatBlockIndex(0)).expect("ok"), BlockAddr(1000));
        assert_eq!(bitmap.resolve_block(NatBlockIndex(3)).expect("ok"), BlockAddr(1003));
        assert_eq!(bitmap.resolve_block(NatBlockIndex(4)).expect("ok"), BlockAddr(1008));
        assert_eq!(bitmap.resolve_block(NatBlockIndex(7)).expect("ok"), BlockAddr(1011));
        assert!(bitmap.resolve_block(NatBlockIndex(8)).is_err());
    }

    #[test]
    fn bits_are_most_significant_first() {
        let bitmap = NatBitmap::new(geometry(), vec![0b0100_0000]).expect("bitmap");
        assert!(!bitmap.is_set(NatBlockIndex(0)).expect("ok"));
        assert!(bitmap.is_set(NatBlockIndex(1)).expect("ok"));
        assert_eq!(bitmap.resolve_block(NatBlockIndex(1)).expect("ok"), BlockAddr(1005));
    }

    #[test]
    fn flip_moves_to_mirror_and_back() {
        let mut bitmap = NatBitmap::zeroed(geometry()).expect("bitmap");
        let nid = Nid(5 * NAT_ENTRY_PER_BLOCK + 7);
        let original = bitmap.resolve(nid).expect("resolve");
        let mirror = bitmap.mirror_address(original).expect("mirror");
        assert_ne!(original, mirror);

        bitmap.flip(nid).expect("flip");
        assert_eq!(bitmap.resolve(nid).expect("ok"), mirror);
        assert_eq!(bitmap.mirror_address(mirror).expect("ok"), original);

        bitmap.flip(nid).expect("flip");
        assert_eq!(bitmap.resolve(nid).expect("ok"), original);
    }

    #[test]
    fn out_of_range_requests_are_rejected() {
        let mut bitmap = NatBitmap::zeroed(geometry()).expect("bitmap");
        let max = geometry().max_nid();
        assert!(matches!(
            bitmap.resolve(Nid(max)),
            Err(FfsError::InvalidNid { .. })
        ));
        assert!(bitmap.flip(Nid(max)).is_err());
        assert!(bitmap.mirror_address(BlockAddr(999)).is_err());
        assert!(bitmap.mirror_address(BlockAddr(1016)).is_err());
    }

    proptest! {
        #[test]
        fn mirror_never_equals_current(bits in any::<u8>(), block in 0_u32..8) {
            let bitmap = NatBitmap::new(geometry(), vec![bits]).expect("bitmap");
            let current = bitmap.resolve_block(NatBlockIndex(block)).expect("resolve");
            let mirror = bitmap.mirror_address(current).expect("mirror");
            prop_assert_ne!(current, mirror);
            prop_assert_eq!(bitmap.mirror_address(mirror).expect("mirror"), current);
        }

        #[test]
        fn double_flip_restores_resolution(bits in any::<u8>(), block in 0_u32..8) {
            let mut bitmap = NatBitmap::new(geometry(), vec![bits]).expect("bitmap");
            let index = NatBlockIndex(block);
            let before = bitmap.resolve_block(index).expect("resolve");
            bitmap.flip_block(index).expect("flip");
            bitmap.flip_block(index).expect("flip");
            prop_assert_eq!(bitmap.resolve_block(index).expect("resolve"), before);
            prop_assert_eq!(bitmap.as_bytes(), &[bits][..]);
        }
    }
}
