//! NAT entries, NAT blocks and the NAT journal region.
//!
//! A NAT block is `NAT_ENTRY_PER_BLOCK` packed 12-byte entries; the
//! remaining tail bytes of the block are padding and are preserved as-is
//! when an entry is rewritten in place.

use ffs_types::{
    BLOCK_SIZE, BlockAddr, NAT_ENTRY_PER_BLOCK, NAT_ENTRY_SIZE, NAT_JOURNAL_ENTRIES,
    NAT_JOURNAL_ENTRY_SIZE, NAT_JOURNAL_SIZE, Nid, ParseError, ensure_slice, read_le_u16,
    read_le_u32, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// On-disk NAT entry: `{ino: u32 LE, block_addr: u32 LE, version: u8, reserved: [u8; 3]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RawNatEntry {
    pub ino: Nid,
    pub block_addr: BlockAddr,
    pub version: u8,
}

impl RawNatEntry {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let bytes = ensure_slice(bytes, 0, NAT_ENTRY_SIZE)?;
        Ok(Self {
            ino: Nid(read_le_u32(bytes, 0x00)?),
            block_addr: BlockAddr(read_le_u32(bytes, 0x04)?),
            version: bytes[0x08],
        })
    }

    /// Encode with zeroed reserved bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; NAT_ENTRY_SIZE] {
        let mut out = [0_u8; NAT_ENTRY_SIZE];
        out[0x00..0x04].copy_from_slice(&self.ino.0.to_le_bytes());
        out[0x04..0x08].copy_from_slice(&self.block_addr.0.to_le_bytes());
        out[0x08] = self.version;
        out
    }
}

/// One NAT block, edited in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatBlock {
    bytes: Vec<u8>,
}

impl NatBlock {
    /// A block whose entries are all free (`NULL_ADDR`).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            bytes: vec![0_u8; BLOCK_SIZE],
        }
    }

    pub fn parse_from_bytes(bytes: Vec<u8>) -> Result<Self, ParseError> {
        if bytes.len() != BLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    fn slot_offset(slot: usize) -> Result<usize, ParseError> {
        if slot >= NAT_ENTRY_PER_BLOCK as usize {
            return Err(ParseError::InvalidField {
                field: "nat_slot",
                reason: "slot beyond NAT_ENTRY_PER_BLOCK",
            });
        }
        Ok(slot * NAT_ENTRY_SIZE)
    }

    pub fn entry(&self, slot: usize) -> Result<RawNatEntry, ParseError> {
        let offset = Self::slot_offset(slot)?;
        RawNatEntry::parse_from_bytes(ensure_slice(&self.bytes, offset, NAT_ENTRY_SIZE)?)
    }

    pub fn set_entry(&mut self, slot: usize, entry: &RawNatEntry) -> Result<(), ParseError> {
        let offset = Self::slot_offset(slot)?;
        self.bytes[offset..offset + NAT_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        Ok(())
    }

    /// All entries in slot order.
    pub fn entries(&self) -> impl Iterator<Item = RawNatEntry> + '_ {
        self.bytes
            .chunks_exact(NAT_ENTRY_SIZE)
            .take(NAT_ENTRY_PER_BLOCK as usize)
            .filter_map(|chunk| RawNatEntry::parse_from_bytes(chunk).ok())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Decode the NAT journal region: `n_nats: u16` then `{nid, entry}` records.
pub fn parse_nat_journal(bytes: &[u8]) -> Result<Vec<(Nid, RawNatEntry)>, ParseError> {
    let count = usize::from(read_le_u16(bytes, 0)?);
    if count > NAT_JOURNAL_ENTRIES {
        return Err(ParseError::InvalidField {
            field: "n_nats",
            reason: "exceeds NAT_JOURNAL_ENTRIES",
        });
    }
    let mut out = Vec::with_capacity(count);
    for idx in 0..count {
        let base = 2 + idx * NAT_JOURNAL_ENTRY_SIZE;
        let nid = Nid(read_le_u32(bytes, base)?);
        let entry = RawNatEntry::parse_from_bytes(ensure_slice(bytes, base + 4, NAT_ENTRY_SIZE)?)?;
        out.push((nid, entry));
    }
    Ok(out)
}

/// Encode journal records into a fixed `NAT_JOURNAL_SIZE` region.
pub fn encode_nat_journal(records: &[(Nid, RawNatEntry)]) -> Result<Vec<u8>, ParseError> {
    if records.len() > NAT_JOURNAL_ENTRIES {
        return Err(ParseError::InvalidField {
            field: "n_nats",
            reason: "exceeds NAT_JOURNAL_ENTRIES",
        });
    }
    let mut out = vec![0_u8; NAT_JOURNAL_SIZE];
    let count = u16::try_from(records.len())
        .map_err(|_| ParseError::IntegerConversion { field: "n_nats" })?;
    write_le_u16(&mut out, 0, count)?;
    for (idx, (nid, entry)) in records.iter().enumerate() {
        let base = 2 + idx * NAT_JOURNAL_ENTRY_SIZE;
        write_le_u32(&mut out, base, nid.0)?;
        out[base + 4..base + 4 + NAT_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn entry_layout_is_little_endian_with_reserved_tail() {
        let entry = RawNatEntry {
            ino: Nid(0x0102_0304),
            block_addr: BlockAddr(0x0A0B_0C0D),
            version: 7,
        };
        assert_eq!(
            entry.to_bytes(),
            [0x04, 0x03, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A, 7, 0, 0, 0]
        );
    }

    #[test]
    fn nat_block_set_entry_preserves_neighbours_and_padding() {
        let mut raw = vec![0xEE_u8; BLOCK_SIZE];
        raw[..NAT_ENTRY_SIZE].copy_from_slice(&[0; NAT_ENTRY_SIZE]);
        let mut block = NatBlock::parse_from_bytes(raw).expect("block");
        let entry = RawNatEntry {
            ino: Nid(3),
            block_addr: BlockAddr(500),
            version: 1,
        };
        block.set_entry(1, &entry).expect("set");

        assert_eq!(block.entry(1), Ok(entry));
        assert_eq!(block.entry(0).expect("slot 0").block_addr, BlockAddr::NULL);
        assert!(block.as_bytes()[2 * NAT_ENTRY_SIZE..3 * NAT_ENTRY_SIZE]
            .iter()
            .all(|b| *b == 0xEE));
        let padding = NAT_ENTRY_PER_BLOCK as usize * NAT_ENTRY_SIZE;
        assert!(block.as_bytes()[padding..].iter().all(|b| *b == 0xEE));
        assert_eq!(block.entries().count(), NAT_ENTRY_PER_BLOCK as usize);
    }

    #[test]
    fn nat_block_rejects_bad_sizes_and_slots() {
        assert!(NatBlock::parse_from_bytes(vec![0; 100]).is_err());
        let mut block = NatBlock::empty();
        assert!(block.entry(NAT_ENTRY_PER_BLOCK as usize).is_err());
        assert!(block
            .set_entry(NAT_ENTRY_PER_BLOCK as usize, &RawNatEntry::default())
            .is_err());
    }

    #[test]
    fn journal_region_round_trips_and_bounds_count() {
        let records = vec![
            (
                Nid(9),
                RawNatEntry {
                    ino: Nid(9),
                    block_addr: BlockAddr(77),
                    version: 2,
                },
            ),
            (Nid(40), RawNatEntry::default()),
        ];
        let bytes = encode_nat_journal(&records).expect("encode");
        assert_eq!(bytes.len(), NAT_JOURNAL_SIZE);
        assert_eq!(parse_nat_journal(&bytes), Ok(records));

        let mut bogus = vec![0_u8; NAT_JOURNAL_SIZE];
        bogus[0..2].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(parse_nat_journal(&bogus).is_err());

        let too_many = vec![(Nid(1), RawNatEntry::default()); NAT_JOURNAL_ENTRIES + 1];
        assert!(encode_nat_journal(&too_many).is_err());
    }

    proptest! {
        #[test]
        fn raw_entry_decode_inverts_encode(ino in any::<u32>(), addr in any::<u32>(), version in any::<u8>()) {
            let entry = RawNatEntry { ino: Nid(ino), block_addr: BlockAddr(addr), version };
            prop_assert_eq!(RawNatEntry::parse_from_bytes(&entry.to_bytes()), Ok(entry));
        }
    }
}
